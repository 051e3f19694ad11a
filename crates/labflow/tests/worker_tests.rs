//! Worker pool driven from an on-disk pipeline configuration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{standard_pipeline, TestHarness};
use labflow::orchestrator::Orchestrator;
use labflow::{load_config, Database, JobOutcome, JobStatus, WorkerPool};

#[test]
fn pool_drains_queue_and_completes_jobs() {
    let harness = TestHarness::new();
    let (registry, handlers) = standard_pipeline();
    let orchestrator = Arc::new(harness.orchestrator(registry));

    let ids = ["a", "b", "c", "d", "e"];
    for id in ids {
        harness.enqueue(id);
    }

    let pool = WorkerPool::start(
        Arc::clone(&orchestrator),
        harness.queue_dyn(),
        3,
        Duration::from_millis(20),
    )
    .unwrap();

    let mut finished = Vec::new();
    while finished.len() < ids.len() {
        let report = pool
            .recv_result_timeout(Duration::from_secs(10))
            .expect("worker report");
        assert!(report.is_success(), "report: {:?}", report);
        finished.push(report.job_id);
    }
    pool.shutdown();
    pool.wait();

    finished.sort();
    assert_eq!(finished, ids.to_vec());
    assert_eq!(harness.store.counts().unwrap().succeeded, ids.len() as u64);
    assert_eq!(handlers.total_calls(), 8 * ids.len() as u32);
}

#[cfg(unix)]
#[test]
fn configured_command_stages_run_end_to_end() {
    let harness = TestHarness::new();
    let db_path = harness.path().join("pipeline.db");
    let config_path = harness.path().join("pipeline.json");
    let config_json = format!(
        r#"{{
            "version": "1.0",
            "database_path": "{}",
            "worker_count": 1,
            "stages": [
                {{
                    "name": "parse",
                    "command": "sh",
                    "args": ["-c", "cat >/dev/null; echo '{{\"rows\": 96}}'"],
                    "progress": 50
                }},
                {{
                    "name": "report",
                    "command": "sh",
                    "args": ["-c", "cat"],
                    "input": {{ "params": "none", "upstream": ["parse"] }}
                }}
            ]
        }}"#,
        db_path.display()
    );
    std::fs::write(&config_path, config_json).unwrap();

    let config = load_config(&config_path).unwrap();
    let db = Database::open(&config.resolved_database_path().unwrap()).unwrap();
    let store = config.build_store(db.clone());
    let queue = config.build_queue(db);
    let orchestrator =
        Orchestrator::new(Arc::new(config.build_registry().unwrap()), store.clone());

    store
        .create_if_absent("j1", "user-1", &labflow::InputParams::new("raw/user-1/a.csv"))
        .unwrap();
    let outcome = orchestrator.run_job("j1").unwrap();
    assert!(matches!(outcome, JobOutcome::Succeeded { .. }), "{:?}", outcome);

    let job = store.read("j1").unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.stage_output("parse").unwrap()["rows"], 96);
    // `cat` echoes its input: the report saw only the parse result.
    let report = job.stage_output("report").unwrap();
    assert_eq!(report["upstream"]["parse"]["rows"], 96);
    assert!(report.get("params").is_none());
    assert_eq!(labflow::IngestionQueue::depth(&queue).unwrap().visible, 0);
}
