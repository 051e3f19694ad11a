//! labflow-worker: drains the ingestion queue and drives admitted jobs.
//!
//! Usage: `labflow-worker <pipeline.json>` (or `LABFLOW_CONFIG`).
//! `RUST_LOG` sets the filter, `LABFLOW_LOG_FORMAT=json` switches to JSON
//! lines.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use labflow::orchestrator::Orchestrator;
use labflow::telemetry::{init_logging, LogFormat};
use labflow::{
    load_config, Database, IngestionQueue, JobEventBroadcaster, JobOutcome, LabflowError,
    WorkerPool,
};

/// Stalled jobs resumed per startup pass.
const RECOVERY_BATCH: u64 = 100;

fn main() -> ExitCode {
    let format = std::env::var("LABFLOW_LOG_FORMAT")
        .map(|v| LogFormat::from_env_value(&v))
        .unwrap_or_default();
    if let Err(e) = init_logging("info", format) {
        eprintln!("labflow-worker: {}", e);
        return ExitCode::FAILURE;
    }

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), LabflowError> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LABFLOW_CONFIG").ok())
        .map(PathBuf::from)
        .ok_or_else(|| labflow::ConfigError::Validation {
            message: "usage: labflow-worker <pipeline.json>".to_string(),
        })?;

    let config = load_config(&config_path)?;
    info!(path = %config_path.display(), stages = config.stages.len(), "loaded pipeline config");

    let db_path = config
        .resolved_database_path()
        .ok_or_else(|| labflow::ConfigError::Validation {
            message: "database_path is not set and no home directory was found".to_string(),
        })?;
    let db = Database::open(&db_path)?;

    let registry = Arc::new(config.build_registry()?);
    let store = config.build_store(db.clone());
    let queue: Arc<dyn IngestionQueue> = Arc::new(config.build_queue(db));

    let events = JobEventBroadcaster::default();
    let orchestrator = Arc::new(
        Orchestrator::new(registry, store)
            .with_error_handler(config.error_handler())
            .with_completion_notifier(config.completion_notifier())
            .with_events(events),
    );

    let recovered = orchestrator.recover_stalled(RECOVERY_BATCH)?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "resumed stalled jobs");
    }

    let pool = WorkerPool::start(
        Arc::clone(&orchestrator),
        Arc::clone(&queue),
        config.worker_count,
        config.poll_timeout(),
    )?;

    let shutdown = pool.shutdown_flag();
    if let Err(e) = ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed)) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    info!(workers = config.worker_count, "labflow worker running");

    while !pool.is_shutdown() {
        let Some(report) = pool.recv_result_timeout(Duration::from_millis(500)) else {
            continue;
        };
        match &report.result {
            Ok(JobOutcome::Succeeded { job_id }) => info!(%job_id, "job succeeded"),
            Ok(JobOutcome::Failed { job_id, error }) => {
                warn!(%job_id, stage = %error.stage, error = %error.message, "job failed")
            }
            Ok(JobOutcome::Skipped { job_id, reason }) => {
                info!(%job_id, ?reason, "duplicate execution skipped")
            }
            Err(e) => warn!(job_id = %report.job_id, error = %e, "delivery left for redelivery"),
        }
    }

    info!("shutdown requested, waiting for running jobs");
    pool.wait();

    match queue.depth() {
        Ok(depth) => info!(
            visible = depth.visible,
            in_flight = depth.in_flight,
            dead_lettered = depth.dead_lettered,
            "queue depth at shutdown"
        ),
        Err(e) => warn!(error = %e, "could not read queue depth"),
    }
    Ok(())
}
