//! Test harness for isolated pipeline execution.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use labflow::orchestrator::Orchestrator;
use labflow::pipeline::{Sleeper, StageRegistry};
use labflow::queue::{AdmissionMessage, IngestionQueue, SqliteQueue};
use labflow::{Database, InputParams, JobStore};

/// Records requested delays instead of sleeping.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
    pub store: JobStore,
    pub queue: Arc<SqliteQueue>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("labflow.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        let store = JobStore::new(db.clone());
        let queue = Arc::new(
            SqliteQueue::new(db.clone()).with_poll_interval(Duration::from_millis(5)),
        );

        Self {
            temp_dir,
            db_path,
            db,
            store,
            queue,
            sleeper: Arc::new(RecordingSleeper::default()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Orchestrator over the harness store with the recording sleeper.
    pub fn orchestrator(&self, registry: StageRegistry) -> Orchestrator {
        Orchestrator::new(Arc::new(registry), self.store.clone())
            .with_sleeper(self.sleeper.clone())
            .with_instance_id("test")
    }

    /// Writes a PENDING record directly, bypassing the queue.
    pub fn admit(&self, job_id: &str) {
        self.store
            .create_if_absent(job_id, "user-1", &InputParams::new("raw/user-1/a.csv"))
            .expect("create job");
    }

    pub fn enqueue(&self, job_id: &str) -> String {
        let message =
            AdmissionMessage::new(job_id, "user-1", InputParams::new("raw/user-1/plate.csv"));
        self.queue.enqueue(&message).expect("enqueue")
    }

    pub fn queue_dyn(&self) -> Arc<dyn IngestionQueue> {
        self.queue.clone()
    }
}
