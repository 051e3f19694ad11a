use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::orchestrator::Orchestrator;
use crate::queue::IngestionQueue;
use crate::worker::report::WorkerReport;

/// Pause after a failed dequeue before polling again.
const DEQUEUE_BACKOFF: Duration = Duration::from_millis(500);

/// Threads that pull admission messages off the queue and drive each job
/// through the orchestrator. Jobs run independently of one another.
pub struct WorkerPool {
    result_receiver: Receiver<WorkerReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn IngestionQueue>,
        worker_count: usize,
        poll_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }

        let (result_sender, result_receiver) = bounded::<WorkerReport>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                worker_id,
                orchestrator: Arc::clone(&orchestrator),
                queue: Arc::clone(&queue),
                result_sender: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                poll_timeout,
            };

            let spawned = thread::Builder::new()
                .name(format!("labflow-worker-{}", worker_id))
                .spawn(move || run_worker(ctx));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_result(&self) -> Option<WorkerReport> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<WorkerReport> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Blocks until every worker has finished its current job and exited.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// A handle that stops the pool from another thread, e.g. a signal
    /// handler.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

struct WorkerContext {
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn IngestionQueue>,
    result_sender: Sender<WorkerReport>,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
}

fn run_worker(ctx: WorkerContext) {
    let worker_id = ctx.worker_id;
    debug!("Worker {} started", worker_id);

    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let delivery = match ctx.queue.dequeue(ctx.poll_timeout) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!("Worker {} failed to dequeue: {}", worker_id, e);
                thread::sleep(DEQUEUE_BACKOFF);
                continue;
            }
        };

        let message_id = delivery.token.message_id.clone();
        let job_id = delivery.message.job_id.clone();
        debug!(
            "Worker {} processing job {} (delivery {})",
            worker_id, job_id, delivery.receive_count
        );

        let report = match ctx.orchestrator.handle_delivery(ctx.queue.as_ref(), delivery) {
            Ok(outcome) => WorkerReport::completed(worker_id, &message_id, outcome),
            Err(e) => {
                error!("Worker {} could not process job {}: {}", worker_id, job_id, e);
                WorkerReport::errored(worker_id, &message_id, &job_id, e.to_string())
            }
        };

        match ctx.result_sender.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                debug!(
                    "Worker {} dropped report for job {}, nobody is reading results",
                    worker_id, report.job_id
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Worker {} result channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
