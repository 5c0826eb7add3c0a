//! Worker supervisor: owns the polling tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span};

use crate::worker::runner::JobWorker;

/// Starts and tracks `worker_count` polling loops over one [`JobWorker`].
pub struct WorkerSupervisor {
    worker: Arc<JobWorker>,
    worker_count: usize,
    poll_interval: Duration,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(worker: Arc<JobWorker>, worker_count: usize, poll_interval: Duration) -> Self {
        Self {
            worker,
            worker_count: worker_count.max(1),
            poll_interval,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Spawn the worker loops. Idempotent: returns `false` and does nothing
    /// if they are already running.
    pub async fn start(&self) -> bool {
        let mut handles = self.handles.write().await;
        if handles.iter().any(|h| !h.is_finished()) {
            return false;
        }
        handles.clear();

        for index in 0..self.worker_count {
            let worker = Arc::clone(&self.worker);
            let poll_interval = self.poll_interval;
            let span = info_span!("worker", index);
            handles.push(tokio::spawn(
                async move { worker.run(poll_interval).await }.instrument(span),
            ));
        }

        info!(
            workers = self.worker_count,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Job workers started"
        );
        true
    }

    pub async fn is_running(&self) -> bool {
        self.handles.read().await.iter().any(|h| !h.is_finished())
    }

    /// Abort all worker loops. A job being processed stays `processing`.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}
