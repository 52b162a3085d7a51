//! Fixed-size pools of worker tasks with tracked join handles.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct WorkerPool {
    name: &'static str,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers. Each receives its index and a child of
    /// `shutdown`; a worker is expected to return once the token is
    /// cancelled.
    pub fn spawn<F, Fut>(
        name: &'static str,
        size: usize,
        shutdown: &CancellationToken,
        make: F,
    ) -> Self
    where
        F: Fn(usize, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let size = size.max(1);
        let handles = (0..size)
            .map(|index| {
                let token = shutdown.child_token();
                let worker = make(index, token);
                tokio::spawn(async move {
                    worker.await;
                    debug!(pool = name, worker = index, "Worker exited");
                })
            })
            .collect();
        info!(pool = name, workers = size, "Worker pool started");
        WorkerPool { name, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to exit. Panicked workers are logged.
    pub async fn join(self) {
        for (index, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(pool = self.name, worker = index, error = %e, "Worker task failed");
            }
        }
        info!(pool = self.name, "Worker pool stopped");
    }
}
