//! Two-stage bounded pipeline: fetch queue → fetch workers → publish queue →
//! publish workers.
//!
//! ```text
//! ingress ──try_push──► [fetch queue] ──► fetch pool ──try_push──► [publish queue] ──► publish pool
//!    │                       cap N           M workers                  cap K            J workers
//!    └─ full: drop + alert                              └─ full: delete file + alert
//! ```
//!
//! Producers never block. Each item holds an [`InFlightClaim`] from admission
//! until it leaves the pipeline.

pub mod blocking;
pub mod fetch;
pub mod inflight;
pub mod pool;
pub mod publish;
pub mod queue;

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::collab::{Fetcher, MetadataSource, Publisher};
use crate::types::{FetchTask, PublishTask};

pub use blocking::{Blocking, BlockingFetcher, BlockingPublisher};
pub use fetch::{FetchOutcome, FetchStage, FetchStageConfig, ItemFilter, SkipReason};
pub use inflight::{InFlightClaim, InFlightSet};
pub use pool::WorkerPool;
pub use publish::{PublishOutcome, PublishStage};
pub use queue::{BoundedQueue, QueueError};

/// Queues and in-flight set shared between ingress, stages and status.
#[derive(Debug, Clone)]
pub struct PipelineQueues {
    pub fetch: BoundedQueue<FetchTask>,
    pub publish: BoundedQueue<PublishTask>,
    pub inflight: InFlightSet,
}

impl PipelineQueues {
    pub fn new(fetch_capacity: usize, publish_capacity: usize) -> Self {
        PipelineQueues {
            fetch: BoundedQueue::new(fetch_capacity),
            publish: BoundedQueue::new(publish_capacity),
            inflight: InFlightSet::new(),
        }
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            fetch: self.fetch.len(),
            fetch_capacity: self.fetch.capacity(),
            publish: self.publish.len(),
            publish_capacity: self.publish.capacity(),
            in_flight: self.inflight.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub fetch: usize,
    pub fetch_capacity: usize,
    pub publish: usize,
    pub publish_capacity: usize,
    pub in_flight: usize,
}

/// Running worker pools of both stages.
pub struct Pipeline {
    queues: PipelineQueues,
    fetch_pool: WorkerPool,
    publish_pool: WorkerPool,
}

impl Pipeline {
    pub fn start<F, M, P>(
        queues: PipelineQueues,
        fetch: FetchStage<F, M>,
        fetch_workers: usize,
        publish: PublishStage<P>,
        publish_workers: usize,
        shutdown: &CancellationToken,
    ) -> Self
    where
        F: Fetcher,
        M: MetadataSource,
        P: Publisher,
    {
        let fetch = Arc::new(fetch);
        let publish = Arc::new(publish);

        let fetch_queue = queues.fetch.clone();
        let fetch_pool = WorkerPool::spawn("fetch", fetch_workers, shutdown, |index, token| {
            Arc::clone(&fetch).run_worker(index, fetch_queue.clone(), token)
        });
        let publish_queue = queues.publish.clone();
        let publish_pool = WorkerPool::spawn("publish", publish_workers, shutdown, |index, token| {
            Arc::clone(&publish).run_worker(index, publish_queue.clone(), token)
        });

        Pipeline {
            queues,
            fetch_pool,
            publish_pool,
        }
    }

    pub fn queues(&self) -> &PipelineQueues {
        &self.queues
    }

    /// Waits for both pools after shutdown, then closes the queues. Tasks
    /// still queued are discarded; their claims are released and fetched
    /// media stays on disk.
    pub async fn join(self) {
        self.fetch_pool.join().await;
        self.publish_pool.join().await;
        let fetch = self.queues.fetch.close().await;
        let publish = self.queues.publish.close().await;
        info!(
            discarded_fetch = fetch,
            discarded_publish = publish,
            "Pipeline stopped"
        );
    }
}
