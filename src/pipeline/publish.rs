//! Publish stage: hands fetched media to the Publisher.
//!
//! Success records the item in the history and deletes the file. Failure
//! keeps the file for inspection, raises an alert and leaves the item
//! eligible for a later notification.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::fetch::remove_media;
use super::queue::BoundedQueue;
use crate::alert::{AlertKind, Alerter};
use crate::collab::Publisher;
use crate::persistence::StateStores;
use crate::types::PublishTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Failed,
    Abandoned,
}

pub struct PublishStage<P> {
    publisher: P,
    stores: Arc<StateStores>,
    alerter: Alerter,
}

impl<P: Publisher> PublishStage<P> {
    pub fn new(publisher: P, stores: Arc<StateStores>, alerter: Alerter) -> Self {
        PublishStage {
            publisher,
            stores,
            alerter,
        }
    }

    pub async fn run_worker(
        self: Arc<Self>,
        worker: usize,
        queue: BoundedQueue<PublishTask>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                task = queue.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };
            let outcome = self.process(task, &shutdown).await;
            debug!(worker, ?outcome, "Publish task finished");
        }
    }

    #[instrument(skip_all, fields(item = %task.item_id, channel = %task.channel_id))]
    pub async fn process(&self, task: PublishTask, shutdown: &CancellationToken) -> PublishOutcome {
        info!(path = %task.local_path.display(), "Publishing");
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(path = %task.local_path.display(), "Shutdown during publish, keeping media");
                return PublishOutcome::Abandoned;
            }
            result = self.publisher.publish(&task.local_path, &task) => result,
        };

        match result {
            Ok(()) => {
                match self.stores.history.record(&task.key()) {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to record published item");
                        self.alerter.raise(
                            AlertKind::StateWrite,
                            format!("published {} but could not record it: {}", task.key(), e),
                        );
                    }
                }
                remove_media(&task.local_path).await;
                info!("Published");
                PublishOutcome::Published
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %task.local_path.display(),
                    "Publish failed, keeping media"
                );
                self.alerter.raise(
                    AlertKind::PublishFailed,
                    format!(
                        "publishing {} failed, media kept at {}: {}",
                        task.key(),
                        task.local_path.display(),
                        e
                    ),
                );
                PublishOutcome::Failed
            }
        }
    }
}
