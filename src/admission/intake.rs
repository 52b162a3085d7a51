//! From a parsed notification to a queued fetch task.
//!
//! Order of checks for one event:
//!
//! 1. Shutdown: nothing is admitted once it has begun.
//! 2. Dedup: items in the history or already in flight are acknowledged as
//!    duplicates. The in-flight claim is taken here, before the gate, so a
//!    re-delivery racing the original cannot consume the channel's slot.
//! 3. The [`AdmissionGate`] decision; rejections may be forwarded.
//! 4. `try_push` onto the fetch queue; a full queue drops the event and
//!    raises an alert.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::forward::Forwarder;
use super::gate::{AdmissionGate, Verdict};
use crate::alert::{AlertKind, Alerter};
use crate::persistence::StateStores;
use crate::pipeline::{PipelineQueues, QueueError};
use crate::types::{FetchTask, NotificationEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    Accepted,
    Duplicate,
    RateLimited,
    Disabled,
    Dropped,
    ShuttingDown,
}

impl IntakeOutcome {
    /// Body of the webhook response.
    pub fn message(&self) -> &'static str {
        match self {
            IntakeOutcome::Accepted => "OK",
            IntakeOutcome::Duplicate => "Duplicate",
            IntakeOutcome::RateLimited => "Rate limited",
            IntakeOutcome::Disabled => "Channel disabled",
            IntakeOutcome::Dropped => "Dropped",
            IntakeOutcome::ShuttingDown => "Shutting down",
        }
    }
}

pub struct Intake {
    gate: AdmissionGate,
    queues: PipelineQueues,
    stores: Arc<StateStores>,
    forwarder: Option<Forwarder>,
    alerter: Alerter,
}

impl Intake {
    pub fn new(
        gate: AdmissionGate,
        queues: PipelineQueues,
        stores: Arc<StateStores>,
        forwarder: Option<Forwarder>,
        alerter: Alerter,
    ) -> Self {
        Intake {
            gate,
            queues,
            stores,
            forwarder,
            alerter,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn queues(&self) -> &PipelineQueues {
        &self.queues
    }

    #[instrument(
        skip_all,
        fields(
            platform = %event.platform,
            item = %event.item_id,
            channel = %event.channel_id,
            manual = event.manual
        )
    )]
    pub async fn submit(&self, event: NotificationEvent) -> IntakeOutcome {
        if self.gate.is_shutting_down() {
            return IntakeOutcome::ShuttingDown;
        }
        let key = event.key();
        if self.stores.history.is_processed(&key) {
            info!("Already processed");
            return IntakeOutcome::Duplicate;
        }
        let Some(claim) = self.queues.inflight.try_claim(key) else {
            info!("Already in flight");
            return IntakeOutcome::Duplicate;
        };

        let decision = self.gate.admit(&event.channel_id, event.manual, Utc::now()).await;
        if decision.forward
            && let Some(forwarder) = &self.forwarder
        {
            forwarder.forward(&event);
        }
        match decision.verdict {
            Verdict::Admitted => {}
            Verdict::RateLimited { next_allowed } => {
                info!(%next_allowed, forwarded = decision.forward, "Rate limited");
                return IntakeOutcome::RateLimited;
            }
            Verdict::Disabled => {
                info!(forwarded = decision.forward, "Channel disabled");
                return IntakeOutcome::Disabled;
            }
            Verdict::ShuttingDown => return IntakeOutcome::ShuttingDown,
        }

        match self.queues.fetch.try_push(FetchTask { event, claim }) {
            Ok(()) => {
                info!(depth = self.queues.fetch.len(), "Admitted");
                IntakeOutcome::Accepted
            }
            Err(QueueError::Full(task)) => {
                warn!(capacity = self.queues.fetch.capacity(), "Fetch queue full, dropping");
                self.alerter.raise(
                    AlertKind::FetchQueueFull,
                    format!(
                        "fetch queue full (capacity {}), dropped {}",
                        self.queues.fetch.capacity(),
                        task.event.key()
                    ),
                );
                IntakeOutcome::Dropped
            }
            Err(QueueError::Closed(_)) => IntakeOutcome::ShuttingDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::policy::{ChannelOverride, RateLimitPolicy};
    use crate::test_utils::test_stores;
    use crate::types::{ChannelId, ItemId, ItemKey, Platform};
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        intake: Intake,
        queues: PipelineQueues,
        stores: Arc<StateStores>,
        alerts: mpsc::Receiver<crate::alert::Alert>,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn harness(policy: RateLimitPolicy, fetch_capacity: usize) -> Harness {
        let (stores, dir) = test_stores();
        let (_tx, rx) = watch::channel(policy);
        let (alerter, alerts) = Alerter::channel(16);
        let shutdown = CancellationToken::new();
        let gate = AdmissionGate::open(Arc::clone(&stores), rx, alerter.clone(), shutdown.clone())
            .unwrap();
        let queues = PipelineQueues::new(fetch_capacity, 5);
        let intake = Intake::new(gate, queues.clone(), Arc::clone(&stores), None, alerter);
        Harness {
            intake,
            queues,
            stores,
            alerts,
            shutdown,
            _dir: dir,
        }
    }

    fn event(channel: &str, item: &str) -> NotificationEvent {
        NotificationEvent::youtube(ChannelId::new(channel), ItemId::new(item))
    }

    #[tokio::test]
    async fn admitted_event_is_queued_with_claim() {
        let h = harness(RateLimitPolicy::default(), 4);

        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::Accepted);

        assert_eq!(h.queues.fetch.len(), 1);
        assert!(h.queues.inflight.contains(&event("UC1", "a").key()));
    }

    #[tokio::test]
    async fn redelivery_is_duplicate_and_does_not_consume_slot() {
        let policy = RateLimitPolicy::default().with_override("UC1", ChannelOverride::ZeroGap);
        let h = harness(policy, 4);

        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::Accepted);
        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::Duplicate);
        assert_eq!(h.queues.fetch.len(), 1);
    }

    #[tokio::test]
    async fn processed_item_is_duplicate() {
        let h = harness(RateLimitPolicy::default(), 4);
        h.stores
            .history
            .record(&ItemKey::new(Platform::youtube(), ItemId::new("a")))
            .unwrap();

        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::Duplicate);
        assert!(h.queues.fetch.is_empty());
        assert_eq!(h.intake.gate().last_admitted(&ChannelId::new("UC1")).await, None);
    }

    #[tokio::test]
    async fn rate_limited_event_releases_claim() {
        let h = harness(RateLimitPolicy::default(), 4);

        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::Accepted);
        assert_eq!(h.intake.submit(event("UC1", "b")).await, IntakeOutcome::RateLimited);

        assert_eq!(h.queues.fetch.len(), 1);
        assert!(!h.queues.inflight.contains(&event("UC1", "b").key()));
    }

    #[tokio::test]
    async fn disabled_channel_is_rejected() {
        let policy = RateLimitPolicy::default().with_override("UCoff", ChannelOverride::Disabled);
        let h = harness(policy, 4);
        assert_eq!(h.intake.submit(event("UCoff", "a")).await, IntakeOutcome::Disabled);
        assert!(h.queues.fetch.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_promptly_with_alert() {
        let policy = RateLimitPolicy::default().with_override("UC1", ChannelOverride::ZeroGap);
        let mut h = harness(policy, 2);

        for item in ["a", "b"] {
            assert_eq!(h.intake.submit(event("UC1", item)).await, IntakeOutcome::Accepted);
        }
        let dropped = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            h.intake.submit(event("UC1", "c")),
        )
        .await
        .expect("submission never blocks on a full queue");

        assert_eq!(dropped, IntakeOutcome::Dropped);
        assert_eq!(h.alerts.recv().await.unwrap().kind, AlertKind::FetchQueueFull);
        assert!(!h.queues.inflight.contains(&event("UC1", "c").key()));
    }

    #[tokio::test]
    async fn shutdown_rejects_everything() {
        let h = harness(RateLimitPolicy::default(), 4);
        h.shutdown.cancel();
        assert_eq!(h.intake.submit(event("UC1", "a")).await, IntakeOutcome::ShuttingDown);
        assert!(h.queues.inflight.is_empty());
    }

    #[test]
    fn response_messages() {
        assert_eq!(IntakeOutcome::Accepted.message(), "OK");
        assert_eq!(IntakeOutcome::RateLimited.message(), "Rate limited");
        assert_eq!(IntakeOutcome::Disabled.message(), "Channel disabled");
        assert_eq!(IntakeOutcome::Dropped.message(), "Dropped");
    }
}
