//! The admission gate: per-channel rate limiting.
//!
//! Every decision for every channel runs inside one critical section: read
//! the current policy snapshot, compare against the channel's last-admitted
//! time, update the time on admission and persist the map. The lock is a
//! tokio mutex so persistence can happen on the blocking pool without
//! releasing it; two admissions can therefore never interleave their
//! check-and-update.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{AdmissionRule, RateLimitPolicy};
use crate::alert::{AlertKind, Alerter};
use crate::persistence::{StateStores, StoreError};
use crate::types::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admitted,
    /// Rejected; the channel may be admitted again at `next_allowed`.
    RateLimited { next_allowed: DateTime<Utc> },
    Disabled,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// The rejected notification should be passed downstream.
    pub forward: bool,
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admitted
    }
}

/// The pure part of a decision: the verdict and whether to update the
/// channel's timestamp.
pub fn decide(
    rule: AdmissionRule,
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    manual: bool,
) -> (Verdict, bool) {
    match rule {
        AdmissionRule::Disabled => (Verdict::Disabled, false),
        // Operator submissions bypass rate limits and leave the clock alone.
        _ if manual => (Verdict::Admitted, false),
        AdmissionRule::ZeroGap => (Verdict::Admitted, true),
        AdmissionRule::Interval(interval) => match last {
            Some(last) if now.signed_duration_since(last) < interval => (
                Verdict::RateLimited {
                    next_allowed: last
                        .checked_add_signed(interval)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                },
                false,
            ),
            _ => (Verdict::Admitted, true),
        },
    }
}

pub struct AdmissionGate {
    last_admitted: Mutex<HashMap<ChannelId, DateTime<Utc>>>,
    policy: watch::Receiver<RateLimitPolicy>,
    stores: Arc<StateStores>,
    alerter: Alerter,
    shutdown: CancellationToken,
}

impl AdmissionGate {
    /// Creates the gate with the persisted last-admitted times.
    pub fn open(
        stores: Arc<StateStores>,
        policy: watch::Receiver<RateLimitPolicy>,
        alerter: Alerter,
        shutdown: CancellationToken,
    ) -> Result<Self, StoreError> {
        let last_admitted = stores.admissions.load()?;
        info!(channels = last_admitted.len(), "Loaded admission state");
        Ok(AdmissionGate {
            last_admitted: Mutex::new(last_admitted),
            policy,
            stores,
            alerter,
            shutdown,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy.borrow().clone()
    }

    pub async fn last_admitted(&self, channel: &ChannelId) -> Option<DateTime<Utc>> {
        self.last_admitted.lock().await.get(channel).copied()
    }

    pub async fn admit(&self, channel: &ChannelId, manual: bool, now: DateTime<Utc>) -> Decision {
        let mut last_admitted = self.last_admitted.lock().await;

        if self.shutdown.is_cancelled() {
            return Decision {
                verdict: Verdict::ShuttingDown,
                forward: false,
            };
        }

        let (rule, forwards) = {
            let policy = self.policy.borrow();
            (policy.rule_for(channel), policy.forwards(channel))
        };
        let (verdict, update) = decide(rule, last_admitted.get(channel).copied(), now, manual);

        if update {
            last_admitted.insert(channel.clone(), now);
            let snapshot = last_admitted.clone();
            let stores = Arc::clone(&self.stores);
            let saved =
                tokio::task::spawn_blocking(move || stores.admissions.save(&snapshot)).await;
            let error = match saved {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(error) = error {
                warn!(channel = %channel, error, "Failed to persist admission state");
                self.alerter.raise(
                    AlertKind::StateWrite,
                    format!("could not persist admission of {}: {}", channel, error),
                );
            }
        }

        let forward = !manual && verdict != Verdict::Admitted && forwards;
        debug!(channel = %channel, ?rule, ?verdict, forward, manual, "Admission decision");
        Decision { verdict, forward }
    }
}
