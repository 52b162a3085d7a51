//! Subscription reconciliation.
//!
//! # Algorithm
//!
//! 1. Load the persisted subscribed set
//! 2. `subscribe` every channel in `desired - subscribed`
//! 3. `unsubscribe` every channel in `subscribed - desired`
//! 4. Persist `desired` as the new subscribed set, even if some calls failed
//!
//! A call that still fails after its retries raises an alert and the batch
//! moves on. Channels whose subscribe failed are persisted anyway; the next
//! renewal pass re-issues `subscribe` for them.
//!
//! Reconcile and renewal passes take the same pass lock, so a renewal never
//! interleaves with a reconcile that is rewriting the set. A renewal pass
//! works on the snapshot loaded when it starts.
//!
//! A pass that freshly subscribed every desired channel counts as a renewal
//! and stamps the renewal clock. Scheduled renewals re-check the clock once
//! they hold the pass lock, so a first start does not subscribe everything
//! twice.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::client::{HubClient, HubMode};
use super::renewal::time_until_due;
use crate::alert::{AlertKind, Alerter};
use crate::persistence::{StateStores, StoreError};
use crate::retry::{RetryConfig, RetryResult, retry};
use crate::types::ChannelId;

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subscribed: Vec<ChannelId>,
    pub unsubscribed: Vec<ChannelId>,
    pub failed: Vec<(ChannelId, HubMode)>,
}

impl ReconcileReport {
    /// Number of channels a hub call was attempted for.
    pub fn attempted(&self) -> usize {
        self.subscribed.len() + self.unsubscribed.len() + self.failed.len()
    }

    fn record(&mut self, channel: &ChannelId, mode: HubMode, ok: bool) {
        match (ok, mode) {
            (true, HubMode::Subscribe) => self.subscribed.push(channel.clone()),
            (true, HubMode::Unsubscribe) => self.unsubscribed.push(channel.clone()),
            (false, mode) => self.failed.push((channel.clone(), mode)),
        }
    }
}

pub struct Reconciler<H> {
    hub: H,
    stores: Arc<StateStores>,
    alerter: Alerter,
    retry: RetryConfig,
    pass_lock: Mutex<()>,
}

impl<H: HubClient> Reconciler<H> {
    pub fn new(hub: H, stores: Arc<StateStores>, alerter: Alerter, retry: RetryConfig) -> Self {
        Reconciler {
            hub,
            stores,
            alerter,
            retry,
            pass_lock: Mutex::new(()),
        }
    }

    /// Currently persisted subscribed set.
    pub fn subscribed(&self) -> Result<BTreeSet<ChannelId>, StoreError> {
        self.stores.subscriptions.load()
    }

    /// Time of the last completed renewal pass.
    pub fn last_renewed(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.stores.renewal.last_renewed()
    }

    /// Converges the hub and the persisted set on `desired`.
    #[instrument(skip_all, fields(desired = desired.len()))]
    pub async fn reconcile(
        &self,
        desired: &BTreeSet<ChannelId>,
        callback_url: &str,
    ) -> Result<ReconcileReport, StoreError> {
        let _pass = self.pass_lock.lock().await;

        let subscribed = self.stores.subscriptions.load()?;
        let mut report = ReconcileReport::default();

        for channel in desired.difference(&subscribed) {
            let ok = self.call(HubMode::Subscribe, channel, callback_url).await;
            report.record(channel, HubMode::Subscribe, ok);
        }
        for channel in subscribed.difference(desired) {
            let ok = self.call(HubMode::Unsubscribe, channel, callback_url).await;
            report.record(channel, HubMode::Unsubscribe, ok);
        }

        if let Err(e) = self.stores.subscriptions.save(desired) {
            self.alerter.raise(
                AlertKind::StateWrite,
                format!("failed to persist subscribed channels: {}", e),
            );
            return Err(e);
        }

        if !desired.is_empty()
            && report.subscribed.len() == desired.len()
            && let Err(e) = self.stores.renewal.mark_renewed(Utc::now())
        {
            warn!(error = %e, "Cannot stamp renewal clock, next renewal comes early");
        }

        info!(
            subscribed = report.subscribed.len(),
            unsubscribed = report.unsubscribed.len(),
            failed = report.failed.len(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Re-issues `subscribe` for every persisted channel and stamps the
    /// renewal clock.
    #[instrument(skip_all)]
    pub async fn renew(&self, callback_url: &str) -> Result<ReconcileReport, StoreError> {
        let _pass = self.pass_lock.lock().await;
        self.renew_locked(callback_url).await
    }

    /// Like [`Reconciler::renew`], but skips the pass when another pass
    /// stamped the clock less than `interval` ago.
    #[instrument(skip_all)]
    pub async fn renew_if_due(
        &self,
        callback_url: &str,
        interval: Duration,
    ) -> Result<Option<ReconcileReport>, StoreError> {
        let _pass = self.pass_lock.lock().await;
        let last = self.stores.renewal.last_renewed()?;
        if !time_until_due(last, Utc::now(), interval).is_zero() {
            debug!("Renewal no longer due, skipping pass");
            return Ok(None);
        }
        self.renew_locked(callback_url).await.map(Some)
    }

    async fn renew_locked(&self, callback_url: &str) -> Result<ReconcileReport, StoreError> {
        let snapshot = self.stores.subscriptions.load()?;
        let mut report = ReconcileReport::default();
        for channel in &snapshot {
            let ok = self.call(HubMode::Subscribe, channel, callback_url).await;
            report.record(channel, HubMode::Subscribe, ok);
        }

        self.stores.renewal.mark_renewed(Utc::now())?;
        info!(
            renewed = report.subscribed.len(),
            failed = report.failed.len(),
            "Renewal pass complete"
        );
        Ok(report)
    }

    /// One hub call with bounded retry. Returns true on success.
    async fn call(&self, mode: HubMode, channel: &ChannelId, callback_url: &str) -> bool {
        let hub = &self.hub;
        let result = retry(self.retry, move || hub.request(mode, channel, callback_url)).await;
        match result {
            RetryResult::Success(()) => {
                info!(channel = %channel, mode = %mode, "Hub request accepted");
                true
            }
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                warn!(
                    channel = %channel,
                    mode = %mode,
                    attempts,
                    error = %last_error,
                    "Hub request failed after retries"
                );
                self.alerter.raise(
                    AlertKind::HubFailure,
                    format!(
                        "{} {} failed after {} attempts: {}",
                        mode, channel, attempts, last_error
                    ),
                );
                false
            }
            RetryResult::PermanentError(e) => {
                warn!(channel = %channel, mode = %mode, error = %e, "Hub request rejected");
                self.alerter
                    .raise(AlertKind::HubFailure, format!("{} {} failed: {}", mode, channel, e));
                false
            }
        }
    }
}
