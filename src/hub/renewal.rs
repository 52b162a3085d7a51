//! Periodic subscription renewal.
//!
//! Hub subscriptions expire after their lease, so every subscribed channel is
//! re-subscribed on a fixed cadence. The time of the last pass is persisted,
//! and after a restart the loop sleeps only for what remains of the interval.
//!
//! A change of the public URL (the tunnel restarted with a new hostname)
//! makes every existing subscription point at a dead callback, so it triggers
//! an immediate pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::HubClient;
use super::reconcile::Reconciler;
use crate::tunnel::TunnelSession;

/// Time left until the next pass is due.
///
/// Never renewed means due now. A timestamp in the future (clock moved
/// backwards) counts as "just renewed".
pub fn time_until_due(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval: Duration,
) -> Duration {
    let Some(last) = last else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

pub struct RenewalLoop<H> {
    reconciler: Arc<Reconciler<H>>,
    interval: Duration,
    callback_path: String,
    sessions: watch::Receiver<Option<TunnelSession>>,
    callback: Option<String>,
}

impl<H: HubClient> RenewalLoop<H> {
    pub fn new(
        reconciler: Arc<Reconciler<H>>,
        interval: Duration,
        callback_path: impl Into<String>,
        sessions: watch::Receiver<Option<TunnelSession>>,
    ) -> Self {
        let mut renewal = RenewalLoop {
            reconciler,
            interval,
            callback_path: callback_path.into(),
            sessions,
            callback: None,
        };
        renewal.callback = renewal.current_callback();
        renewal
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    fn current_callback(&mut self) -> Option<String> {
        self.sessions
            .borrow_and_update()
            .as_ref()
            .map(|s| s.callback_url(&self.callback_path))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let mut callback = self.callback.take();
        let mut sessions_open = true;

        loop {
            if callback.is_none() {
                debug!("No public URL yet, renewal waits for a session");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = self.sessions.changed(), if sessions_open => {
                        sessions_open = changed.is_ok();
                        callback = self.current_callback();
                    }
                }
                if !sessions_open && callback.is_none() {
                    shutdown.cancelled().await;
                    return;
                }
                continue;
            }

            let last = self.reconciler.last_renewed().unwrap_or_else(|e| {
                warn!(error = %e, "Cannot read renewal clock, renewing now");
                None
            });
            let wait = time_until_due(last, Utc::now(), self.interval);
            debug!(wait_secs = wait.as_secs(), "Next renewal pass scheduled");

            let url_changed = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Renewal loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => false,
                changed = self.sessions.changed(), if sessions_open => {
                    if changed.is_err() {
                        sessions_open = false;
                        continue;
                    }
                    let next = self.current_callback();
                    if next.is_none() || next == callback {
                        continue;
                    }
                    info!(callback_url = ?next, "Public URL changed, renewing subscriptions");
                    callback = next;
                    true
                }
            };

            let Some(url) = callback.clone() else {
                continue;
            };
            let result = if url_changed {
                self.reconciler.renew(&url).await.map(Some)
            } else {
                self.reconciler.renew_if_due(&url, self.interval).await
            };
            if let Err(e) = result {
                warn!(error = %e, "Renewal pass could not persist its result");
                // The clock was not stamped; back off instead of spinning.
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.interval.min(Duration::from_secs(300))) => {}
                }
            }
        }
    }
}
