//! External alerts.
//!
//! Components hold a cheap [`Alerter`] handle and call [`Alerter::raise`]. The
//! handle never blocks: alerts are queued on a bounded channel and delivered
//! by a single dispatcher task, which always logs the alert and additionally
//! pushes it to the configured [`AlertSink`] (the WeCom group bot in
//! production). A full alert channel drops the alert with a log line.

pub mod wecom;

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use wecom::WeComSink;

/// Capacity of the alert channel.
pub const ALERT_CHANNEL_CAPACITY: usize = 256;

/// What went wrong, for grouping and filtering alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    /// A hub subscribe/unsubscribe call exhausted its retries.
    HubFailure,
    /// The fetch queue was full; an admitted event was dropped.
    FetchQueueFull,
    /// The publish queue was full; fetched media was deleted.
    PublishQueueFull,
    /// Metadata lookups kept failing; the item was discarded.
    MetadataUnavailable,
    /// The Fetcher failed after its retries.
    FetchFailed,
    /// The Publisher failed; the media file was kept.
    PublishFailed,
    /// Persisted state could not be written.
    StateWrite,
    /// The tunnel process exited or could not be started.
    Tunnel,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HubFailure => "hub_failure",
            AlertKind::FetchQueueFull => "fetch_queue_full",
            AlertKind::PublishQueueFull => "publish_queue_full",
            AlertKind::MetadataUnavailable => "metadata_unavailable",
            AlertKind::FetchFailed => "fetch_failed",
            AlertKind::PublishFailed => "publish_failed",
            AlertKind::StateWrite => "state_write",
            AlertKind::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Alert {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alert rejected by receiver: {0}")]
    Rejected(String),
}

/// Destination for alerts beyond the log.
pub trait AlertSink: Send + Sync + 'static {
    fn deliver(&self, text: &str) -> impl Future<Output = Result<(), AlertError>> + Send;
}

/// Handle used by components to raise alerts.
#[derive(Debug, Clone)]
pub struct Alerter {
    tx: mpsc::Sender<Alert>,
}

impl Alerter {
    /// Creates a handle and the receiving end for a dispatcher.
    pub fn channel(capacity: usize) -> (Alerter, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Alerter { tx }, rx)
    }

    /// Queues an alert without waiting.
    pub fn raise(&self, kind: AlertKind, message: impl Into<String>) {
        let alert = Alert::new(kind, message);
        if let Err(e) = self.tx.try_send(alert) {
            let alert = match e {
                mpsc::error::TrySendError::Full(a) | mpsc::error::TrySendError::Closed(a) => a,
            };
            warn!(
                kind = %alert.kind,
                message = %alert.message,
                "Alert channel unavailable, alert only logged"
            );
        }
    }
}

/// Drains alerts, logging each and forwarding to an optional sink.
pub struct AlertDispatcher<S> {
    rx: mpsc::Receiver<Alert>,
    sink: Option<S>,
    prefix: String,
}

impl<S: AlertSink> AlertDispatcher<S> {
    pub fn new(rx: mpsc::Receiver<Alert>, sink: Option<S>, prefix: impl Into<String>) -> Self {
        AlertDispatcher {
            rx,
            sink,
            prefix: prefix.into(),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Flush what is already queued so shutdown-time alerts are not lost.
                    while let Ok(alert) = self.rx.try_recv() {
                        self.dispatch(alert).await;
                    }
                    debug!("Alert dispatcher shutting down");
                    return;
                }
                alert = self.rx.recv() => match alert {
                    Some(alert) => self.dispatch(alert).await,
                    None => return,
                },
            }
        }
    }

    async fn dispatch(&self, alert: Alert) {
        error!(kind = %alert.kind, message = %alert.message, "ALERT");

        let Some(sink) = &self.sink else {
            return;
        };
        let text = format_alert(&self.prefix, &alert);
        if let Err(e) = sink.deliver(&text).await {
            warn!(kind = %alert.kind, error = %e, "Failed to deliver alert");
        }
    }
}

/// Renders the text pushed to the sink.
pub fn format_alert(prefix: &str, alert: &Alert) -> String {
    if prefix.is_empty() {
        format!("[{}] {}", alert.kind, alert.message)
    } else {
        format!("[{}] [{}] {}", prefix, alert.kind, alert.message)
    }
}
