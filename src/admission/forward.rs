//! Best-effort forwarding of rejected notifications.
//!
//! A rejected hub notification is re-posted to a downstream endpoint as a
//! minimal Atom document carrying `yt:videoId` and `yt:channelId`, so another
//! consumer can still act on it. Delivery is fire-and-forget: failures are
//! logged and never affect the webhook response.
//!
//! [`Forwarder::forward`] only queues the event on a bounded channel. A single
//! [`ForwardWorker`] posts queued events one at a time, so a burst of
//! rejections costs at most `capacity` pending requests; beyond that events
//! are dropped with a warning. On shutdown the worker posts what is already
//! queued before exiting.

use std::time::Duration;

use quick_xml::escape::escape;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::NotificationEvent;

/// Capacity of the forward queue.
pub const FORWARD_QUEUE_CAPACITY: usize = 64;

/// Renders the Atom entry posted downstream.
pub fn atom_entry(event: &NotificationEvent) -> String {
    let item = escape(event.item_id.as_str());
    let channel = escape(event.channel_id.as_str());
    let link = escape(event.source_url.as_str());
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" "#,
            r#"xmlns="http://www.w3.org/2005/Atom">"#,
            "<entry>",
            "<id>yt:video:{item}</id>",
            "<yt:videoId>{item}</yt:videoId>",
            "<yt:channelId>{channel}</yt:channelId>",
            r#"<link rel="alternate" href="{link}"/>"#,
            "</entry>",
            "</feed>"
        ),
        item = item,
        channel = channel,
        link = link,
    )
}

/// Handle used by the intake to forward rejected notifications.
#[derive(Debug, Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<NotificationEvent>,
}

impl Forwarder {
    /// Creates a handle and the worker that delivers to `url`.
    pub fn channel(
        url: impl Into<String>,
        timeout: Duration,
        capacity: usize,
    ) -> Result<(Forwarder, ForwardWorker), reqwest::Error> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = ForwardWorker {
            rx,
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        };
        Ok((Forwarder { tx }, worker))
    }

    /// Queues the event without waiting. Returns false if it was dropped.
    pub fn forward(&self, event: &NotificationEvent) -> bool {
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(item = %event.item_id, "Forward queue full, notification not forwarded");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(item = %event.item_id, "Forward worker stopped, notification not forwarded");
                false
            }
        }
    }
}

/// Posts queued notifications to the downstream endpoint.
pub struct ForwardWorker {
    rx: mpsc::Receiver<NotificationEvent>,
    client: reqwest::Client,
    url: String,
}

impl ForwardWorker {
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.post(&event).await;
                    }
                    debug!("Forward worker shutting down");
                    return;
                }
                event = self.rx.recv() => match event {
                    Some(event) => self.post(&event).await,
                    None => return,
                },
            }
        }
    }

    async fn post(&self, event: &NotificationEvent) {
        let item = &event.item_id;
        let url = self.url.as_str();
        let sent = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/atom+xml")
            .body(atom_entry(event))
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {
                debug!(item = %item, url, "Forwarded notification");
            }
            Ok(response) => {
                warn!(
                    item = %item,
                    url,
                    status = %response.status(),
                    "Forward target rejected notification"
                );
            }
            Err(e) => warn!(item = %item, url, error = %e, "Failed to forward notification"),
        }
    }
}
