//! WebSub hub client.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::error::HubError;
use crate::types::ChannelId;

/// Feed URL the hub is asked to watch for a channel.
pub fn topic_url(channel: &ChannelId) -> String {
    format!(
        "https://www.youtube.com/xml/feeds/videos.xml?channel_id={}",
        channel
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for HubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One subscribe/unsubscribe request.
pub trait HubClient: Send + Sync + 'static {
    fn request(
        &self,
        mode: HubMode,
        channel: &ChannelId,
        callback_url: &str,
    ) -> impl Future<Output = Result<(), HubError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpHubClient {
    client: reqwest::Client,
    hub_url: String,
    secret: Option<String>,
    lease_seconds: Option<u64>,
}

impl HttpHubClient {
    pub fn new(
        hub_url: impl Into<String>,
        timeout: Duration,
        secret: Option<String>,
        lease_seconds: Option<u64>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpHubClient {
            client,
            hub_url: hub_url.into(),
            secret,
            lease_seconds,
        })
    }

    /// Form fields for one request.
    pub fn form(
        &self,
        mode: HubMode,
        channel: &ChannelId,
        callback_url: &str,
    ) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("hub.mode", mode.as_str().to_string()),
            ("hub.topic", topic_url(channel)),
            ("hub.callback", callback_url.to_string()),
            ("hub.verify", "async".to_string()),
        ];
        if let Some(secret) = &self.secret {
            form.push(("hub.secret", secret.clone()));
        }
        if let Some(lease) = self.lease_seconds {
            form.push(("hub.lease_seconds", lease.to_string()));
        }
        form
    }
}

impl HubClient for HttpHubClient {
    async fn request(
        &self,
        mode: HubMode,
        channel: &ChannelId,
        callback_url: &str,
    ) -> Result<(), HubError> {
        let form = self.form(mode, channel, callback_url);
        let response = self
            .client
            .post(&self.hub_url)
            .form(&form)
            .send()
            .await
            .map_err(HubError::network)?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            debug!(channel = %channel, mode = %mode, "Hub accepted request");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(HubError::unexpected_status(status.as_u16(), body.trim()))
    }
}
