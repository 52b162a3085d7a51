//! The TOML settings schema.
//!
//! Every section has defaults so a minimal file only names the publisher
//! program and the channels to watch:
//!
//! ```toml
//! channels = ["UCxxxxxxxxxxxxxxxxxxxxxx"]
//! public_url = "https://example.ngrok.app"
//!
//! [rate_limit]
//! default_interval_minutes = 60
//! no_forward = ["UCyyyyyyyyyyyyyyyyyyyyyy"]
//!
//! [rate_limit.overrides]
//! UCyyyyyyyyyyyyyyyyyyyyyy = "disabled"
//! UCzzzzzzzzzzzzzzzzzzzzzz = 15
//!
//! [youtube]
//! api_key = "..."
//!
//! [publisher]
//! program = "/usr/local/bin/upload-short"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::ConfigError;
use crate::admission::policy::{ChannelOverride, RateLimitPolicy};
use crate::types::ChannelId;

pub const DEFAULT_HUB_URL: &str = "https://pubsubhubbub.appspot.com/subscribe";
pub const DEFAULT_CALLBACK_PATH: &str = "/youtube/callback";
pub const DEFAULT_VIDEOS_API_URL: &str = "https://www.googleapis.com/youtube/v3/videos";
pub const DEFAULT_TUNNEL_API_URL: &str = "http://127.0.0.1:4040/api/tunnels";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub state_dir: PathBuf,
    /// Root under which the Fetcher writes `<channel>/<item>.<ext>`.
    pub download_dir: PathBuf,
    pub callback_path: String,
    /// Fixed public base URL. When set, no tunnel is launched.
    pub public_url: Option<String>,
    /// Desired subscriptions.
    pub channels: Vec<ChannelId>,
    pub rate_limit: RateLimitSettings,
    pub hub: HubSettings,
    pub forward: ForwardSettings,
    pub pipeline: PipelineSettings,
    pub youtube: YouTubeSettings,
    pub fetcher: FetcherSettings,
    pub publisher: PublisherSettings,
    pub alert: AlertSettings,
    pub tunnel: TunnelSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            state_dir: PathBuf::from("state"),
            download_dir: PathBuf::from("downloads"),
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            public_url: None,
            channels: Vec::new(),
            rate_limit: RateLimitSettings::default(),
            hub: HubSettings::default(),
            forward: ForwardSettings::default(),
            pipeline: PipelineSettings::default(),
            youtube: YouTubeSettings::default(),
            fetcher: FetcherSettings::default(),
            publisher: PublisherSettings::default(),
            alert: AlertSettings::default(),
            tunnel: TunnelSettings::default(),
        }
    }
}

/// A value in `[rate_limit.overrides]`: either a keyword or a number of minutes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OverrideSetting {
    Minutes(u64),
    Keyword(String),
}

impl OverrideSetting {
    fn resolve(&self, channel: &str) -> Result<ChannelOverride, ConfigError> {
        match self {
            OverrideSetting::Minutes(m) => Ok(ChannelOverride::FixedMinutes(*m)),
            OverrideSetting::Keyword(k) => match k.trim().to_ascii_lowercase().as_str() {
                "disabled" | "disable" | "off" => Ok(ChannelOverride::Disabled),
                "zero_gap" | "zero-gap" | "zerogap" | "none" => Ok(ChannelOverride::ZeroGap),
                other => Err(ConfigError::invalid(
                    format!("rate_limit.overrides.{}", channel),
                    format!("expected \"disabled\", \"zero_gap\" or minutes, got {:?}", other),
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSettings {
    pub default_interval_minutes: u64,
    pub overrides: BTreeMap<String, OverrideSetting>,
    pub no_forward: Vec<ChannelId>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            default_interval_minutes: 60,
            overrides: BTreeMap::new(),
            no_forward: Vec::new(),
        }
    }
}

impl RateLimitSettings {
    /// Builds the immutable policy snapshot handed to the gate.
    pub fn policy(&self) -> Result<RateLimitPolicy, ConfigError> {
        let interval = Duration::from_secs(self.default_interval_minutes.saturating_mul(60));
        let mut policy = RateLimitPolicy::new(interval);
        for (channel, setting) in &self.overrides {
            policy = policy.with_override(channel.as_str(), setting.resolve(channel)?);
        }
        for channel in &self.no_forward {
            policy = policy.with_no_forward(channel.clone());
        }
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubSettings {
    pub url: String,
    /// Shared secret for `X-Hub-Signature` on deliveries.
    pub secret: Option<String>,
    pub lease_seconds: Option<u64>,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub renewal_interval_hours: u64,
    pub request_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            url: DEFAULT_HUB_URL.to_string(),
            secret: None,
            lease_seconds: None,
            max_attempts: 3,
            retry_delay_secs: 5,
            renewal_interval_hours: 96,
            request_timeout_secs: 30,
        }
    }
}

impl HubSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_hours.saturating_mul(3600))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Downstream endpoint that receives rejected notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardSettings {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        ForwardSettings {
            url: None,
            timeout_secs: 10,
        }
    }
}

impl ForwardSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub fetch_queue_capacity: usize,
    pub publish_queue_capacity: usize,
    pub fetch_workers: usize,
    pub publish_workers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            fetch_queue_capacity: 16,
            publish_queue_capacity: 5,
            fetch_workers: 2,
            publish_workers: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct YouTubeSettings {
    pub api_key: Option<String>,
    pub api_url: String,
    pub proxy: Option<String>,
    pub recent_window_secs: u64,
    pub max_duration_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for YouTubeSettings {
    fn default() -> Self {
        YouTubeSettings {
            api_key: None,
            api_url: DEFAULT_VIDEOS_API_URL.to_string(),
            proxy: None,
            recent_window_secs: 120,
            max_duration_secs: 60,
            max_attempts: 3,
            retry_delay_secs: 3,
        }
    }
}

impl YouTubeSettings {
    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(self.recent_window_secs)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetcherSettings {
    pub program: String,
    /// Arguments placed before the output template and the source URL.
    pub args: Vec<String>,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        FetcherSettings {
            program: "yt-dlp".to_string(),
            args: ["-f", "bv*+ba/best", "--merge-output-format", "mp4", "--no-playlist"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_attempts: 3,
            retry_delay_secs: 3,
            timeout_secs: 600,
        }
    }
}

impl FetcherSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherSettings {
    /// Program invoked as `<program> <args..> <media path>`.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl PublisherSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(900))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertSettings {
    /// WeCom group-bot webhook. Alerts are only logged when unset.
    pub wecom_webhook: Option<String>,
    /// Prefix prepended to every alert message.
    pub prefix: String,
}

impl Default for AlertSettings {
    fn default() -> Self {
        AlertSettings {
            wecom_webhook: None,
            prefix: "crosspost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSettings {
    /// Tunnel binary, e.g. `ngrok`. Unset means static-URL mode.
    pub program: Option<String>,
    pub api_url: String,
    pub authtoken: Option<String>,
    pub check_interval_secs: u64,
    pub min_restart_pause_secs: u64,
    pub discovery_attempts: u32,
    pub discovery_delay_ms: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            program: None,
            api_url: DEFAULT_TUNNEL_API_URL.to_string(),
            authtoken: None,
            check_interval_secs: 10,
            min_restart_pause_secs: 3,
            discovery_attempts: 10,
            discovery_delay_ms: 1500,
        }
    }
}

impl TunnelSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_restart_pause(&self) -> Duration {
        Duration::from_secs(self.min_restart_pause_secs)
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }
}

impl Settings {
    pub fn from_toml_str(s: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents, path)
    }

    /// Applies `CROSSPOST_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        const LISTEN_ADDR: &str = "CROSSPOST_LISTEN_ADDR";

        if let Some(addr) = lookup(LISTEN_ADDR) {
            self.listen_addr = addr.parse().map_err(|e| ConfigError::Env {
                var: LISTEN_ADDR,
                reason: format!("{}", e),
            })?;
        }
        if let Some(dir) = lookup("CROSSPOST_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CROSSPOST_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("CROSSPOST_PUBLIC_URL") {
            self.public_url = Some(url);
        }
        if let Some(secret) = lookup("CROSSPOST_HUB_SECRET") {
            self.hub.secret = Some(secret);
        }
        if let Some(key) = lookup("CROSSPOST_YOUTUBE_API_KEY") {
            self.youtube.api_key = Some(key);
        }
        if let Some(hook) = lookup("CROSSPOST_WECOM_WEBHOOK") {
            self.alert.wecom_webhook = Some(hook);
        }
        if let Some(token) = lookup("CROSSPOST_NGROK_AUTHTOKEN") {
            self.tunnel.authtoken = Some(token);
        }
        Ok(())
    }

    /// Checks everything that would otherwise fail after startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.callback_path.starts_with('/') {
            return Err(ConfigError::invalid("callback_path", "must start with '/'"));
        }

        check_url("hub.url", &self.hub.url)?;
        check_url("youtube.api_url", &self.youtube.api_url)?;
        check_url("tunnel.api_url", &self.tunnel.api_url)?;
        for (field, value) in [
            ("public_url", &self.public_url),
            ("forward.url", &self.forward.url),
            ("youtube.proxy", &self.youtube.proxy),
            ("alert.wecom_webhook", &self.alert.wecom_webhook),
        ] {
            if let Some(value) = value {
                check_url(field, value)?;
            }
        }

        match &self.publisher.program {
            Some(p) if !p.trim().is_empty() => {}
            _ => return Err(ConfigError::Missing("publisher.program")),
        }
        if self.fetcher.program.trim().is_empty() {
            return Err(ConfigError::Missing("fetcher.program"));
        }

        if !self.channels.is_empty() {
            if self.youtube.api_key.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::Missing("youtube.api_key"));
            }
            if self.public_url.is_none() && self.tunnel.program.is_none() {
                return Err(ConfigError::Missing("public_url or tunnel.program"));
            }
        }

        for (field, value) in [
            ("pipeline.fetch_queue_capacity", self.pipeline.fetch_queue_capacity),
            ("pipeline.publish_queue_capacity", self.pipeline.publish_queue_capacity),
            ("pipeline.fetch_workers", self.pipeline.fetch_workers),
            ("pipeline.publish_workers", self.pipeline.publish_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        for (field, value) in [
            ("hub.max_attempts", self.hub.max_attempts),
            ("fetcher.max_attempts", self.fetcher.max_attempts),
            ("youtube.max_attempts", self.youtube.max_attempts),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if self.hub.renewal_interval_hours == 0 {
            return Err(ConfigError::invalid("hub.renewal_interval_hours", "must be at least 1"));
        }

        self.rate_limit.policy()?;
        Ok(())
    }

    /// Desired subscriptions, deduplicated and sorted.
    pub fn desired_channels(&self) -> BTreeSet<ChannelId> {
        self.channels.iter().cloned().collect()
    }

    /// Full callback URL for a public base URL.
    pub fn callback_url(&self, public_base: &str) -> String {
        format!("{}{}", public_base.trim_end_matches('/'), self.callback_path)
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "socks5" | "socks5h" => Ok(()),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme {:?}", other),
        )),
    }
}
