use chrono::{DateTime, Utc};
use serde::Serialize;

/// The current way the callback endpoint is reachable from the internet.
///
/// Sessions are values: the supervisor publishes a new one on restart instead
/// of mutating the old one, so a reader holding a session keeps a consistent
/// pid/URL pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSession {
    /// Tunnel process id; `None` for a static public URL.
    pub pid: Option<u32>,
    pub public_url: String,
    pub started_at: DateTime<Utc>,
}

impl TunnelSession {
    pub fn new(pid: Option<u32>, public_url: impl Into<String>) -> Self {
        TunnelSession {
            pid,
            public_url: public_url.into(),
            started_at: Utc::now(),
        }
    }

    /// A session for a fixed, externally managed public URL.
    pub fn fixed(public_url: impl Into<String>) -> Self {
        TunnelSession::new(None, public_url)
    }

    pub fn callback_url(&self, callback_path: &str) -> String {
        format!("{}{}", self.public_url.trim_end_matches('/'), callback_path)
    }
}
