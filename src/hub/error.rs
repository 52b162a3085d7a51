//! Hub request errors.
//!
//! The hub signals acceptance with `202 Accepted`. Every other status and
//! every network failure is transient: the hub is known to answer 5xx and
//! even 4xx intermittently, and the reconciler retries a bounded number of
//! times anyway. Only a request that cannot be built at all is permanent.

use std::fmt;

use thiserror::Error;

use crate::retry::Retryable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubErrorKind {
    /// Safe to retry after a delay.
    Transient,
    /// Retrying cannot help (e.g. the request could not be constructed).
    Permanent,
}

#[derive(Debug, Error)]
pub struct HubError {
    pub kind: HubErrorKind,

    /// HTTP status returned by the hub, if any.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<reqwest::Error>,
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "hub error (HTTP {}): {}", code, self.message),
            None => write!(f, "hub error: {}", self.message),
        }
    }
}

impl HubError {
    /// The hub answered with something other than 202.
    pub fn unexpected_status(status: u16, body: impl Into<String>) -> Self {
        HubError {
            kind: HubErrorKind::Transient,
            status_code: Some(status),
            message: body.into(),
            source: None,
        }
    }

    /// The request never produced a response.
    pub fn network(source: reqwest::Error) -> Self {
        let kind = if source.is_builder() {
            HubErrorKind::Permanent
        } else {
            HubErrorKind::Transient
        };
        HubError {
            kind,
            status_code: source.status().map(|s| s.as_u16()),
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HubError {
            kind: HubErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }
}

impl Retryable for HubError {
    fn is_transient(&self) -> bool {
        self.kind == HubErrorKind::Transient
    }
}
