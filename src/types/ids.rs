//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using an
//! ItemId where a ChannelId is expected) and make the code more self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An upstream creator channel (e.g. a YouTube `UC...` channel id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(s: impl Into<String>) -> Self {
        ChannelId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        ChannelId(s)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId(s.to_string())
    }
}

/// A media item on its source platform (e.g. a YouTube video id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(s: impl Into<String>) -> Self {
        ItemId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId(s.to_string())
    }
}

/// Platform tag carried by every notification.
///
/// Stored lowercased so that `"YouTube"` from a manual submission and the
/// feed-derived `"youtube"` land in the same history bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    pub const YOUTUBE: &'static str = "youtube";

    pub fn new(s: impl AsRef<str>) -> Self {
        Platform(s.as_ref().trim().to_ascii_lowercase())
    }

    pub fn youtube() -> Self {
        Platform(Self::YOUTUBE.to_string())
    }

    pub fn is_youtube(&self) -> bool {
        self.0 == Self::YOUTUBE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        Platform::new(s)
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        Platform::new(s)
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.0
    }
}

/// The `(platform, item)` pair used for history and in-flight dedup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub platform: Platform,
    pub item: ItemId,
}

impl ItemKey {
    pub fn new(platform: Platform, item: ItemId) -> Self {
        ItemKey { platform, item }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.item)
    }
}
