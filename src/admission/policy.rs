//! Per-channel admission rules.
//!
//! A [`RateLimitPolicy`] is an immutable snapshot. The config reloader builds a
//! fresh one on every change and publishes it through a watch channel; the
//! gate reads the latest snapshot inside its critical section.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::TimeDelta;

use crate::types::ChannelId;

/// Default global interval between two admissions of the same channel.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// An explicit per-channel entry in the override table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOverride {
    /// Never admitted.
    Disabled,
    /// Always admitted; the timestamp is still updated.
    ZeroGap,
    /// Admitted at most once per the given number of minutes.
    FixedMinutes(u64),
}

/// What the gate must do for one channel under the current policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRule {
    Disabled,
    ZeroGap,
    Interval(TimeDelta),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    default_interval: Duration,
    overrides: HashMap<ChannelId, ChannelOverride>,
    no_forward: HashSet<ChannelId>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        RateLimitPolicy::new(DEFAULT_INTERVAL)
    }
}

impl RateLimitPolicy {
    pub fn new(default_interval: Duration) -> Self {
        RateLimitPolicy {
            default_interval,
            overrides: HashMap::new(),
            no_forward: HashSet::new(),
        }
    }

    pub fn with_override(mut self, channel: impl Into<ChannelId>, rule: ChannelOverride) -> Self {
        self.overrides.insert(channel.into(), rule);
        self
    }

    pub fn with_no_forward(mut self, channel: impl Into<ChannelId>) -> Self {
        self.no_forward.insert(channel.into());
        self
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub fn override_for(&self, channel: &ChannelId) -> Option<ChannelOverride> {
        self.overrides.get(channel).copied()
    }

    /// Resolves the effective rule for a channel.
    pub fn rule_for(&self, channel: &ChannelId) -> AdmissionRule {
        match self.override_for(channel) {
            Some(ChannelOverride::Disabled) => AdmissionRule::Disabled,
            Some(ChannelOverride::ZeroGap) => AdmissionRule::ZeroGap,
            Some(ChannelOverride::FixedMinutes(minutes)) => {
                AdmissionRule::Interval(minutes_delta(minutes))
            }
            None => AdmissionRule::Interval(to_delta(self.default_interval)),
        }
    }

    /// Returns true if rejected events for this channel go downstream.
    pub fn forwards(&self, channel: &ChannelId) -> bool {
        !self.no_forward.contains(channel)
    }

    pub fn is_disabled(&self, channel: &ChannelId) -> bool {
        self.override_for(channel) == Some(ChannelOverride::Disabled)
    }
}

fn minutes_delta(minutes: u64) -> TimeDelta {
    let minutes = i64::try_from(minutes).unwrap_or(i64::MAX);
    TimeDelta::try_minutes(minutes).unwrap_or(TimeDelta::MAX)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_uses_default_interval() {
        let policy = RateLimitPolicy::new(Duration::from_secs(600));
        assert_eq!(
            policy.rule_for(&ChannelId::new("UC1")),
            AdmissionRule::Interval(TimeDelta::minutes(10))
        );
        assert!(policy.forwards(&ChannelId::new("UC1")));
    }

    #[test]
    fn overrides_take_precedence() {
        let policy = RateLimitPolicy::default()
            .with_override("UCoff", ChannelOverride::Disabled)
            .with_override("UCfree", ChannelOverride::ZeroGap)
            .with_override("UCfix", ChannelOverride::FixedMinutes(5))
            .with_no_forward("UCoff");

        assert_eq!(policy.rule_for(&"UCoff".into()), AdmissionRule::Disabled);
        assert_eq!(policy.rule_for(&"UCfree".into()), AdmissionRule::ZeroGap);
        assert_eq!(
            policy.rule_for(&"UCfix".into()),
            AdmissionRule::Interval(TimeDelta::minutes(5))
        );
        assert!(policy.is_disabled(&"UCoff".into()));
        assert!(!policy.forwards(&"UCoff".into()));
        assert!(policy.forwards(&"UCfix".into()));
    }

    #[test]
    fn huge_minutes_saturate() {
        let policy = RateLimitPolicy::default()
            .with_override("UC", ChannelOverride::FixedMinutes(u64::MAX));
        assert_eq!(policy.rule_for(&"UC".into()), AdmissionRule::Interval(TimeDelta::MAX));
    }
}
