//! Retry and session configuration.
//!
//! All durations serialize as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::transport::ConsentState;

/// A fixed-interval retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Pause between attempts.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            max_attempts,
        }
    }

    /// Short schedule for interactive paths (5s).
    pub fn fast() -> Self {
        Self::new(Duration::from_millis(250), 20)
    }

    /// Long schedule for waiting on network propagation (60s).
    pub fn patient() -> Self {
        Self::new(Duration::from_secs(2), 30)
    }

    /// Upper bound on the wall-clock time the schedule may take.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::patient()
    }
}

/// Conversation lookup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Sweep schedule for direct lookup and enumeration.
    pub policy: RetryPolicy,
    /// Consent states included when enumerating conversations.
    pub consent_states: Vec<ConsentState>,
    /// Also watch network events for the target conversation.
    pub observe_events: bool,
    /// Pause before reopening an event stream that failed or ended.
    #[serde(with = "millis")]
    pub event_reopen_interval: Duration,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::patient(),
            consent_states: ConsentState::ALL.to_vec(),
            observe_events: true,
            event_reopen_interval: Duration::from_secs(1),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Schedule for waiting on identity publication.
    pub identity: RetryPolicy,
    /// Conversation lookup.
    pub discovery: LocatorConfig,
    /// Messages per history page.
    pub page_size: usize,
    /// Re-read every known proposal from chain once the first page is in.
    pub refresh_after_backfill: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: RetryPolicy::patient(),
            discovery: LocatorConfig::default(),
            page_size: 100,
            refresh_after_backfill: true,
        }
    }
}

/// Sleep for `duration` unless cancelled first.
///
/// Returns `false` if the token fired.
pub(crate) async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget() {
        let policy = RetryPolicy::new(Duration::from_millis(500), 8);
        assert_eq!(policy.budget(), Duration::from_secs(4));
        assert_eq!(RetryPolicy::patient().budget(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let policy = RetryPolicy::new(Duration::ZERO, 3);
        assert_eq!(policy.interval, Duration::from_millis(1));
    }

    #[test]
    fn test_config_json_uses_millis() {
        let json = serde_json::to_value(SessionConfig::default()).unwrap();
        assert_eq!(json["identity"]["interval"], 2000);
        assert_eq!(json["page_size"], 100);
        assert_eq!(json["discovery"]["consent_states"].as_array().unwrap().len(), 3);

        let parsed: SessionConfig =
            serde_json::from_str(r#"{"page_size":25,"discovery":{"observe_events":false}}"#).unwrap();
        assert_eq!(parsed.page_size, 25);
        assert!(!parsed.discovery.observe_events);
        assert_eq!(parsed.discovery.policy, RetryPolicy::patient());
        assert_eq!(parsed.discovery.event_reopen_interval, Duration::from_secs(1));
        assert_eq!(parsed.identity, RetryPolicy::patient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!pause(Duration::from_secs(60), &cancel).await);
        assert!(pause(Duration::from_millis(1), &CancellationToken::new()).await);
    }
}
