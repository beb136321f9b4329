//! Per-session configuration.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::poller::PollOptions;

/// Default delay between condition checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Default delay between typed keystrokes.
pub const DEFAULT_TYPING_INTERVAL: Duration = Duration::from_millis(50);
/// Default budget for element waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Session configuration.
///
/// Durations serialize as integer milliseconds under `*_ms` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between condition checks.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Delay between typed keystrokes.
    #[serde(rename = "typing_interval_ms", with = "millis")]
    pub typing_interval: Duration,

    /// Budget for element waits when the caller gives none.
    #[serde(rename = "wait_timeout_ms", with = "millis")]
    pub wait_timeout: Duration,

    /// Name used when reporting that the target closed.
    pub target_name: String,

    /// Arbitrary metadata for app-specific needs.
    pub metadata: HashMap<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            typing_interval: DEFAULT_TYPING_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            target_name: "Browser".to_string(),
            metadata: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the typing interval.
    #[must_use]
    pub const fn with_typing_interval(mut self, interval: Duration) -> Self {
        self.typing_interval = interval;
        self
    }

    /// Set the default wait budget.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the target name.
    #[must_use]
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = name.into();
        self
    }

    /// Poll options for a wait, falling back to the default budget.
    #[must_use]
    pub fn poll_options(&self, timeout: Option<Duration>) -> PollOptions {
        PollOptions::new(self.poll_interval, timeout.unwrap_or(self.wait_timeout))
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
