//! Settings for the data-or-timer workflow and its entry point.
//!
//! Every field has a default, so a JSON file only needs to name the values
//! it overrides:
//!
//! ```json
//! { "wait": { "min_delay_ms": 5000 }, "lifetime_ms": 120000 }
//! ```
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_INSTANCE_KEY: &str = "SingletonId";
pub const DEFAULT_EVENT_NAME: &str = "NewData";

/// Bounds for the wait window between expiration checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 10_000,
            max_delay_ms: 30_000,
        }
    }
}

impl WaitPolicy {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64) -> Result<Self, ConfigError> {
        let policy = Self {
            min_delay_ms,
            max_delay_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay_ms == 0 {
            return Err(ConfigError::Empty {
                field: "wait.min_delay_ms",
            });
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvertedWindow {
                min_ms: self.min_delay_ms,
                max_ms: self.max_delay_ms,
            });
        }
        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataOrTimerConfig {
    /// Fixed id of the singleton instance.
    pub instance_key: String,
    /// Name of the external signal raced against the timer.
    pub event_name: String,
    pub wait: WaitPolicy,
    /// Expiration offset applied when the entry point creates the instance.
    pub lifetime_ms: u64,
    /// How long `SayHello` takes.
    pub activity_delay_ms: u64,
}

impl Default for DataOrTimerConfig {
    fn default() -> Self {
        Self {
            instance_key: DEFAULT_INSTANCE_KEY.to_string(),
            event_name: DEFAULT_EVENT_NAME.to_string(),
            wait: WaitPolicy::default(),
            lifetime_ms: 10 * 60 * 1000,
            activity_delay_ms: 10_000,
        }
    }
}

impl DataOrTimerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_key.is_empty() {
            return Err(ConfigError::Empty { field: "instance_key" });
        }
        if self.event_name.is_empty() {
            return Err(ConfigError::Empty { field: "event_name" });
        }
        self.wait.validate()
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    pub fn activity_delay(&self) -> Duration {
        Duration::from_millis(self.activity_delay_ms)
    }
}
