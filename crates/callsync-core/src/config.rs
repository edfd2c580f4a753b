//! Synchronizer configuration
//!
//! Loaded from defaults, a JSON file, or `CALLSYNC_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Environment variable overriding [`SyncConfig::hang_up_on_failure`]
pub const ENV_HANG_UP_ON_FAILURE: &str = "CALLSYNC_HANG_UP_ON_FAILURE";
/// Environment variable overriding [`SyncConfig::terminated_call_memory`]
pub const ENV_TERMINATED_CALL_MEMORY: &str = "CALLSYNC_TERMINATED_CALL_MEMORY";
/// Environment variable overriding [`SyncConfig::event_channel_capacity`]
pub const ENV_EVENT_CHANNEL_CAPACITY: &str = "CALLSYNC_EVENT_CHANNEL_CAPACITY";

/// Configuration for the [`Synchronizer`](crate::Synchronizer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Send `hangUp` to the daemon when a call enters `Failure`
    pub hang_up_on_failure: bool,
    /// How many terminated call ids to remember for late-event classification
    pub terminated_call_memory: usize,
    /// Capacity of the inbound event channel, also used by
    /// [`BroadcastNotificationSink::from_config`](crate::BroadcastNotificationSink::from_config)
    pub event_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hang_up_on_failure: true,
            terminated_call_memory: 256,
            event_channel_capacity: 1000,
        }
    }
}

impl SyncConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether `Failure` triggers a `hangUp`
    pub fn with_hang_up_on_failure(mut self, enabled: bool) -> Self {
        self.hang_up_on_failure = enabled;
        self
    }

    /// Set the number of remembered terminated calls
    pub fn with_terminated_call_memory(mut self, memory: usize) -> Self {
        self.terminated_call_memory = memory;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Load a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            SyncError::config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `CALLSYNC_*` environment variables that are set
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_HANG_UP_ON_FAILURE) {
            config.hang_up_on_failure = parse_bool(ENV_HANG_UP_ON_FAILURE, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_TERMINATED_CALL_MEMORY) {
            config.terminated_call_memory = parse_usize(ENV_TERMINATED_CALL_MEMORY, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_EVENT_CHANNEL_CAPACITY) {
            config.event_channel_capacity = parse_usize(ENV_EVENT_CHANNEL_CAPACITY, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable
    pub fn validate(&self) -> SyncResult<()> {
        if self.event_channel_capacity == 0 {
            return Err(SyncError::config("event_channel_capacity must be greater than 0"));
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(name: &str, raw: &str) -> SyncResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::config(format!("{}: '{}' is not a boolean", name, raw))),
    }
}

fn parse_usize(name: &str, raw: &str) -> SyncResult<usize> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::config(format!("{}: '{}' is not a number", name, raw)))
}
