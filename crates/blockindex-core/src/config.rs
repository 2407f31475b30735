//! Engine configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::observability::LogConfig;

/// Configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Blocks per concurrent-track batch.
    #[serde(default = "default_group_size")]
    pub concurrent_group_size: usize,
    /// Blocks fetched but not yet serially committed before the source
    /// stage suspends.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Queued new-block notifications; further hints are dropped while full.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_group_size() -> usize { 5 }
fn default_high_water_mark() -> usize { 10 }
fn default_event_capacity() -> usize { 1_024 }
fn default_notification_capacity() -> usize { 64 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrent_group_size: default_group_size(),
            high_water_mark: default_high_water_mark(),
            event_capacity: default_event_capacity(),
            notification_capacity: default_notification_capacity(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        let checks = [
            ("concurrent_group_size", self.concurrent_group_size),
            ("high_water_mark", self.high_water_mark),
            ("event_capacity", self.event_capacity),
            ("notification_capacity", self.notification_capacity),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(IndexerError::Other(format!("config: {name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// Runtime state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Opened, or waiting for a retry trigger after a transient error.
    Idle,
    /// Forward sync in progress.
    Syncing,
    /// Rewinding / replaying onto a new branch.
    Reorging,
    /// Caught up with the source; waiting for the next notification.
    Synced,
    /// Shutdown requested; finishing the current commit.
    Stopping,
    Stopped,
    /// Hit a fatal error; needs a restart.
    Error,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Reorging => write!(f, "reorging"),
            Self::Synced => write!(f, "synced"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
