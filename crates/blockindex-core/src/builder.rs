//! Fluent builder API for engine configuration.
//!
//! # Example
//!
//! ```rust
//! use blockindex_core::EngineBuilder;
//!
//! let config = EngineBuilder::new()
//!     .concurrent_group_size(8)
//!     .high_water_mark(32)
//!     .build_config()
//!     .unwrap();
//! assert_eq!(config.high_water_mark, 32);
//! ```

use crate::config::EngineConfig;
use crate::error::IndexerError;
use crate::observability::LogConfig;

/// Fluent builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrent_group_size(mut self, size: usize) -> Self {
        self.config.concurrent_group_size = size;
        self
    }

    pub fn high_water_mark(mut self, blocks: usize) -> Self {
        self.config.high_water_mark = blocks;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    /// Build and validate the config.
    pub fn build_config(self) -> Result<EngineConfig, IndexerError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
