//! Producer configuration.
//!
//! Loaded from an optional JSON file; every field has a default, and command
//! line flags override whatever the file sets.
//!
//! ```json
//! {
//!   "address": "unix:/tmp/perfpipe-producer-side.sock",
//!   "reconnection_delay_ms": 5000,
//!   "min_workers": 1,
//!   "max_workers": 4,
//!   "idle_ttl_ms": 1000,
//!   "processing_delay_ms": 333,
//!   "batch_size": 512
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use perfpipe_common::{DEFAULT_PRODUCER_SIDE_ADDRESS, DEFAULT_RECONNECTION_DELAY_MS};
use serde::Deserialize;

use crate::domain::ConfigError;
use crate::ordering::DEFAULT_PROCESSING_DELAY;
use crate::pipeline::PipelineSettings;
use crate::transport::ProducerSideAddress;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Collector address: `unix:/path` or `host:port`
    pub address: String,
    pub reconnection_delay_ms: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Idle time after which workers above `min_workers` retire
    pub idle_ttl_ms: u64,
    /// Age events must reach before they leave the ordering queue
    pub processing_delay_ms: u64,
    /// Events per serialization job
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_PRODUCER_SIDE_ADDRESS.to_string(),
            reconnection_delay_ms: DEFAULT_RECONNECTION_DELAY_MS,
            min_workers: 1,
            max_workers: 4,
            idle_ttl_ms: 1000,
            processing_delay_ms: u64::try_from(DEFAULT_PROCESSING_DELAY.as_millis()).unwrap_or(u64::MAX),
            batch_size: 512,
        }
    }
}

impl PipelineConfig {
    /// Read and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails [`PipelineConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first setting that is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.producer_side_address()?;
        if self.min_workers == 0 {
            return Err(ConfigError::ZeroMinWorkers);
        }
        if self.max_workers < self.min_workers {
            return Err(ConfigError::MaxBelowMin { min: self.min_workers, max: self.max_workers });
        }
        if self.idle_ttl_ms == 0 {
            return Err(ConfigError::IdleTtlTooSmall(self.idle_ttl_ms));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if `address` is not `unix:/path` or `host:port`.
    pub fn producer_side_address(&self) -> Result<ProducerSideAddress, ConfigError> {
        self.address.parse()
    }

    #[must_use]
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    #[must_use]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            processing_delay: Duration::from_millis(self.processing_delay_ms),
            batch_size: self.batch_size,
        }
    }
}
