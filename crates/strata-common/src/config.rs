//! Configuration types for Strata
//!
//! Configuration is read from TOML. Every section has defaults, so an
//! empty document is a valid configuration.
//!
//! ```toml
//! io_mode = "deferred"
//! direct_io = false
//!
//! [cache]
//! block_capacity = 1024
//! space_map_capacity = 64
//!
//! [retry]
//! max_attempts = 100
//! backoff_micros = 10
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How block loads, saves and syncs are carried out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Call straight through to the device
    #[default]
    Sync,
    /// Queue block jobs and return `Pending`/`Deferred`
    Deferred,
}

/// Root configuration for a Strata store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Operation mode
    pub io_mode: IoMode,
    /// Open the device with O_DIRECT
    pub direct_io: bool,
    /// Object cache limits
    pub cache: CacheConfig,
    /// Device retry policy
    pub retry: RetryConfig,
}

impl StoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the store cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        if self.cache.block_capacity == 0 || self.cache.space_map_capacity == 0 {
            return Err(Error::configuration("cache capacities must be non-zero"));
        }
        Ok(())
    }
}

/// Soft limits for the object cache
///
/// The cache itself never refuses an entry; `relax` squeezes it back
/// under these limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of cached blocks
    pub block_capacity: usize,
    /// Number of cached space-maps
    pub space_map_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_capacity: 1024,
            space_map_capacity: 64,
        }
    }
}

/// Retry policy for transient device errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before the failure is treated as fatal
    pub max_attempts: u32,
    /// Sleep between attempts, in microseconds
    pub backoff_micros: u64,
}

impl RetryConfig {
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_micros(self.backoff_micros)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            backoff_micros: 10,
        }
    }
}
