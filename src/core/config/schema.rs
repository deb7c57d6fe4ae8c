//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Validation
//!
//! Config values are validated after parsing: worker counts must fall within
//! the executor's bounds, timeouts must be non-zero and the retry policy
//! must be internally consistent.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::duration_serde;
use super::ConfigError;
use crate::core::cache::DEFAULT_CACHE_TTL;
use crate::core::ops::lock::{DEFAULT_LOCK_TIMEOUT, DEFAULT_STALE_THRESHOLD};
use crate::engine::parallel::{DEFAULT_WORKERS, MAX_WORKERS, MIN_WORKERS};
use crate::engine::retry::RetryConfig;

/// Grove configuration file.
///
/// Every key is optional; missing keys take their defaults.
///
/// # Example
///
/// ```toml
/// root = "/home/me/.grove"
/// parallel_workers = 4
/// lock_timeout = "30s"
/// lock_stale_threshold = "5m"
/// cache_ttl = "5m"
///
/// [retry]
/// max_attempts = 3
/// initial_delay = "1s"
/// max_delay = "30s"
/// multiplier = 2.0
/// jitter_factor = 0.25
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GroveConfig {
    /// Grove data directory (default: `~/.grove`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Worker limit for multi-repo operations
    pub parallel_workers: usize,

    /// How long a mutating operation waits for the workspace lock
    #[serde(with = "duration_serde")]
    pub lock_timeout: Duration,

    /// Age after which a lock file is considered abandoned
    #[serde(with = "duration_serde")]
    pub lock_stale_threshold: Duration,

    /// Lifetime of cached workspace metadata
    #[serde(with = "duration_serde")]
    pub cache_ttl: Duration,

    /// Retry policy for network-facing git calls
    pub retry: RetryConfig,
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            root: None,
            parallel_workers: DEFAULT_WORKERS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_stale_threshold: DEFAULT_STALE_THRESHOLD,
            cache_ttl: DEFAULT_CACHE_TTL,
            retry: RetryConfig::default(),
        }
    }
}

impl GroveConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.parallel_workers) {
            return Err(ConfigError::InvalidValue(format!(
                "parallel_workers must be between {} and {}, got {}",
                MIN_WORKERS, MAX_WORKERS, self.parallel_workers
            )));
        }

        if self.lock_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "lock_timeout must be greater than zero".to_string(),
            ));
        }

        if self.lock_stale_threshold.is_zero() {
            return Err(ConfigError::InvalidValue(
                "lock_stale_threshold must be greater than zero".to_string(),
            ));
        }

        if let Some(root) = &self.root {
            if root.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "root cannot be empty".to_string(),
                ));
            }
        }

        self.retry.validate()
    }
}
