//! core::config
//!
//! Configuration schema and loading.
//!
//! # Precedence
//!
//! Configuration values are resolved in this order (later overrides earlier):
//! 1. Default values
//! 2. Config file
//! 3. Explicit overrides by the embedding application (not handled here)
//!
//! # Config Locations
//!
//! Searched in order:
//! 1. `$GROVE_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/grove/config.toml`
//! 3. `~/.grove/config.toml`
//!
//! # Example
//!
//! ```no_run
//! use grovework::core::config::Config;
//!
//! let config = Config::load().unwrap();
//! println!("Workers: {}", config.parallel_workers());
//! println!("Lock timeout: {:?}", config.lock_timeout());
//! ```

pub mod duration_serde;
pub mod schema;

pub use schema::GroveConfig;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::engine::retry::RetryConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "GROVE_CONFIG";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("home directory not found")]
    NoHomeDir,
}

/// Loaded configuration.
///
/// Accessors return the effective values; defaults apply to anything the
/// file left out.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Parsed config file contents
    pub file: GroveConfig,
    /// Path to the config file (if one was loaded)
    loaded_from: Option<PathBuf>,
}

impl Config {
    /// Wrap an already-built configuration.
    pub fn new(file: GroveConfig) -> Result<Self, ConfigError> {
        file.validate()?;
        Ok(Self {
            file,
            loaded_from: None,
        })
    }

    /// Load configuration from the default locations.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed or
    /// fails validation. A missing config file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let found = find_config_path(|key| std::env::var(key).ok(), dirs::home_dir());
        match found {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let file: GroveConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        file.validate()?;

        debug!(path = %path.display(), "loaded config");
        Ok(Self {
            file,
            loaded_from: Some(path.to_path_buf()),
        })
    }

    // =========================================================================
    // Accessor methods
    // =========================================================================

    /// Get the Grove data directory.
    ///
    /// Defaults to `~/.grove` if not configured.
    pub fn root(&self) -> Result<PathBuf, ConfigError> {
        match &self.file.root {
            Some(root) => Ok(root.clone()),
            None => {
                let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
                Ok(home.join(".grove"))
            }
        }
    }

    pub fn parallel_workers(&self) -> usize {
        self.file.parallel_workers
    }

    pub fn lock_timeout(&self) -> Duration {
        self.file.lock_timeout
    }

    pub fn lock_stale_threshold(&self) -> Duration {
        self.file.lock_stale_threshold
    }

    pub fn cache_ttl(&self) -> Duration {
        self.file.cache_ttl
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.file.retry
    }

    /// Get the path to the loaded config file.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.loaded_from.as_deref()
    }
}

/// Locate the config file using the documented search order.
///
/// `env` looks up environment variables; `home` is the user's home
/// directory. Only existing files are returned.
pub fn find_config_path(
    env: impl Fn(&str) -> Option<String>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    // 1. $GROVE_CONFIG
    if let Some(path) = env(CONFIG_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. $XDG_CONFIG_HOME/grove/config.toml
    if let Some(xdg_home) = env("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_home).join("grove/config.toml");
        if path.exists() {
            return Some(path);
        }
    }

    // 3. ~/.grove/config.toml
    if let Some(home) = home {
        let path = home.join(".grove/config.toml");
        if path.exists() {
            return Some(path);
        }
    }

    None
}
