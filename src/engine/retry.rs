//! engine::retry
//!
//! Retry with exponential backoff and jitter for flaky network calls.
//!
//! # Classification
//!
//! Every error passed through [`RetryExecutor`] is classified via the
//! [`Classify`] trait:
//! - **Retryable**: timeouts, refused/reset connections, DNS failures,
//!   5xx responses, transport resets, contention on git's own lock files
//! - **Permanent**: authentication failures, missing resources, invalid
//!   requests, and anything unrecognized
//!
//! Permanent errors return immediately with zero retries.
//!
//! # Backoff
//!
//! Before retry `n` (n >= 1) the executor waits
//! `min(max_delay, initial_delay * multiplier^(n-1))`, scaled by a uniform
//! factor in `[1 - jitter_factor, 1 + jitter_factor]`. The wait observes
//! the caller's [`Context`].
//!
//! Only network-facing operations belong here. Local operations (worktree
//! creation, status) must never be wrapped.
//!
//! # Example
//!
//! ```ignore
//! use grovework::engine::retry::{RetryConfig, RetryExecutor};
//!
//! let retry = RetryExecutor::new(RetryConfig::default());
//! retry.run(&ctx, "fetch api", || git.fetch(&ctx, &repo_dir)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::{Context, Interrupt};
use crate::core::config::duration_serde;
use crate::core::config::ConfigError;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Classification hook for errors passed through [`RetryExecutor`].
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

const RETRYABLE_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "connection closed",
    "could not resolve host",
    "name or service not known",
    "temporary failure in name resolution",
    "early eof",
    "unexpected disconnect",
    "the remote end hung up unexpectedly",
    "transport endpoint",
    "broken pipe",
    "rpc failed",
    "couldn't connect to server",
    "failed to connect to",
    "gnutls_handshake() failed",
    "the requested url returned error: 5",
    // Another git process holds one of the repository's own lock files.
    "cannot lock ref",
    "': file exists",
    "http 500",
    "http 502",
    "http 503",
    "http 504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "could not read username",
    "invalid username or password",
    "repository not found",
    "fatal: repository '",
    "does not appear to be a git repository",
    "not a git repository",
    "couldn't find remote ref",
    "http 401",
    "http 403",
    "http 404",
    "the requested url returned error: 401",
    "the requested url returned error: 403",
    "the requested url returned error: 404",
    "invalid refspec",
    "invalid reference",
    "is not a valid branch name",
    "already exists",
];

/// Classify free-form error text (typically git stderr).
///
/// Permanent patterns are checked first so that e.g. an authentication
/// failure reported over a flaky connection is not retried. Unrecognized
/// text is permanent.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Permanent;
    }
    if RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Retryable;
    }
    ErrorClass::Permanent
}

/// Retry tuning.
///
/// # Example
///
/// ```toml
/// [retry]
/// max_attempts = 3
/// initial_delay = "1s"
/// max_delay = "30s"
/// multiplier = 2.0
/// jitter_factor = 0.25
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::InvalidValue(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidValue(
                "retry.max_delay must be >= retry.initial_delay".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidValue(format!(
                "retry.jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Un-jittered delay before retry `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry `attempt` with jitter applied.
    pub fn jittered_delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let factor =
            rng.random_range((1.0 - self.jitter_factor)..=(1.0 + self.jitter_factor));
        base.mul_f64(factor)
    }
}

/// Errors from [`RetryExecutor::run`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation failed with a non-retryable error.
    #[error("{0}")]
    Permanent(#[source] E),

    /// Every attempt failed with a retryable error.
    #[error("giving up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The context stopped before or between attempts.
    #[error("{reason} after {attempts} attempts")]
    Interrupted { reason: Interrupt, attempts: u32 },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying operation error, if any attempt ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Permanent(e) => Some(e),
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::Interrupted { .. } => None,
        }
    }

    /// Consume the error, returning the underlying operation error if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(e) => Some(e),
            RetryError::Exhausted { source, .. } => Some(source),
            RetryError::Interrupted { .. } => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted { .. })
    }
}

/// Runs an operation, retrying retryable failures with backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts
    /// `max_attempts`, or `ctx` stops.
    ///
    /// `label` identifies the operation in logs.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &Context,
        label: &str,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if let Err(reason) = ctx.check() {
                return Err(RetryError::Interrupted {
                    reason,
                    attempts: attempt,
                });
            }

            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(label, attempt, error = %err, "permanent failure, not retrying");
                return Err(RetryError::Permanent(err));
            }

            if attempt >= max_attempts {
                warn!(label, attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.config.jittered_delay(attempt, &mut rand::rng());
            info!(
                label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );

            if let Err(reason) = ctx.sleep(delay).await {
                return Err(RetryError::Interrupted {
                    reason,
                    attempts: attempt,
                });
            }
        }
    }
}
