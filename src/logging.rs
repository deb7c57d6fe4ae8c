//! logging
//!
//! Tracing subscriber setup for binaries and tests embedding the engine.
//!
//! The library itself only emits `tracing` events; nothing is printed
//! unless a subscriber is installed. [`init`] installs a `fmt` subscriber
//! filtered by `GROVE_LOG` (same syntax as `RUST_LOG`), falling back to a
//! level chosen from a verbosity count.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "GROVE_LOG";

/// Default filter for a verbosity count (`-v` repetitions).
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "grovework=warn",
        1 => "grovework=info",
        2 => "grovework=debug",
        _ => "grovework=trace",
    }
}

fn filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)))
}

/// Install the global subscriber, writing to stderr.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(verbosity: u8) {
    // An error only means a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Install a subscriber that writes through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(2))
        .with_test_writer()
        .try_init();
}
