//! Logging setup for the provider.
//!
//! Logs go to **stderr**; stdout belongs to the plugin host. Filtering follows
//! `RUST_LOG` and falls back to `info`.
//!
//! ```bash
//! # Poll-level detail from the controllers only
//! RUST_LOG=info,udb_provider=debug ./provider
//! ```

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Level used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LEVEL: &str = "info";

/// The filter from `RUST_LOG`, or `default_level` when unset or invalid.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn try_init_with(default_level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .try_init()
}

/// Install the global subscriber at the default level.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default(DEFAULT_LEVEL);
}

/// Install the global subscriber, using `default_level` when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    if let Err(e) = try_init_with(default_level) {
        panic!("failed to install the tracing subscriber: {}", e);
    }
}

/// Like [`init_logging`], returning `false` instead of panicking when a
/// subscriber is already installed.
pub fn try_init_logging() -> bool {
    try_init_with(DEFAULT_LEVEL).is_ok()
}

#[cfg(test)]
mod tests {
    // The global subscriber can only be set once per process, so only the
    // filter and the non-panicking entry point are exercised here.

    use super::*;

    #[test]
    fn test_env_filter_parsing() {
        assert!(EnvFilter::try_new(DEFAULT_LEVEL).is_ok());
        assert!(EnvFilter::try_new("udb_provider=debug").is_ok());
        assert!(EnvFilter::try_new("warn,udb_provider::resources=debug").is_ok());
    }

    #[test]
    fn test_try_init_is_idempotent() {
        let _ = try_init_logging();
        assert!(!try_init_logging());
    }
}
