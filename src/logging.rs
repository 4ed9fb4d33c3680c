//! Process-wide logging setup.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the
//! application. [`init_logging`] is the subscriber the `leasework` binary uses.

use crate::{LeaseworkError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Build the filter for `config`. `RUST_LOG`, when set, takes precedence.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            LeaseworkError::Config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Install a global `fmt` subscriber.
///
/// Returns an error if the level is not a valid filter directive. A second call
/// leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    // try_init fails only when a global subscriber already exists
    let _ = if config.json_format {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };

    Ok(())
}
