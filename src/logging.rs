//! Subscriber setup for the `tracing` output of the queue.
//!
//! Libraries embedding `jobkeeper` usually install their own subscriber; this
//! is for the `jobkeeper` binary and for services that want the configured
//! defaults.

use crate::{JobkeeperError, Result, config::LoggingConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG` if set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => directives,
        _ => config.level.clone(),
    };
    EnvFilter::try_new(&directives).map_err(|e| {
        JobkeeperError::Config(format!("Invalid log filter '{}': {}", directives, e))
    })
}

/// Installs a global subscriber, plain text or JSON lines depending on
/// `json_format`. Fails if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter(config)?);

    let result = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    };
    result.map_err(|e| JobkeeperError::Config(format!("Failed to initialize logging: {}", e)))?;

    info!(service = %config.service_name, "Logging initialized");
    Ok(())
}
