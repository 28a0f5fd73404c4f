//! SiteLink Common Library
//!
//! This crate provides shared types and utilities for the SiteLink telemetry agent:
//!
//! - [`payload`] - Site telemetry data model (`MetricSample`, `SitePayload`)
//! - [`config`] - Broker, store and logging configuration (JSON5 format)
//! - [`clock`] - Injectable time source (`SystemClock`, `ManualClock`)
//! - [`retry`] - Shared retry-with-backoff policy
//! - [`topic`] - MQTT topic builders and parsers
//! - [`error`] - Error types

pub mod clock;
pub mod config;
pub mod error;
pub mod payload;
pub mod retry;
pub mod topic;

// Re-export commonly used types at the crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BaseConfig, BrokerConfig, LogFormat, LoggingConfig, StoreConfig, load_config, parse_config,
};
pub use error::{Error, Result};
pub use payload::{ComponentPayload, MetricSample, SitePayload, format_timestamp};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use topic::{TOPIC_PREFIX, TopicBuilder, parse_topic};

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
///
/// # Example
///
/// ```ignore
/// use sitelink_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
