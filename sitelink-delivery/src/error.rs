//! Error types for delivery and agent lifecycle.

use thiserror::Error;

/// Result type alias using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised while starting or running an agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// The durable store could not be opened.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The broker client could not be constructed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a worker error.
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::Worker(msg.into())
    }
}

impl From<json5::Error> for AgentError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<sitelink_common::Error> for AgentError {
    fn from(err: sitelink_common::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A publish attempt that did not reach the broker.
///
/// Gateways resolve every transport failure into one of these values; the
/// caller decides whether to queue the payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Broker is not connected")]
    NotConnected,

    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No acknowledgement within {0:?}")]
    AckTimeout(std::time::Duration),

    #[error("Broker rejected the message: {0}")]
    Rejected(String),
}

/// Failures of the durable queue store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Store query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Failed to serialize payload for storage: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
