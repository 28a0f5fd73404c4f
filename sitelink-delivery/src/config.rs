//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use sitelink_common::{BrokerConfig, LoggingConfig, StoreConfig, TopicBuilder};

use crate::error::{AgentError, Result};

/// Trait for agent configuration types.
///
/// Implement this trait for an agent's configuration struct to get
/// loading, validation and access to the delivery sections.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use sitelink_delivery::{AgentConfig, BrokerConfig, LoggingConfig, StoreConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyAgentConfig {
///     pub site_id: u32,
///     #[serde(default)]
///     pub broker: BrokerConfig,
///     #[serde(default)]
///     pub store: StoreConfig,
///     #[serde(default)]
///     pub logging: LoggingConfig,
///     pub devices: Vec<MyDevice>,
/// }
///
/// impl AgentConfig for MyAgentConfig {
///     fn broker(&self) -> &BrokerConfig {
///         &self.broker
///     }
///
///     fn store(&self) -> &StoreConfig {
///         &self.store
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn site_id(&self) -> u32 {
///         self.site_id
///     }
///
///     fn validate(&self) -> Result<()> {
///         if self.devices.is_empty() {
///             return Err(AgentError::validation("At least one device required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait AgentConfig: Sized + DeserializeOwned {
    /// Broker connection section.
    fn broker(&self) -> &BrokerConfig;

    /// Durable queue section.
    fn store(&self) -> &StoreConfig;

    /// Logging section.
    fn logging(&self) -> &LoggingConfig;

    /// Site this agent reports for.
    fn site_id(&self) -> u32;

    /// Topics derived from the broker section and the site id.
    fn topics(&self) -> TopicBuilder {
        TopicBuilder::from_config(self.broker(), self.site_id())
    }

    /// Extra fields published with the agent's online/offline status.
    fn status_metadata(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Parse configuration from a JSON5 string and validate it.
    fn parse(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        validate_delivery(config.broker(), config.store())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(AgentError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

/// Checks on the delivery sections every agent shares.
pub fn validate_delivery(broker: &BrokerConfig, store: &StoreConfig) -> Result<()> {
    if broker.host.trim().is_empty() {
        return Err(AgentError::validation("broker.host must not be empty"));
    }
    if broker.port == 0 {
        return Err(AgentError::validation("broker.port must not be 0"));
    }
    if broker.qos > 2 {
        return Err(AgentError::validation(format!(
            "broker.qos must be 0, 1 or 2 (got {})",
            broker.qos
        )));
    }
    if broker.keep_alive_secs == 0 {
        return Err(AgentError::validation(
            "broker.keep_alive_secs must be at least 1",
        ));
    }
    if broker.qos > 0 && broker.ack_timeout_ms == 0 {
        return Err(AgentError::validation(
            "broker.ack_timeout_ms must be at least 1 when qos is 1 or 2",
        ));
    }
    if broker.username.is_some() != broker.password.is_some() {
        return Err(AgentError::validation(
            "broker.username and broker.password must be set together",
        ));
    }

    if store.max_retries == 0 {
        return Err(AgentError::validation("store.max_retries must be at least 1"));
    }
    if store.drain_batch == 0 {
        return Err(AgentError::validation("store.drain_batch must be at least 1"));
    }
    if store.retention_days == 0 {
        return Err(AgentError::validation(
            "store.retention_days must be at least 1",
        ));
    }
    if store.cleanup_interval_hours == 0 {
        return Err(AgentError::validation(
            "store.cleanup_interval_hours must be at least 1",
        ));
    }

    Ok(())
}
