//! SiteLink Delivery
//!
//! Resilient delivery of site payloads to an MQTT broker, and the lifecycle
//! shared by every SiteLink agent.
//!
//! # Overview
//!
//! This crate provides:
//! - [`PublishGateway`] trait, the single path from the agent to the broker
//! - [`MqttGateway`] implementing it over `rumqttc`
//! - [`DeliveryQueue`] for durable store-and-forward with retry and dead letters
//! - [`AgentConfig`] trait for configuration loading and validation
//! - [`AgentRunner`] for managing agent lifecycle (startup, shutdown, signal handling)
//! - [`AgentArgs`] for common CLI argument parsing
//! - [`SiteStatus`] for the retained online/offline status message
//!
//! # Example
//!
//! ```ignore
//! use sitelink_delivery::{AgentArgs, AgentConfig, AgentRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = AgentArgs::parse_with_default("myagent.json5");
//!     let config = MyAgentConfig::load(&args.config)?;
//!
//!     let mut runner = AgentRunner::new_with_args("myagent", config, Some(&args)).await?;
//!
//!     // Spawn protocol-specific workers
//!     runner.spawn(my_worker(runner.gateway(), runner.queue(), runner.shutdown_token()));
//!
//!     // Run until Ctrl+C
//!     runner.run().await
//! }
//! ```

mod args;
mod config;
mod error;
mod gateway;
mod mqtt;
mod queue;
mod runner;
mod status;

pub use args::AgentArgs;
pub use config::{AgentConfig, validate_delivery};
pub use error::{AgentError, DeliveryError, Result, StorageError};
pub use gateway::{ConnectionState, PublishGateway, PublishStats};
pub use mqtt::{MqttGateway, qos_from_level};
pub use queue::{DeliveryQueue, DrainReport, QueueStats, QueuedPayload};
pub use runner::AgentRunner;
pub use status::SiteStatus;

// Re-export commonly used types from sitelink-common
pub use sitelink_common::{
    BrokerConfig, Clock, LoggingConfig, SitePayload, StoreConfig, TopicBuilder,
};
