//! Publish gateway abstraction.
//!
//! A [`PublishGateway`] is the only path from the agent to the remote broker.
//! It owns the broker connectivity state: implementations update it from
//! their own lifecycle events and expose it read-only, through
//! [`PublishGateway::state`] for point checks and through a
//! [`tokio::sync::watch`] receiver for callers that react to transitions.

use async_trait::async_trait;
use tokio::sync::watch;

use sitelink_common::SitePayload;

use crate::error::DeliveryError;

/// Broker connectivity as last reported by the broker client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Remote publish endpoint.
#[async_trait]
pub trait PublishGateway: Send + Sync {
    /// Publish a payload on the deployment's telemetry topic.
    ///
    /// Every failure (not connected, transport error, missing acknowledgement,
    /// broker rejection) is returned as a [`DeliveryError`].
    async fn publish(&self, payload: &SitePayload) -> Result<(), DeliveryError>;

    /// Current connectivity.
    fn state(&self) -> ConnectionState;

    /// Subscribe to connectivity transitions.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Close the broker connection.
    async fn close(&self);

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

/// Statistics from a batch of publish attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Number of successfully published payloads.
    pub success: usize,
    /// Number of failed publishes.
    pub failed: usize,
}

impl PublishStats {
    /// Total number of attempted publishes.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }

    pub fn record(&mut self, result: &Result<(), DeliveryError>) {
        match result {
            Ok(()) => self.success += 1,
            Err(_) => self.failed += 1,
        }
    }
}
