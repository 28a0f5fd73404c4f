//! Agent status reporting.

use serde::{Deserialize, Serialize};

/// Agent status message, published retained on the site's status topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStatus {
    /// Agent name (e.g., "sitelink-modbus").
    pub agent: String,
    /// Agent version.
    pub version: String,
    /// Site the agent reports for.
    pub site_id: u32,
    /// Current status ("online", "offline").
    pub status: String,
    /// Additional metadata (device list, poll interval, ...).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl SiteStatus {
    /// Create a status with "online" state.
    pub fn online(agent: impl Into<String>, version: impl Into<String>, site_id: u32) -> Self {
        Self {
            agent: agent.into(),
            version: version.into(),
            site_id,
            status: "online".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a status with "offline" state.
    pub fn offline(agent: impl Into<String>, version: impl Into<String>, site_id: u32) -> Self {
        Self {
            agent: agent.into(),
            version: version.into(),
            site_id,
            status: "offline".to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Serialized message body.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and a JSON value always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}
