//! Site telemetry data model.
//!
//! A polling cycle turns each device's registers into a [`MetricSample`],
//! merges samples into per-component metric sets and wraps them in a
//! timestamped [`SitePayload`], which is what gets published or queued.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Metric values of one device for one cycle, keyed by register description.
///
/// A `None` value marks a register whose read failed after all retries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSample {
    values: BTreeMap<String, Option<f64>>,
}

impl MetricSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully decoded value.
    pub fn record(&mut self, description: impl Into<String>, value: f64) {
        self.values.insert(description.into(), Some(value));
    }

    /// Record a register that produced no value this cycle.
    pub fn record_absent(&mut self, description: impl Into<String>) {
        self.values.insert(description.into(), None);
    }

    /// Value for a description; `None` if absent or never recorded.
    pub fn get(&self, description: &str) -> Option<f64> {
        self.values.get(description).copied().flatten()
    }

    /// Whether the description was recorded as a failed read.
    pub fn is_absent(&self, description: &str) -> bool {
        matches!(self.values.get(description), Some(None))
    }

    /// Iterate over the values that were actually read.
    pub fn present(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values
            .iter()
            .filter_map(|(desc, value)| value.map(|v| (desc.as_str(), v)))
    }

    pub fn present_count(&self) -> usize {
        self.present().count()
    }

    pub fn absent_count(&self) -> usize {
        self.values.len() - self.present_count()
    }

    /// True when at least one register produced a value.
    pub fn has_data(&self) -> bool {
        self.values.values().any(Option::is_some)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Metrics of one logical site component (e.g. "bess", "grid_meter").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentPayload {
    /// Human-readable component name.
    pub name: String,

    /// Scaled values keyed by register description.
    pub metrics: BTreeMap<String, f64>,
}

/// Site-level telemetry snapshot produced by one polling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitePayload {
    /// ISO-8601 / RFC 3339 acquisition time.
    pub timestamp: String,

    /// Site identifier.
    pub site_id: u32,

    /// Components keyed by their configured key.
    pub components: BTreeMap<String, ComponentPayload>,
}

impl SitePayload {
    /// Create a payload stamped with `timestamp` in UTC, millisecond precision.
    pub fn new(
        timestamp: DateTime<Utc>,
        site_id: u32,
        components: BTreeMap<String, ComponentPayload>,
    ) -> Self {
        Self {
            timestamp: format_timestamp(timestamp),
            site_id,
            components,
        }
    }

    /// Check that the payload has a parseable timestamp and at least one component.
    pub fn validate(&self) -> Result<()> {
        if DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(Error::Validation(format!(
                "unparseable timestamp '{}'",
                self.timestamp
            )));
        }

        if self.components.is_empty() {
            return Err(Error::Validation("payload has no components".to_string()));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Total number of metric values across all components.
    pub fn metric_count(&self) -> usize {
        self.components.values().map(|c| c.metrics.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(Error::from)
    }
}

/// Format a timestamp the way payloads carry it.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
