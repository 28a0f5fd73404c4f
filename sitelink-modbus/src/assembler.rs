//! Site payload assembly.
//!
//! Devices report for site components; several devices may share one
//! component key. Their metrics are merged in polling order, so on a
//! description collision the device polled later wins. Absent values never
//! overwrite a value and never appear in the payload.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use sitelink_common::{ComponentPayload, SitePayload};

use crate::config::SiteConfig;
use crate::poller::DeviceReading;

/// Component a device reports for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRef {
    pub key: String,
    pub name: String,
}

/// Device name to component mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentMap {
    devices: HashMap<String, ComponentRef>,
}

impl ComponentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the mapping of every configured device.
    pub fn from_config(config: &SiteConfig) -> Self {
        let mut map = Self::new();
        for device in &config.devices {
            let key = device.component_key();
            map.insert(&device.name, key, config.component_name(key));
        }
        map
    }

    pub fn insert(
        &mut self,
        device: impl Into<String>,
        key: impl Into<String>,
        name: impl Into<String>,
    ) {
        self.devices.insert(
            device.into(),
            ComponentRef {
                key: key.into(),
                name: name.into(),
            },
        );
    }

    /// Component of `device`; unmapped devices are their own component.
    pub fn resolve(&self, device: &str) -> ComponentRef {
        self.devices.get(device).cloned().unwrap_or_else(|| ComponentRef {
            key: device.to_string(),
            name: device.to_string(),
        })
    }
}

/// Merge device readings into a site payload.
///
/// Components left without any present metric are omitted, so the result
/// is invalid (and must not be published) when no device produced data.
pub fn assemble(
    timestamp: DateTime<Utc>,
    site_id: u32,
    readings: &[DeviceReading],
    mapping: &ComponentMap,
) -> SitePayload {
    let mut components: BTreeMap<String, ComponentPayload> = BTreeMap::new();

    for reading in readings {
        let component = mapping.resolve(&reading.device);
        let entry = components
            .entry(component.key)
            .or_insert_with(|| ComponentPayload {
                name: component.name,
                metrics: BTreeMap::new(),
            });

        for (description, value) in reading.sample.present() {
            entry.metrics.insert(description.to_string(), value);
        }
    }

    components.retain(|_, component| !component.metrics.is_empty());

    SitePayload::new(timestamp, site_id, components)
}

/// [`assemble`] bound to one site's configuration.
#[derive(Debug, Clone)]
pub struct PayloadAssembler {
    site_id: u32,
    mapping: ComponentMap,
}

impl PayloadAssembler {
    pub fn new(site_id: u32, mapping: ComponentMap) -> Self {
        Self { site_id, mapping }
    }

    pub fn from_config(config: &SiteConfig) -> Self {
        Self::new(config.site_id, ComponentMap::from_config(config))
    }

    pub fn site_id(&self) -> u32 {
        self.site_id
    }

    pub fn assemble(&self, timestamp: DateTime<Utc>, readings: &[DeviceReading]) -> SitePayload {
        assemble(timestamp, self.site_id, readings, &self.mapping)
    }
}
