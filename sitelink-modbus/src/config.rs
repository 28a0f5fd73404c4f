//! Configuration for the Modbus agent.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sitelink_common::{BrokerConfig, LoggingConfig, RetryPolicy, StoreConfig};
use sitelink_delivery::{AgentConfig, AgentError};

use crate::decoder::{ByteOrder, DataType, words_for};

/// Highest Modbus unit identifier addressable on a bus.
pub const MAX_UNIT_ID: u8 = 247;

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site reported in every payload.
    pub site_id: u32,

    /// Seconds between the start of one polling cycle and the next.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Broker connection settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Durable delivery queue settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Register read retry and pacing
    #[serde(default)]
    pub polling: PollingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Site components by key, e.g. `bess` -> "Battery Energy Storage"
    #[serde(default)]
    pub components: BTreeMap<String, ComponentConfig>,

    /// Devices to poll, in polling order
    pub devices: Vec<DeviceConfig>,
}

fn default_poll_interval() -> u64 {
    10
}

/// A logical part of the site that one or more devices report for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Human-readable component name.
    pub name: String,
}

/// Register read behaviour shared by all devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Attempts per connect and per register read, including the first one.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay of the read backoff (`base * 2^attempt`).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Pause between two register reads on the same device.
    #[serde(default = "default_inter_read_delay_ms")]
    pub inter_read_delay_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-read response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Enable TCP keep-alive on device connections
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_inter_read_delay_ms() -> u64 {
    50
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_keepalive() -> bool {
    true
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            inter_read_delay_ms: default_inter_read_delay_ms(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            keepalive: default_keepalive(),
        }
    }
}

impl PollingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn inter_read_delay(&self) -> Duration {
        Duration::from_millis(self.inter_read_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Configuration for a single Modbus TCP device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in logs and status)
    pub name: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Component this device reports for; defaults to the device name.
    #[serde(default)]
    pub component: Option<String>,

    /// Layout of 32-bit values on this device.
    pub byte_order: ByteOrder,

    /// Registers to read, in order
    pub registers: Vec<RegisterConfig>,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceConfig {
    /// Key of the component this device's metrics are merged into.
    pub fn component_key(&self) -> &str {
        self.component.as_deref().unwrap_or(&self.name)
    }

    /// Connection target of this device.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
        }
    }
}

/// Where and whom to talk to on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Configuration for one register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Register address as documented by the device (1-based)
    pub address: u16,

    /// Metric name in the payload
    #[serde(alias = "desc")]
    pub description: String,

    /// Register bank
    #[serde(rename = "type", default)]
    pub register_type: RegisterType,

    /// Word interpretation
    pub data_type: DataType,

    /// Scaling factor applied to the decoded value
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Overrides the device byte order for this register
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl RegisterConfig {
    /// Zero-based address sent on the wire.
    pub fn wire_address(&self) -> u16 {
        self.address.saturating_sub(1)
    }

    /// Number of 16-bit words this register spans.
    pub fn word_count(&self) -> u16 {
        words_for(self.data_type)
    }

    /// Byte order used to decode this register on `device`.
    pub fn byte_order_on(&self, device: &DeviceConfig) -> ByteOrder {
        self.byte_order.unwrap_or(device.byte_order)
    }
}

/// Modbus register banks readable as 16-bit words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Holding registers (function code 0x03)
    #[default]
    Holding,
    /// Input registers (function code 0x04)
    Input,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        }
    }

    /// Modbus function code used to read this bank.
    pub fn function_code(&self) -> u8 {
        match self {
            RegisterType::Holding => 0x03,
            RegisterType::Input => 0x04,
        }
    }
}

impl SiteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Display name of a component key; unknown keys name themselves.
    pub fn component_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.components
            .get(key)
            .map(|c| c.name.as_str())
            .unwrap_or(key)
    }

    fn validate_device(&self, device: &DeviceConfig) -> Result<(), AgentError> {
        let fail = |msg: String| {
            Err(AgentError::validation(format!(
                "Device '{}': {}",
                device.name, msg
            )))
        };

        if device.host.trim().is_empty() {
            return fail("host cannot be empty".to_string());
        }
        if device.port == 0 {
            return fail("port cannot be 0".to_string());
        }
        if device.unit_id == 0 || device.unit_id > MAX_UNIT_ID {
            return fail(format!("unit_id must be 1-{}", MAX_UNIT_ID));
        }
        if let Some(component) = &device.component {
            if !self.components.contains_key(component) {
                return fail(format!("unknown component '{}'", component));
            }
        }
        if device.registers.is_empty() {
            return fail("at least one register must be configured".to_string());
        }

        let mut descriptions = HashSet::new();
        for register in &device.registers {
            if register.description.trim().is_empty() {
                return fail(format!(
                    "register {} has an empty description",
                    register.address
                ));
            }
            if !descriptions.insert(register.description.as_str()) {
                return fail(format!(
                    "duplicate register description '{}'",
                    register.description
                ));
            }
            if register.address == 0 {
                return fail(format!(
                    "register '{}': addresses are 1-based",
                    register.description
                ));
            }
            let last = u32::from(register.address) + u32::from(register.word_count()) - 1;
            if last > u32::from(u16::MAX) {
                return fail(format!(
                    "register '{}': {} at address {} runs past 65535",
                    register.description, register.data_type, register.address
                ));
            }
            if !register.multiplier.is_finite() {
                return fail(format!(
                    "register '{}': multiplier must be finite",
                    register.description
                ));
            }
        }

        Ok(())
    }
}

impl AgentConfig for SiteConfig {
    fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    fn store(&self) -> &StoreConfig {
        &self.store
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn site_id(&self) -> u32 {
        self.site_id
    }

    fn status_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.devices.iter().map(|d| &d.name).collect::<Vec<_>>(),
            "components": self.components.keys().collect::<Vec<_>>(),
            "poll_interval_secs": self.poll_interval_secs,
        })
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.poll_interval_secs == 0 {
            return Err(AgentError::validation(
                "poll_interval_secs must be at least 1",
            ));
        }

        if self.polling.retry_attempts == 0 {
            return Err(AgentError::validation(
                "polling.retry_attempts must be at least 1",
            ));
        }

        if self.devices.is_empty() {
            return Err(AgentError::validation(
                "At least one device must be configured",
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(AgentError::validation("Device name cannot be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(AgentError::validation(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }
            self.validate_device(device)?;
        }

        for (key, component) in &self.components {
            if component.name.trim().is_empty() {
                return Err(AgentError::validation(format!(
                    "Component '{}': name cannot be empty",
                    key
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        site_id: 42,
        components: {
            bess: { name: "Battery Energy Storage" },
        },
        devices: [
            {
                name: "bess_pcs",
                host: "192.168.1.10",
                component: "bess",
                byte_order: "big_endian",
                registers: [
                    { address: 1, description: "soc", type: "holding", data_type: "float" },
                    { address: 3, description: "power", type: "input", data_type: "int16", multiplier: 0.1 },
                ],
            },
        ],
    }"#;

    fn parse(json: &str) -> Result<SiteConfig, AgentError> {
        SiteConfig::parse(json)
    }

    #[test]
    fn test_parse_site_config() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.site_id, 42);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.polling, PollingConfig::default());

        let device = &config.devices[0];
        assert_eq!(device.port, 502); // default
        assert_eq!(device.unit_id, 1); // default
        assert_eq!(device.component_key(), "bess");
        assert_eq!(config.component_name("bess"), "Battery Energy Storage");

        let power = &device.registers[1];
        assert_eq!(power.register_type, RegisterType::Input);
        assert_eq!(power.data_type, DataType::Int16);
        assert_eq!(power.multiplier, 0.1);
        assert_eq!(power.wire_address(), 2);
    }

    #[test]
    fn test_register_byte_order_override() {
        let config = parse(
            r#"{
            site_id: 1,
            devices: [{
                name: "meter",
                host: "meter.local",
                byte_order: "word_swapped",
                registers: [
                    { address: 100, description: "a", data_type: "float" },
                    { address: 102, description: "b", data_type: "float", byte_order: "big_endian" },
                ],
            }],
        }"#,
        )
        .unwrap();

        let device = &config.devices[0];
        assert_eq!(device.registers[0].register_type, RegisterType::Holding);
        assert_eq!(device.registers[0].byte_order_on(device), ByteOrder::WordSwapped);
        assert_eq!(device.registers[1].byte_order_on(device), ByteOrder::BigEndian);
        // Without a component the device reports for itself
        assert_eq!(device.component_key(), "meter");
        assert_eq!(config.component_name("meter"), "meter");
    }

    #[test]
    fn test_register_desc_shorthand() {
        let json = MINIMAL.replace(
            "description: \"soc\", type: \"holding\", data_type: \"float\"",
            "desc: \"voltage_phase_r\", type: \"holding\", data_type: \"float\", multiplier: 1",
        );
        let config = parse(&json).unwrap();

        let register = &config.devices[0].registers[0];
        assert_eq!(register.description, "voltage_phase_r");
        assert_eq!(register.register_type, RegisterType::Holding);
        assert_eq!(register.multiplier, 1.0);
    }

    #[test]
    fn test_unsupported_data_type_rejected() {
        let json = MINIMAL.replace("\"int16\"", "\"uint32\"");
        let err = parse(&json).unwrap_err();
        assert!(matches!(err, AgentError::ConfigParse(_)));
        assert!(err.to_string().contains("uint32"));
    }

    #[test]
    fn test_missing_byte_order_rejected() {
        let json = MINIMAL.replace("byte_order: \"big_endian\",", "");
        assert!(matches!(parse(&json), Err(AgentError::ConfigParse(_))));
    }

    #[test]
    fn test_validate_empty_devices() {
        let result = parse("{ site_id: 1, devices: [] }");
        assert!(matches!(result, Err(AgentError::ConfigValidation(_))));
    }

    #[test]
    fn test_validate_unit_id_range() {
        for unit_id in ["0", "248"] {
            let json = MINIMAL.replace(
                "host: \"192.168.1.10\",",
                &format!("host: \"192.168.1.10\", unit_id: {},", unit_id),
            );
            assert!(
                matches!(parse(&json), Err(AgentError::ConfigValidation(_))),
                "unit_id {unit_id}"
            );
        }
    }

    #[test]
    fn test_validate_addresses() {
        let zero = MINIMAL.replace("address: 1,", "address: 0,");
        assert!(matches!(parse(&zero), Err(AgentError::ConfigValidation(_))));

        // A float at the last address would need a word past 65535
        let overflow = MINIMAL.replace("address: 1,", "address: 65535,");
        assert!(matches!(parse(&overflow), Err(AgentError::ConfigValidation(_))));

        let int16_at_end = MINIMAL.replace("address: 3,", "address: 65535,");
        assert!(parse(&int16_at_end).is_ok());
    }

    #[test]
    fn test_validate_unknown_component() {
        let json = MINIMAL.replace("component: \"bess\",", "component: \"pv\",");
        let err = parse(&json).unwrap_err();
        assert!(err.to_string().contains("unknown component 'pv'"));
    }

    #[test]
    fn test_validate_duplicates() {
        let json = MINIMAL.replace("description: \"power\"", "description: \"soc\"");
        assert!(matches!(parse(&json), Err(AgentError::ConfigValidation(_))));

        let mut config = parse(MINIMAL).unwrap();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_function_codes() {
        assert_eq!(RegisterType::Holding.function_code(), 0x03);
        assert_eq!(RegisterType::Input.function_code(), 0x04);
        assert_eq!(RegisterType::Input.as_str(), "input");
    }

    #[test]
    fn test_status_metadata() {
        let config = parse(MINIMAL).unwrap();
        let metadata = config.status_metadata();
        assert_eq!(metadata["devices"][0], "bess_pcs");
        assert_eq!(metadata["poll_interval_secs"], 10);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../sitelink.example.json5")).unwrap();
        assert!(config.devices.len() > 1);
    }
}
