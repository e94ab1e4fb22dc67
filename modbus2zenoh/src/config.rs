//! Configuration for the Modbus bridge.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modbus2zenoh_framework::{
    BridgeConfig, BridgeError, Format, LoggingConfig, ZenohConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::{
    Definition, DefinitionError, DefinitionRecord, definitions_from_records, load_definitions,
};
use crate::detector::BitFieldTrigger;
use crate::poller::PollerSettings;
use crate::registry::{DuplicateScope, Registry};

/// Errors in the Modbus section of the bridge configuration.
#[derive(Debug, Error)]
pub enum BridgeConfigError {
    #[error("at least one device must be configured")]
    NoDevices,
    #[error("device #{index}: name cannot be empty")]
    EmptyDeviceName { index: usize },
    #[error("device '{0}' is configured more than once")]
    DuplicateDevice(String),
    #[error("device '{device}': unit_id must be 1-247, got {unit_id}")]
    InvalidUnitId { device: String, unit_id: u8 },
    #[error("device '{device}': timeout_ms must be positive")]
    InvalidTimeout { device: String },
    #[error("device '{device}': {source}")]
    Definitions {
        device: String,
        #[source]
        source: DefinitionError,
    },
    #[error(transparent)]
    Registry(DefinitionError),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

impl From<BridgeConfigError> for BridgeError {
    fn from(err: BridgeConfigError) -> Self {
        BridgeError::validation(err.to_string())
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Modbus-specific settings
    pub modbus: ModbusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Payload format of published readings
    #[serde(default)]
    pub serialization: Format,
}

/// Modbus protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Key expression prefix (default: "modbus2zenoh")
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Which definitions count as claiming the same register
    #[serde(default)]
    pub duplicate_scope: DuplicateScope,

    /// When published bit fields are emitted
    #[serde(default)]
    pub bit_field_trigger: BitFieldTrigger,

    /// Devices to poll
    pub devices: Vec<DeviceConfig>,
}

fn default_key_prefix() -> String {
    "modbus2zenoh".to_string()
}

/// Configuration for a single Modbus device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (used in readings and the bridge status)
    pub name: String,

    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Connect and read timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Intervals skipped after a failed read
    #[serde(default = "default_backoff_intervals")]
    pub backoff_intervals: u32,

    /// Register definitions: a JSON file path or an inline array
    pub definitions: DefinitionSource,
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_backoff_intervals() -> u32 {
    1
}

/// Where a device's definitions come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionSource {
    /// Definitions file; relative paths resolve against the config file.
    Path(PathBuf),
    Inline(Vec<DefinitionRecord>),
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default)]
        parity: Parity,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => write!(f, "rtu://{}@{}", port, baud_rate),
        }
    }
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Serial parity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load and validate this device's definitions.
    pub fn load_definitions(&self) -> Result<Vec<Definition>, BridgeConfigError> {
        let loaded = match &self.definitions {
            DefinitionSource::Path(path) => load_definitions(path, &self.name),
            DefinitionSource::Inline(records) => {
                definitions_from_records(records.clone(), &self.name)
            }
        };
        loaded.map_err(|source| BridgeConfigError::Definitions {
            device: self.name.clone(),
            source,
        })
    }
}

impl ModbusConfig {
    /// Device named `name`.
    pub fn device(&self, name: &str) -> Result<&DeviceConfig, BridgeConfigError> {
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| BridgeConfigError::UnknownDevice(name.to_string()))
    }

    /// Poller settings for `device`.
    pub fn poller_settings(&self, device: &DeviceConfig) -> PollerSettings {
        PollerSettings {
            read_timeout: device.timeout(),
            backoff_intervals: device.backoff_intervals,
            bit_field_trigger: self.bit_field_trigger,
        }
    }

    /// Load every device's definitions and build the registry.
    ///
    /// Fails as a whole on the first invalid or duplicate definition.
    pub fn build_registry(&self) -> Result<Registry, BridgeConfigError> {
        let mut definitions = Vec::new();
        for device in &self.devices {
            definitions.extend(device.load_definitions()?);
        }
        Registry::build(definitions, self.duplicate_scope).map_err(BridgeConfigError::Registry)
    }

    /// Check the device list.
    pub fn validate(&self) -> Result<(), BridgeConfigError> {
        if self.devices.is_empty() {
            return Err(BridgeConfigError::NoDevices);
        }

        let mut names = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.trim().is_empty() {
                return Err(BridgeConfigError::EmptyDeviceName { index });
            }
            if !names.insert(device.name.as_str()) {
                return Err(BridgeConfigError::DuplicateDevice(device.name.clone()));
            }
            if !(1..=247).contains(&device.unit_id) {
                return Err(BridgeConfigError::InvalidUnitId {
                    device: device.name.clone(),
                    unit_id: device.unit_id,
                });
            }
            if device.timeout_ms == 0 {
                return Err(BridgeConfigError::InvalidTimeout {
                    device: device.name.clone(),
                });
            }
        }

        Ok(())
    }
}

impl BridgeConfig for ModbusBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> &str {
        &self.modbus.key_prefix
    }

    fn serialization(&self) -> Format {
        self.serialization
    }

    fn resolve_paths(&mut self, base: &Path) {
        for device in &mut self.modbus.devices {
            if let DefinitionSource::Path(path) = &mut device.definitions {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }

    fn validate(&self) -> modbus2zenoh_framework::Result<()> {
        self.modbus.validate().map_err(BridgeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{
            zenoh: { mode: "peer" },
            modbus: {
                devices: [
                    {
                        name: "plc01",
                        connection: { type: "tcp", host: "192.168.1.10" },
                        definitions: "plc01.json"
                    }
                ]
            }
        }"#;

        let config: ModbusBridgeConfig = json5::from_str(json).unwrap();
        assert_eq!(config.modbus.devices.len(), 1);
        assert_eq!(config.modbus.key_prefix, "modbus2zenoh");
        assert_eq!(config.modbus.duplicate_scope, DuplicateScope::AddressAndKind);
        assert_eq!(config.modbus.bit_field_trigger, BitFieldTrigger::FieldChange);
        assert_eq!(config.serialization, Format::Json);

        let device = &config.modbus.devices[0];
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.backoff_intervals, 1);
        assert_eq!(device.timeout(), Duration::from_millis(1000));
        assert_eq!(
            device.definitions,
            DefinitionSource::Path(PathBuf::from("plc01.json"))
        );

        if let ConnectionConfig::Tcp { host, port } = &device.connection {
            assert_eq!(host, "192.168.1.10");
            assert_eq!(*port, 502); // default
        } else {
            panic!("Expected TCP connection");
        }
        assert_eq!(device.connection.to_string(), "tcp://192.168.1.10:502");
    }

    #[test]
    fn test_parse_rtu_config_with_inline_definitions() {
        let json = r#"{
            serialization: "cbor",
            modbus: {
                key_prefix: "lab/psu",
                duplicate_scope: "address",
                bit_field_trigger: "register_change",
                devices: [
                    {
                        name: "hm310t",
                        connection: {
                            type: "rtu",
                            port: "/dev/ttyUSB0",
                            baud_rate: 19200,
                            parity: "even"
                        },
                        unit_id: 5,
                        timeout_ms: 250,
                        backoff_intervals: 3,
                        definitions: [
                            { address: 16, modbustype: "holding", valuetype: "uint16",
                              interval: 1, topic: "psu/voltage", title: "Voltage" }
                        ]
                    }
                ]
            }
        }"#;

        let config: ModbusBridgeConfig = json5::from_str(json).unwrap();
        config.modbus.validate().unwrap();
        assert_eq!(config.serialization, Format::Cbor);
        assert_eq!(config.modbus.duplicate_scope, DuplicateScope::Address);

        let device = config.modbus.device("hm310t").unwrap();
        assert_eq!(device.unit_id, 5);
        if let ConnectionConfig::Rtu {
            port,
            baud_rate,
            parity,
            ..
        } = &device.connection
        {
            assert_eq!(port, "/dev/ttyUSB0");
            assert_eq!(*baud_rate, 19200);
            assert_eq!(*parity, Parity::Even);
        } else {
            panic!("Expected RTU connection");
        }

        let settings = config.modbus.poller_settings(device);
        assert_eq!(settings.read_timeout, Duration::from_millis(250));
        assert_eq!(settings.backoff_intervals, 3);
        assert_eq!(settings.bit_field_trigger, BitFieldTrigger::RegisterChange);

        let registry = config.modbus.build_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.definitions_for("hm310t")[0].device, "hm310t");
    }

    #[test]
    fn test_validate_devices() {
        let parse = |devices: &str| -> ModbusBridgeConfig {
            json5::from_str(&format!("{{ modbus: {{ devices: {devices} }} }}")).unwrap()
        };

        assert!(matches!(
            parse("[]").modbus.validate(),
            Err(BridgeConfigError::NoDevices)
        ));
        assert!(matches!(
            parse(r#"[{ name: "", connection: { type: "tcp", host: "a" }, definitions: [] }]"#)
                .modbus
                .validate(),
            Err(BridgeConfigError::EmptyDeviceName { index: 0 })
        ));
        assert!(matches!(
            parse(
                r#"[{ name: "a", connection: { type: "tcp", host: "a" }, definitions: [] },
                    { name: "a", connection: { type: "tcp", host: "b" }, definitions: [] }]"#
            )
            .modbus
            .validate(),
            Err(BridgeConfigError::DuplicateDevice(_))
        ));
        assert!(matches!(
            parse(
                r#"[{ name: "a", unit_id: 0, connection: { type: "tcp", host: "a" }, definitions: [] }]"#
            )
            .modbus
            .validate(),
            Err(BridgeConfigError::InvalidUnitId { unit_id: 0, .. })
        ));
        assert!(matches!(
            parse(
                r#"[{ name: "a", timeout_ms: 0, connection: { type: "tcp", host: "a" }, definitions: [] }]"#
            )
            .modbus
            .validate(),
            Err(BridgeConfigError::InvalidTimeout { .. })
        ));
    }

    #[test]
    fn test_invalid_parity_is_rejected() {
        let json = r#"{ modbus: { devices: [{
            name: "a",
            connection: { type: "rtu", port: "/dev/ttyS0", parity: "mark" },
            definitions: []
        }] } }"#;
        assert!(json5::from_str::<ModbusBridgeConfig>(json).is_err());
    }

    #[test]
    fn test_duplicates_across_devices_checked_per_device() {
        let record = r#"{ address: 0, modbustype: "holding", valuetype: "int16",
                          interval: 10, topic: "x/y" }"#;
        let json = format!(
            r#"{{ modbus: {{ devices: [
                {{ name: "a", connection: {{ type: "tcp", host: "a" }}, definitions: [{record}] }},
                {{ name: "b", connection: {{ type: "tcp", host: "b" }}, definitions: [{record}, {record}] }}
            ] }} }}"#
        );
        let config: ModbusBridgeConfig = json5::from_str(&json).unwrap();

        match config.modbus.build_registry() {
            Err(BridgeConfigError::Registry(DefinitionError::DuplicateAddress {
                device, ..
            })) => assert_eq!(device, "b"),
            other => panic!("expected duplicate on device b, got {other:?}"),
        }
    }

    #[test]
    fn test_load_resolves_definitions_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut definitions = std::fs::File::create(dir.path().join("meter.json")).unwrap();
        write!(
            definitions,
            r#"[{{ "address": 200, "modbustype": "holding", "valuetype": "uint32",
                  "floatInterpretation": true, "interval": 10, "topic": "power/float" }}]"#
        )
        .unwrap();

        let config_path = dir.path().join("bridge.json5");
        std::fs::write(
            &config_path,
            r#"{ modbus: { devices: [{
                name: "meter",
                connection: { type: "tcp", host: "127.0.0.1", port: 5020 },
                definitions: "meter.json"
            }] } }"#,
        )
        .unwrap();

        let config = ModbusBridgeConfig::load(&config_path).unwrap();
        assert_eq!(
            config.modbus.devices[0].definitions,
            DefinitionSource::Path(dir.path().join("meter.json"))
        );
        let registry = config.modbus.build_registry().unwrap();
        assert_eq!(registry.definitions_for("meter").len(), 1);
    }

    #[test]
    fn test_load_reports_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("bridge.json5");
        std::fs::write(&config_path, "{ modbus: { devices: [] } }").unwrap();

        let err = ModbusBridgeConfig::load(&config_path).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }

    #[test]
    fn test_missing_definitions_file() {
        let json = r#"{ modbus: { devices: [{
            name: "a",
            connection: { type: "tcp", host: "a" },
            definitions: "/nonexistent/defs.json"
        }] } }"#;
        let config: ModbusBridgeConfig = json5::from_str(json).unwrap();

        assert!(matches!(
            config.modbus.build_registry(),
            Err(BridgeConfigError::Definitions {
                source: DefinitionError::Io { .. },
                ..
            })
        ));
    }
}
