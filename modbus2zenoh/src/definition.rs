//! Declarative register definitions.
//!
//! A definitions file is a JSON array of records:
//!
//! ```json
//! [
//!   {
//!     "address": 1,
//!     "modbustype": "holding",
//!     "modbusaccess": "read",
//!     "valuetype": "int16",
//!     "mqtt": "visible",
//!     "interval": 10,
//!     "topic": "ambient/errornumber",
//!     "title": "Ambient Error Number",
//!     "bits": { "0-1": { "name": "foo", "mqttPath": "pathfoo" } },
//!     "map": { "0": "ok", "127": "fault" }
//!   }
//! ]
//! ```
//!
//! Records are turned into validated [`Definition`]s; every error names the
//! record it came from.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bits::{BitRange, BitRangeError};
use crate::codec::ValueType;

/// Longest accepted poll interval (30 days).
pub const MAX_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// The four Modbus address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Coils (read/write, 1-bit)
    Coil,
    /// Discrete inputs (read-only, 1-bit)
    #[serde(alias = "discreteinput", alias = "discrete_input")]
    Discrete,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
        }
    }

    /// True for the 1-bit address spaces.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode. Only readable definitions are polled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Read,
    Write,
    #[serde(alias = "read_write")]
    ReadWrite,
}

impl Access {
    pub fn is_readable(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
}

/// Whether the parent value is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    #[serde(alias = "invisible")]
    Hidden,
}

/// A named sub-field of a register value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitFieldDefinition {
    pub range: BitRange,
    pub name: String,
    /// Key suffix the field is published on; unpublished when `None`.
    pub mqtt_path: Option<String>,
}

/// A validated definition of one logical signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "DefinitionRecord")]
pub struct Definition {
    /// Device the definition is polled on, assigned by the bridge.
    pub device: String,
    pub address: u16,
    pub register_kind: RegisterKind,
    pub access: Access,
    pub value_type: ValueType,
    pub float_interpretation: bool,
    pub visibility: Visibility,
    pub interval: Duration,
    pub topic: String,
    pub title: String,
    pub bits: BTreeMap<BitRange, BitFieldDefinition>,
    pub value_map: BTreeMap<i64, String>,
}

/// A rule violated by a single definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    BitRange(#[from] BitRangeError),
    #[error("bit range '{first}' overlaps '{second}'")]
    OverlappingBitRanges { first: BitRange, second: BitRange },
    #[error("bit fields need an integer value type, not {value_type}")]
    BitFieldsOnNonInteger { value_type: ValueType },
    #[error("bit fields cannot be combined with floatInterpretation")]
    BitFieldsWithFloatInterpretation,
    #[error("floatInterpretation requires int32 or uint32, not {value_type}")]
    InvalidFloatInterpretation { value_type: ValueType },
    #[error("interval must be a positive number of seconds, got {seconds}")]
    InvalidInterval { seconds: f64 },
    #[error("interval of {seconds}s exceeds the {max}s maximum")]
    IntervalTooLong { seconds: f64, max: u64 },
    #[error("topic cannot be empty")]
    EmptyTopic,
    #[error("value map key '{key}' is not an integer")]
    InvalidValueMapKey { key: String },
    #[error("value map key {key} is defined more than once")]
    DuplicateValueMapKey { key: i64 },
    #[error("{kind} registers hold single bits; use int16 or uint16 instead of {value_type}")]
    UnsupportedBitRegisterType {
        kind: RegisterKind,
        value_type: ValueType,
    },
}

/// Errors loading or validating a set of definitions.
///
/// Any of these fails the whole load; a partially valid set is never used.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read definitions file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse definitions: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("definition #{index} '{title}' ({register_kind} {address}, topic '{topic}'): {source}")]
    Invalid {
        index: usize,
        title: String,
        address: u16,
        register_kind: RegisterKind,
        topic: String,
        #[source]
        source: ConfigurationError,
    },
    #[error(
        "duplicate modbus address {address} ({register_kind}) on device '{device}': definitions #{first} and #{second}"
    )]
    DuplicateAddress {
        device: String,
        address: u16,
        register_kind: RegisterKind,
        first: usize,
        second: usize,
    },
}

impl DefinitionError {
    fn invalid(index: usize, record: &DefinitionRecord, source: ConfigurationError) -> Self {
        Self::Invalid {
            index,
            title: record.title.clone(),
            address: record.address,
            register_kind: record.register_kind,
            topic: record.topic.clone(),
            source,
        }
    }
}

impl Definition {
    /// Build a definition from a schema record and validate it.
    pub fn from_record(
        record: DefinitionRecord,
        device: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let value_type = record.value_type;

        if !record.bits.is_empty() {
            if !value_type.is_integer() {
                return Err(ConfigurationError::BitFieldsOnNonInteger { value_type });
            }
            if record.float_interpretation {
                return Err(ConfigurationError::BitFieldsWithFloatInterpretation);
            }
        }

        let mut bits = BTreeMap::new();
        for (range_text, field) in record.bits {
            let range = BitRange::parse(&range_text, value_type.bit_width())?;
            let field = BitFieldDefinition {
                range,
                name: field.name,
                mqtt_path: field.mqtt_path,
            };
            // "6" and "06" name the same bits
            if let Some(prev) = bits.insert(range, field) {
                return Err(ConfigurationError::OverlappingBitRanges {
                    first: prev.range,
                    second: range,
                });
            }
        }

        let mut value_map = BTreeMap::new();
        for (key, label) in record.value_map {
            let raw: i64 = key
                .trim()
                .parse()
                .map_err(|_| ConfigurationError::InvalidValueMapKey { key: key.clone() })?;
            if value_map.insert(raw, label).is_some() {
                return Err(ConfigurationError::DuplicateValueMapKey { key: raw });
            }
        }

        let interval = Duration::try_from_secs_f64(record.interval)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or(ConfigurationError::InvalidInterval {
                seconds: record.interval,
            })?;

        let definition = Self {
            device: device.into(),
            address: record.address,
            register_kind: record.register_kind,
            access: record.access,
            value_type,
            float_interpretation: record.float_interpretation,
            visibility: record.visibility,
            interval,
            topic: record.topic,
            title: record.title,
            bits,
            value_map,
        };
        definition.validate()?;

        Ok(definition)
    }

    /// Check the rules a single definition must satisfy on its own.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.interval.is_zero() {
            return Err(ConfigurationError::InvalidInterval { seconds: 0.0 });
        }
        if self.interval > MAX_INTERVAL {
            return Err(ConfigurationError::IntervalTooLong {
                seconds: self.interval.as_secs_f64(),
                max: MAX_INTERVAL.as_secs(),
            });
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigurationError::EmptyTopic);
        }
        if self.float_interpretation && !self.value_type.allows_float_interpretation() {
            return Err(ConfigurationError::InvalidFloatInterpretation {
                value_type: self.value_type,
            });
        }
        if self.register_kind.is_bit() && self.value_type.word_count() != 1 {
            return Err(ConfigurationError::UnsupportedBitRegisterType {
                kind: self.register_kind,
                value_type: self.value_type,
            });
        }

        if !self.bits.is_empty() {
            if !self.value_type.is_integer() {
                return Err(ConfigurationError::BitFieldsOnNonInteger {
                    value_type: self.value_type,
                });
            }
            if self.float_interpretation {
                return Err(ConfigurationError::BitFieldsWithFloatInterpretation);
            }
        }

        let bit_width = self.bit_width();
        let mut previous: Option<BitRange> = None;
        // Sorted by start, so checking neighbours finds every overlap.
        for range in self.bits.keys() {
            if !range.fits(bit_width) {
                return Err(BitRangeError::OutOfBounds {
                    range_text: range.to_string(),
                    bit_width,
                }
                .into());
            }
            if let Some(prev) = previous {
                if prev.overlaps(range) {
                    return Err(ConfigurationError::OverlappingBitRanges {
                        first: prev,
                        second: *range,
                    });
                }
            }
            previous = Some(match previous {
                Some(prev) if prev.end() > range.end() => prev,
                _ => *range,
            });
        }

        Ok(())
    }

    /// Registers read per poll.
    pub fn word_count(&self) -> u16 {
        self.value_type.word_count()
    }

    pub fn bit_width(&self) -> u32 {
        self.value_type.bit_width()
    }

    /// True if the scheduler should read this definition.
    pub fn is_polled(&self) -> bool {
        self.access.is_readable()
    }

    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }
}

/// A definition as written in the schema file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionRecord {
    pub address: u16,
    #[serde(rename = "modbustype")]
    pub register_kind: RegisterKind,
    #[serde(rename = "modbusaccess", default)]
    pub access: Access,
    #[serde(rename = "valuetype")]
    pub value_type: ValueType,
    #[serde(
        rename = "floatInterpretation",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub float_interpretation: bool,
    #[serde(rename = "mqtt", default)]
    pub visibility: Visibility,
    /// Seconds between reads.
    pub interval: f64,
    pub topic: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bits: BTreeMap<String, BitFieldRecord>,
    #[serde(rename = "map", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub value_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitFieldRecord {
    pub name: String,
    #[serde(rename = "mqttPath", default, skip_serializing_if = "Option::is_none")]
    pub mqtt_path: Option<String>,
}

impl From<Definition> for DefinitionRecord {
    fn from(definition: Definition) -> Self {
        Self {
            address: definition.address,
            register_kind: definition.register_kind,
            access: definition.access,
            value_type: definition.value_type,
            float_interpretation: definition.float_interpretation,
            visibility: definition.visibility,
            interval: definition.interval.as_secs_f64(),
            topic: definition.topic,
            title: definition.title,
            bits: definition
                .bits
                .into_values()
                .map(|field| {
                    (
                        field.range.to_string(),
                        BitFieldRecord {
                            name: field.name,
                            mqtt_path: field.mqtt_path,
                        },
                    )
                })
                .collect(),
            value_map: definition
                .value_map
                .into_iter()
                .map(|(raw, label)| (raw.to_string(), label))
                .collect(),
        }
    }
}

/// Parse a JSON definitions document for `device`.
///
/// Fails on the first invalid record. Address uniqueness is checked by
/// [`Registry::build`](crate::registry::Registry::build).
pub fn parse_definitions(text: &str, device: &str) -> Result<Vec<Definition>, DefinitionError> {
    let records: Vec<DefinitionRecord> = serde_json::from_str(text)?;
    definitions_from_records(records, device)
}

/// Validate already-deserialized records for `device`, in order.
pub fn definitions_from_records(
    records: Vec<DefinitionRecord>,
    device: &str,
) -> Result<Vec<Definition>, DefinitionError> {
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let attribution = record.clone();
            Definition::from_record(record, device)
                .map_err(|e| DefinitionError::invalid(index, &attribution, e))
        })
        .collect()
}

/// Read and parse a definitions file for `device`.
pub fn load_definitions(
    path: impl AsRef<Path>,
    device: &str,
) -> Result<Vec<Definition>, DefinitionError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_definitions(&text, device)
}
