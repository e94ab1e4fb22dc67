//! Conversion between raw 16-bit register words and typed values.
//!
//! Multi-word values are stored most-significant word first. A 32-bit
//! integer definition may ask for float interpretation, in which case the
//! concatenated bit pattern is reinterpreted as IEEE-754 binary32 rather
//! than converted numerically.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared type of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Int64,
    UInt64,
    Float64,
}

impl ValueType {
    /// Number of 16-bit registers the value occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            ValueType::Int16 | ValueType::UInt16 => 1,
            ValueType::Int32 | ValueType::UInt32 | ValueType::Float32 => 2,
            ValueType::Int64 | ValueType::UInt64 | ValueType::Float64 => 4,
        }
    }

    /// Width of the value in bits.
    pub fn bit_width(&self) -> u32 {
        u32::from(self.word_count()) * 16
    }

    /// True for the signed and unsigned integer kinds.
    pub fn is_integer(&self) -> bool {
        !matches!(self, ValueType::Float32 | ValueType::Float64)
    }

    /// True for the kinds that accept float interpretation.
    pub fn allows_float_interpretation(&self) -> bool {
        matches!(self, ValueType::Int32 | ValueType::UInt32)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Int16 => "int16",
            ValueType::UInt16 => "uint16",
            ValueType::Int32 => "int32",
            ValueType::UInt32 => "uint32",
            ValueType::Float32 => "float32",
            ValueType::Int64 => "int64",
            ValueType::UInt64 => "uint64",
            ValueType::Float64 => "float64",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded register value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypedValue {
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
}

impl TypedValue {
    /// Integer bit pattern, two's complement truncated to the type width.
    ///
    /// `None` for floating-point values, which carry no bit fields.
    pub fn raw_bits(&self) -> Option<u64> {
        match *self {
            TypedValue::Int16(v) => Some(u64::from(v as u16)),
            TypedValue::UInt16(v) => Some(u64::from(v)),
            TypedValue::Int32(v) => Some(u64::from(v as u32)),
            TypedValue::UInt32(v) => Some(u64::from(v)),
            TypedValue::Int64(v) => Some(v as u64),
            TypedValue::UInt64(v) => Some(v),
            TypedValue::Float32(_) | TypedValue::Float64(_) => None,
        }
    }

    /// Numeric value as a value-map key, for integers that fit in `i64`.
    pub fn as_map_key(&self) -> Option<i64> {
        match *self {
            TypedValue::Int16(v) => Some(i64::from(v)),
            TypedValue::UInt16(v) => Some(i64::from(v)),
            TypedValue::Int32(v) => Some(i64::from(v)),
            TypedValue::UInt32(v) => Some(i64::from(v)),
            TypedValue::Int64(v) => Some(v),
            TypedValue::UInt64(v) => i64::try_from(v).ok(),
            TypedValue::Float32(_) | TypedValue::Float64(_) => None,
        }
    }

    /// Unsigned value of the given width, used for extracted bit fields.
    pub fn unsigned(bits: u64, bit_width: u32) -> Self {
        match bit_width {
            0..=16 => TypedValue::UInt16(bits as u16),
            17..=32 => TypedValue::UInt32(bits as u32),
            _ => TypedValue::UInt64(bits),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Int16(v) => write!(f, "{}", v),
            TypedValue::UInt16(v) => write!(f, "{}", v),
            TypedValue::Int32(v) => write!(f, "{}", v),
            TypedValue::UInt32(v) => write!(f, "{}", v),
            TypedValue::Float32(v) => write!(f, "{}", v),
            TypedValue::Int64(v) => write!(f, "{}", v),
            TypedValue::UInt64(v) => write!(f, "{}", v),
            TypedValue::Float64(v) => write!(f, "{}", v),
        }
    }
}

/// The decoded result of one read, or of one derived bit-field read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModbusValue {
    pub address: u16,
    pub value: TypedValue,
}

impl ModbusValue {
    pub fn new(address: u16, value: TypedValue) -> Self {
        Self { address, value }
    }
}

/// Decoding errors. Never expected for a validated definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{value_type} needs {expected} register word(s), got {actual}")]
    WordCount {
        value_type: ValueType,
        expected: usize,
        actual: usize,
    },
}

/// Decode `words` (most-significant word first) as `value_type`.
///
/// With `float_interpretation` a 32-bit pattern is reinterpreted bit for
/// bit as an `f32`; other types ignore the flag, validation rejects it.
pub fn decode_value(
    words: &[u16],
    value_type: ValueType,
    float_interpretation: bool,
) -> Result<TypedValue, DecodeError> {
    let expected = usize::from(value_type.word_count());
    if words.len() != expected {
        return Err(DecodeError::WordCount {
            value_type,
            expected,
            actual: words.len(),
        });
    }

    let pattern = words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word));

    let value = match value_type {
        ValueType::Int16 => TypedValue::Int16(pattern as u16 as i16),
        ValueType::UInt16 => TypedValue::UInt16(pattern as u16),
        ValueType::Int32 | ValueType::UInt32 if float_interpretation => {
            TypedValue::Float32(f32::from_bits(pattern as u32))
        }
        ValueType::Int32 => TypedValue::Int32(pattern as u32 as i32),
        ValueType::UInt32 => TypedValue::UInt32(pattern as u32),
        ValueType::Float32 => TypedValue::Float32(f32::from_bits(pattern as u32)),
        ValueType::Int64 => TypedValue::Int64(pattern as i64),
        ValueType::UInt64 => TypedValue::UInt64(pattern),
        ValueType::Float64 => TypedValue::Float64(f64::from_bits(pattern)),
    };

    Ok(value)
}

/// Encode a value back into register words, most-significant word first.
pub fn encode_value(value: &TypedValue) -> Vec<u16> {
    let (pattern, words) = match *value {
        TypedValue::Int16(v) => (u64::from(v as u16), 1),
        TypedValue::UInt16(v) => (u64::from(v), 1),
        TypedValue::Int32(v) => (u64::from(v as u32), 2),
        TypedValue::UInt32(v) => (u64::from(v), 2),
        TypedValue::Float32(v) => (u64::from(v.to_bits()), 2),
        TypedValue::Int64(v) => (v as u64, 4),
        TypedValue::UInt64(v) => (v, 4),
        TypedValue::Float64(v) => (v.to_bits(), 4),
    };

    (0..words)
        .rev()
        .map(|i| (pattern >> (16 * i)) as u16)
        .collect()
}

/// Label for `raw` in a definition's value map, if any.
pub fn lookup_mapped_label(raw: i64, value_map: &BTreeMap<i64, String>) -> Option<&str> {
    value_map.get(&raw).map(String::as_str)
}
