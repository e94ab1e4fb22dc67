//! Change detection on raw register words.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bits::extract_bit_field;
use crate::codec::{DecodeError, ModbusValue, TypedValue, decode_value, lookup_mapped_label};
use crate::definition::Definition;
use crate::emitter::{Emission, Reading};

/// When a published bit field is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitFieldTrigger {
    /// Only when the field's own bits changed.
    #[default]
    FieldChange,
    /// Whenever the parent register changed.
    RegisterChange,
}

/// Scheduling phase of one definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollPhase {
    #[default]
    Idle,
    Due,
    Reading,
    Backoff,
}

/// Last-seen state of one definition, owned by its device loop.
#[derive(Debug, Clone, Default)]
pub struct PollState {
    last_raw_words: Vec<u16>,
    last_observed_at: Option<Instant>,
    last_bit_values: Vec<Option<u64>>,
    pub phase: PollPhase,
    pub consecutive_failures: u32,
}

impl PollState {
    /// Fresh state for `definition`; the first read always counts as a change.
    pub fn for_definition(definition: &Definition) -> Self {
        Self {
            last_bit_values: vec![None; definition.bits.len()],
            ..Self::default()
        }
    }

    /// State that already saw `words`, e.g. an all-zero stripe.
    pub fn with_last_words(words: Vec<u16>) -> Self {
        Self {
            last_raw_words: words,
            ..Self::default()
        }
    }

    pub fn last_raw_words(&self) -> &[u16] {
        &self.last_raw_words
    }

    /// Time of the last successful read.
    pub fn last_observed_at(&self) -> Option<Instant> {
        self.last_observed_at
    }

    /// Record a successful read. Returns true and stores `words` if they
    /// differ from the previous read.
    pub fn observe(&mut self, words: &[u16], at: Instant) -> bool {
        self.last_observed_at = Some(at);
        if self.last_raw_words == words {
            return false;
        }
        self.last_raw_words.clear();
        self.last_raw_words.extend_from_slice(words);
        true
    }
}

/// Decode a changed read and build the emissions it causes.
///
/// The parent value is emitted unless the definition is hidden. Bit fields
/// with a publish path are emitted according to `trigger`, with the field
/// name as title and an unsigned value as wide as the parent.
pub fn detect_changes(
    definition: &Definition,
    state: &mut PollState,
    words: &[u16],
    trigger: BitFieldTrigger,
    timestamp: i64,
) -> Result<Vec<Emission>, DecodeError> {
    let value = decode_value(words, definition.value_type, definition.float_interpretation)?;
    let mut emissions = Vec::new();

    if definition.is_visible() {
        let label = value
            .as_map_key()
            .and_then(|raw| lookup_mapped_label(raw, &definition.value_map))
            .map(str::to_string);
        emissions.push(Emission {
            key: definition.topic.clone(),
            reading: Reading {
                timestamp,
                device: definition.device.clone(),
                title: definition.title.clone(),
                value: ModbusValue::new(definition.address, value),
                label,
            },
        });
    }

    let Some(raw) = value.raw_bits() else {
        return Ok(emissions);
    };

    if state.last_bit_values.len() != definition.bits.len() {
        state.last_bit_values = vec![None; definition.bits.len()];
    }

    for (field, previous) in definition.bits.values().zip(state.last_bit_values.iter_mut()) {
        let current = extract_bit_field(raw, field.range);
        let changed = previous.replace(current) != Some(current);

        let Some(path) = &field.mqtt_path else {
            continue;
        };
        if changed || trigger == BitFieldTrigger::RegisterChange {
            emissions.push(Emission {
                key: path.clone(),
                reading: Reading {
                    timestamp,
                    device: definition.device.clone(),
                    title: field.name.clone(),
                    value: ModbusValue::new(
                        definition.address,
                        TypedValue::unsigned(current, definition.bit_width()),
                    ),
                    label: None,
                },
            });
        }
    }

    Ok(emissions)
}
