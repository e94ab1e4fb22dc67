//! The validated, immutable set of all definitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::definition::{Definition, DefinitionError, RegisterKind};

/// Which definitions count as claiming the same register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateScope {
    /// Same address in the same register kind on one device.
    #[default]
    AddressAndKind,
    /// Same address on one device, whatever the register kind.
    Address,
}

type RegisterKey = (RegisterKind, u16);

/// All definitions of the bridge, grouped by device.
///
/// Built once, never mutated; share it behind an [`Arc`].
#[derive(Debug, Default)]
pub struct Registry {
    devices: BTreeMap<String, DeviceDefinitions>,
    len: usize,
}

#[derive(Debug, Default)]
struct DeviceDefinitions {
    ordered: Vec<Arc<Definition>>,
    by_key: HashMap<RegisterKey, Arc<Definition>>,
}

impl Registry {
    /// Validate `definitions` and index them.
    ///
    /// Each definition's own rules are checked first, in order, then address
    /// uniqueness per device under `scope`. The first failure aborts the
    /// build.
    pub fn build(
        definitions: Vec<Definition>,
        scope: DuplicateScope,
    ) -> Result<Self, DefinitionError> {
        for (index, definition) in definitions.iter().enumerate() {
            definition
                .validate()
                .map_err(|source| DefinitionError::Invalid {
                    index,
                    title: definition.title.clone(),
                    address: definition.address,
                    register_kind: definition.register_kind,
                    topic: definition.topic.clone(),
                    source,
                })?;
        }

        let mut claimed: HashMap<(&str, Option<RegisterKind>, u16), usize> = HashMap::new();
        for (index, definition) in definitions.iter().enumerate() {
            let kind = match scope {
                DuplicateScope::AddressAndKind => Some(definition.register_kind),
                DuplicateScope::Address => None,
            };
            let key = (definition.device.as_str(), kind, definition.address);
            if let Some(&first) = claimed.get(&key) {
                return Err(DefinitionError::DuplicateAddress {
                    device: definition.device.clone(),
                    address: definition.address,
                    register_kind: definition.register_kind,
                    first,
                    second: index,
                });
            }
            claimed.insert(key, index);
        }

        let mut registry = Registry {
            devices: BTreeMap::new(),
            len: definitions.len(),
        };
        for definition in definitions {
            let definition = Arc::new(definition);
            let device = registry
                .devices
                .entry(definition.device.clone())
                .or_default();
            device.by_key.insert(
                (definition.register_kind, definition.address),
                definition.clone(),
            );
            device.ordered.push(definition);
        }

        Ok(registry)
    }

    /// Definitions for `device`, in schema order.
    pub fn definitions_for(&self, device: &str) -> &[Arc<Definition>] {
        self.devices
            .get(device)
            .map(|d| d.ordered.as_slice())
            .unwrap_or_default()
    }

    /// Definitions for `device` that the scheduler reads.
    pub fn polled_for(&self, device: &str) -> Vec<Arc<Definition>> {
        self.definitions_for(device)
            .iter()
            .filter(|d| d.is_polled())
            .cloned()
            .collect()
    }

    /// Definition at `address` in `kind` on `device`.
    pub fn get(&self, device: &str, kind: RegisterKind, address: u16) -> Option<&Arc<Definition>> {
        self.devices.get(device)?.by_key.get(&(kind, address))
    }

    /// Names of all devices with at least one definition.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Iterate over every definition, grouped by device.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Definition>> {
        self.devices.values().flat_map(|d| d.ordered.iter())
    }

    /// Total number of definitions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
