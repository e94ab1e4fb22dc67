//! Zenoh publisher with a key prefix and payload serialization.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::serialization::{Format, encode};

/// Publishes serialized payloads to Zenoh under a fixed key prefix.
///
/// Cheap to clone; every clone shares the same session, so it can be
/// handed to any number of tasks.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    key_prefix: String,
    format: Format,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(
        session: Arc<zenoh::Session>,
        key_prefix: impl Into<String>,
        format: Format,
    ) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
            format,
        }
    }

    /// Get the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Get the serialization format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Build a full key expression from a suffix.
    pub fn build_key(&self, suffix: &str) -> String {
        join_key(&self.key_prefix, suffix)
    }

    /// Serialize `payload` with the publisher's format and put it on
    /// `{prefix}/{key_suffix}`.
    pub async fn publish<T: Serialize>(&self, key_suffix: &str, payload: &T) -> Result<()> {
        let key = self.build_key(key_suffix);
        let bytes = encode(payload, self.format)?;
        self.publish_raw(&key, bytes).await
    }

    /// Publish raw bytes to a full key.
    pub async fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Publish a JSON value to a full key regardless of the configured format.
    pub async fn publish_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}

/// Join a key prefix and a suffix with exactly one `/`.
pub(crate) fn join_key(prefix: &str, suffix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');

    match (prefix.is_empty(), suffix.is_empty()) {
        (_, true) => prefix.to_string(),
        (true, false) => suffix.to_string(),
        (false, false) => format!("{}/{}", prefix, suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(
            join_key("modbus2zenoh", "ambient/errornumber"),
            "modbus2zenoh/ambient/errornumber"
        );
        assert_eq!(join_key("modbus2zenoh/", "/pathfoo"), "modbus2zenoh/pathfoo");
        assert_eq!(join_key("modbus2zenoh", ""), "modbus2zenoh");
        assert_eq!(join_key("", "pathbar"), "pathbar");
    }
}
