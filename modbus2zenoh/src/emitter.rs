//! Outbound side: published payloads and the task that forwards them.
//!
//! Device loops never publish directly. They push [`Emission`]s into an
//! unbounded channel and a single [`Emitter`] drains it into a
//! [`ReadingSink`], so a slow or failing sink cannot stall a read loop.

use std::future::Future;

use modbus2zenoh_framework::{BridgeError, Publisher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::ModbusValue;

/// Payload published for a changed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix epoch milliseconds of the read that produced the value.
    pub timestamp: i64,
    pub device: String,
    pub title: String,
    #[serde(flatten)]
    pub value: ModbusValue,
    /// Value-map label for the raw value, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A reading bound for a key suffix (a definition topic or bit-field path).
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub key: String,
    pub reading: Reading,
}

/// Sending half handed to every device loop.
pub type EmissionSender = mpsc::UnboundedSender<Emission>;

/// Receiving half consumed by the [`Emitter`].
pub type EmissionReceiver = mpsc::UnboundedReceiver<Emission>;

/// Create the channel between device loops and the emitter.
pub fn emission_channel() -> (EmissionSender, EmissionReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for readings; `publish(topic, payload)` of the message bus.
pub trait ReadingSink: Send + Sync + 'static {
    fn publish(
        &self,
        key: &str,
        reading: &Reading,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

impl ReadingSink for Publisher {
    async fn publish(&self, key: &str, reading: &Reading) -> Result<(), SinkError> {
        Publisher::publish(self, key, reading).await?;
        Ok(())
    }
}

/// Counters from an emitter run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Readings the sink accepted.
    pub success: usize,
    /// Readings the sink rejected.
    pub failed: usize,
}

impl PublishStats {
    pub fn total(&self) -> usize {
        self.success + self.failed
    }
}

/// Forwards emissions to a sink until every sender is gone.
pub struct Emitter<S> {
    sink: S,
}

impl<S: ReadingSink> Emitter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Drain `receiver` into the sink. Returns once all device loops have
    /// dropped their senders and the queue is empty.
    pub async fn run(self, mut receiver: EmissionReceiver) -> PublishStats {
        let mut stats = PublishStats::default();

        while let Some(emission) = receiver.recv().await {
            match self.sink.publish(&emission.key, &emission.reading).await {
                Ok(()) => {
                    stats.success += 1;
                    debug!(
                        key = %emission.key,
                        device = %emission.reading.device,
                        value = %emission.reading.value.value,
                        "Published"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(key = %emission.key, error = %e, "Failed to publish reading");
                }
            }
        }

        debug!(
            published = stats.success,
            failed = stats.failed,
            "Emission channel closed"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TypedValue;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FlakySink {
        published: Mutex<Vec<String>>,
    }

    impl ReadingSink for std::sync::Arc<FlakySink> {
        async fn publish(&self, key: &str, _reading: &Reading) -> Result<(), SinkError> {
            if key.starts_with("broken") {
                return Err(SinkError::Unavailable("no route".to_string()));
            }
            self.published.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn emission(key: &str) -> Emission {
        Emission {
            key: key.to_string(),
            reading: Reading {
                timestamp: 0,
                device: "hm310t".to_string(),
                title: "Output Voltage".to_string(),
                value: ModbusValue::new(0x10, TypedValue::UInt16(1200)),
                label: None,
            },
        }
    }

    #[tokio::test]
    async fn test_emitter_continues_after_sink_error() {
        let sink = std::sync::Arc::new(FlakySink::default());
        let (tx, rx) = emission_channel();

        tx.send(emission("psu/voltage")).unwrap();
        tx.send(emission("broken/path")).unwrap();
        tx.send(emission("psu/current")).unwrap();
        drop(tx);

        let stats = Emitter::new(sink.clone()).run(rx).await;

        assert_eq!(stats, PublishStats { success: 2, failed: 1 });
        assert_eq!(stats.total(), 3);
        assert_eq!(
            *sink.published.lock().unwrap(),
            vec!["psu/voltage".to_string(), "psu/current".to_string()]
        );
    }

    #[test]
    fn test_reading_payload_shape() {
        let mut reading = emission("psu/voltage").reading;
        reading.label = Some("nominal".to_string());

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["address"], 0x10);
        assert_eq!(json["value"]["uint16"], 1200);
        assert_eq!(json["label"], "nominal");
        assert_eq!(json["device"], "hm310t");

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }
}
