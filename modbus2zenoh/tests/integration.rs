//! Integration tests for modbus2zenoh.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus2zenoh::codec::TypedValue;
use modbus2zenoh::config::ModbusBridgeConfig;
use modbus2zenoh::definition::{DefinitionError, RegisterKind, load_definitions};
use modbus2zenoh::emitter::{Emitter, Reading, ReadingSink, SinkError, emission_channel};
use modbus2zenoh::poller::DevicePoller;
use modbus2zenoh::registry::{DuplicateScope, Registry};
use modbus2zenoh::transport::{RegisterTransport, TransportError};
use modbus2zenoh_framework::{BridgeConfig, Format, decode_auto, encode};
use tokio::sync::watch;

/// Holding/input register image of a simulated device.
#[derive(Clone, Default)]
struct SimulatedDevice {
    registers: Arc<Mutex<HashMap<(RegisterKind, u16), u16>>>,
}

impl SimulatedDevice {
    fn write(&self, kind: RegisterKind, address: u16, words: &[u16]) {
        let mut registers = self.registers.lock().unwrap();
        for (offset, word) in words.iter().enumerate() {
            registers.insert((kind, address + offset as u16), *word);
        }
    }
}

impl RegisterTransport for SimulatedDevice {
    async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        kind: RegisterKind,
    ) -> Result<Vec<u16>, TransportError> {
        let registers = self.registers.lock().unwrap();
        (address..address + count)
            .map(|a| {
                registers
                    .get(&(kind, a))
                    .copied()
                    .ok_or_else(|| TransportError::Exception("IllegalDataAddress".to_string()))
            })
            .collect()
    }
}

/// Sink that keeps every encoded payload, like a subscriber would see it.
#[derive(Clone, Default)]
struct RecordingSink {
    received: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingSink {
    fn readings(&self) -> Vec<(String, Reading)> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(key, payload)| (key.clone(), decode_auto(payload).unwrap()))
            .collect()
    }
}

impl ReadingSink for RecordingSink {
    async fn publish(&self, key: &str, reading: &Reading) -> Result<(), SinkError> {
        let payload = encode(reading, Format::Json)?;
        self.received
            .lock()
            .unwrap()
            .push((format!("modbus2zenoh/{key}"), payload));
        Ok(())
    }
}

const BRIDGE_CONFIG: &str = r#"{
    modbus: {
        devices: [{
            name: "inverter",
            connection: { type: "tcp", host: "127.0.0.1", port: 5020 },
            timeout_ms: 200,
            definitions: [
                { address: 1, modbustype: "holding", valuetype: "int16", interval: 10,
                  topic: "inverter/status", title: "Status", mqtt: "invisible",
                  bits: {
                      "0-1": { name: "foo", mqttPath: "pathfoo" },
                      "2-5": { name: "bar", mqttPath: "pathbar" },
                      "6":   { name: "baz", mqttPath: "pathbaz" }
                  } },
                { address: 200, modbustype: "holding", valuetype: "uint32",
                  floatInterpretation: true, interval: 10,
                  topic: "power/float_value", title: "Power" },
                { address: 300, modbustype: "input", valuetype: "uint16", interval: 10,
                  topic: "inverter/mode", title: "Mode", map: { "0": "off", "2": "grid" } },
                { address: 400, modbustype: "holding", modbusaccess: "write",
                  valuetype: "uint16", interval: 10, topic: "inverter/setpoint" }
            ]
        }]
    }
}"#;

#[tokio::test(start_paused = true)]
async fn test_poll_to_sink_pipeline() {
    let config: ModbusBridgeConfig = json5::from_str(BRIDGE_CONFIG).unwrap();
    config.validate().unwrap();
    let registry = config.modbus.build_registry().unwrap();
    let device_config = config.modbus.device("inverter").unwrap();

    let device = SimulatedDevice::default();
    device.write(RegisterKind::Holding, 1, &[0b100_0001]);
    device.write(RegisterKind::Holding, 200, &[0x4248, 0x0000]);
    device.write(RegisterKind::Input, 300, &[2]);

    let polled = registry.polled_for("inverter");
    assert_eq!(polled.len(), 3);

    let poller = DevicePoller::new(
        "inverter",
        device.clone(),
        polled,
        config.modbus.poller_settings(device_config),
    );
    let sink = RecordingSink::default();
    let (tx, rx) = emission_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let emitter = tokio::spawn(Emitter::new(sink.clone()).run(rx));
    let poller = tokio::spawn(poller.run(tx, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    device.write(RegisterKind::Holding, 1, &[0b100_1101]);
    tokio::time::sleep(Duration::from_secs(10)).await;

    shutdown_tx.send_replace(true);
    poller.await.unwrap();
    let stats = emitter.await.unwrap();

    let readings = sink.readings();
    let keys: Vec<&str> = readings.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        keys,
        [
            // first cycle; the hidden status word only emits its fields
            "modbus2zenoh/pathfoo",
            "modbus2zenoh/pathbar",
            "modbus2zenoh/pathbaz",
            "modbus2zenoh/power/float_value",
            "modbus2zenoh/inverter/mode",
            // second cycle; only bits 2-5 moved
            "modbus2zenoh/pathbar",
        ]
    );
    assert_eq!(stats.success, 6);

    let (_, foo) = &readings[0];
    assert_eq!(foo.title, "foo");
    assert_eq!(foo.device, "inverter");
    assert_eq!(foo.value.value, TypedValue::UInt16(0b01));

    let (_, power) = &readings[3];
    assert_eq!(power.value.address, 200);
    assert_eq!(power.value.value, TypedValue::Float32(50.0));

    let (_, mode) = &readings[4];
    assert_eq!(mode.label.as_deref(), Some("grid"));

    let (_, bar) = &readings[5];
    assert_eq!(bar.value.value, TypedValue::UInt16(0b0011));
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_register_does_not_stop_device() {
    let json = r#"[
        { "address": 10, "modbustype": "holding", "valuetype": "uint16",
          "interval": 5, "topic": "missing" },
        { "address": 11, "modbustype": "holding", "valuetype": "uint16",
          "interval": 5, "topic": "present" }
    ]"#;
    let definitions = modbus2zenoh::definition::parse_definitions(json, "meter").unwrap();
    let registry = Registry::build(definitions, DuplicateScope::default()).unwrap();

    let device = SimulatedDevice::default();
    device.write(RegisterKind::Holding, 11, &[42]);

    let poller = DevicePoller::new(
        "meter",
        device.clone(),
        registry.polled_for("meter"),
        Default::default(),
    );
    let (tx, mut rx) = emission_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(poller.run(tx, shutdown_rx));

    let emission = rx.recv().await.unwrap();
    assert_eq!(emission.key, "present");
    assert_eq!(emission.reading.value.value, TypedValue::UInt16(42));

    device.write(RegisterKind::Holding, 10, &[7]);
    let emission = rx.recv().await.unwrap();
    assert_eq!(emission.key, "missing");

    shutdown_tx.send_replace(true);
    handle.await.unwrap();
}

#[test]
fn test_duplicate_definitions_file_is_rejected() {
    let record = r#"{
        "address": 0,
        "modbustype": "holding",
        "modbusaccess": "read",
        "valuetype": "int16",
        "mqtt": "visible",
        "interval": 10,
        "topic": "ambient/errornumber",
        "title": "Ambient Error Number"
    }"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[{record}, {record}]").unwrap();

    let definitions = load_definitions(file.path(), "ambient").unwrap();
    let err = Registry::build(definitions, DuplicateScope::AddressAndKind).unwrap_err();
    assert!(matches!(err, DefinitionError::DuplicateAddress { .. }));
    assert!(err.to_string().contains("duplicate modbus address 0"));
}

#[test]
fn test_bits_and_map_definition_file() {
    let json = r#"[{
        "address": 1,
        "modbustype": "holding",
        "modbusaccess": "read",
        "valuetype": "uint32",
        "mqtt": "visible",
        "interval": 10,
        "topic": "ambient/errornumber",
        "title": "Ambient Error Number",
        "bits": {
            "0-1": { "name": "foo" },
            "2-5": { "name": "bar" },
            "6":   { "name": "baz" }
        },
        "map": { "0": "bla", "127": "foo" }
    }]"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let definitions = load_definitions(file.path(), "ambient").unwrap();
    assert_eq!(definitions[0].bits.len(), 3);
    assert_eq!(definitions[0].value_map.get(&127).map(String::as_str), Some("foo"));

    // printed definitions reload to the same thing
    let printed = serde_json::to_string(&definitions).unwrap();
    let reloaded = modbus2zenoh::definition::parse_definitions(&printed, "ambient").unwrap();
    assert_eq!(reloaded, definitions);
}

#[test]
fn test_reading_survives_cbor() {
    let reading = Reading {
        timestamp: 1_700_000_000_000,
        device: "meter".to_string(),
        title: "Power".to_string(),
        value: modbus2zenoh::codec::ModbusValue::new(201, TypedValue::UInt32(0x4248_0000)),
        label: None,
    };

    let bytes = encode(&reading, Format::Cbor).unwrap();
    let decoded: Reading = decode_auto(&bytes).unwrap();
    assert_eq!(decoded, reading);
}

#[test]
fn test_demo_configuration_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/modbus2zenoh.json5");
    let config = ModbusBridgeConfig::load(&path).unwrap();
    let registry = config.modbus.build_registry().unwrap();

    assert_eq!(registry.devices().collect::<Vec<_>>(), ["hm310t", "inverter"]);
    assert_eq!(registry.definitions_for("inverter").len(), 5);
    assert_eq!(registry.polled_for("hm310t").len(), 3);
    assert!(registry.get("inverter", RegisterKind::Coil, 5).is_some());
}
