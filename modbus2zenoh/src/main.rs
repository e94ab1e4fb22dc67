//! Modbus to Zenoh bridge.
//!
//! Polls Modbus devices (TCP or RTU/serial) according to their register
//! definitions and publishes changed values to Zenoh.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use modbus2zenoh::config::ModbusBridgeConfig;
use modbus2zenoh::definition::Definition;
use modbus2zenoh::emitter::{Emitter, emission_channel};
use modbus2zenoh::poller::DevicePoller;
use modbus2zenoh::registry::Registry;
use modbus2zenoh::scanner::{RegisterScanner, ScanSettings};
use modbus2zenoh::transport::ModbusTransport;
use modbus2zenoh_framework::{BridgeArgs, BridgeConfig, BridgeRunner, LoggingConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus2zenoh.json5");

    let config = ModbusBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.check {
        let registry = config
            .modbus
            .build_registry()
            .context("Invalid register definitions")?;
        return print_registry(&registry);
    }

    if let Some(device) = args.scan.clone() {
        return scan(&args, &config, &device).await;
    }

    let registry = Arc::new(
        config
            .modbus
            .build_registry()
            .context("Invalid register definitions")?,
    );

    let runner = BridgeRunner::new_with_args("modbus", config, Some(&args))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let mut runner = runner.with_status_publishing();

    let modbus = runner.config().modbus.clone();
    let (emissions, receiver) = emission_channel();

    for device in &modbus.devices {
        let definitions = registry.polled_for(&device.name);
        if definitions.is_empty() {
            warn!(device = %device.name, "No readable definitions, device will not be polled");
        }

        let transport = ModbusTransport::new(
            &device.name,
            device.connection.clone(),
            device.unit_id,
            device.timeout(),
        );
        let poller = DevicePoller::new(
            &device.name,
            transport,
            definitions,
            modbus.poller_settings(device),
        );

        info!(
            device = %device.name,
            connection = %device.connection,
            definitions = poller.len(),
            "Starting poller"
        );
        runner.spawn(poller.run(emissions.clone(), runner.shutdown_signal()));
    }
    drop(emissions);

    let emitter = Emitter::new(runner.publisher());
    runner.spawn(async move {
        let stats = emitter.run(receiver).await;
        info!(
            published = stats.success,
            failed = stats.failed,
            "Emitter stopped"
        );
    });

    info!(
        key_prefix = %modbus.key_prefix,
        devices = modbus.devices.len(),
        definitions = registry.len(),
        "Modbus bridge running"
    );

    let metadata = serde_json::json!({
        "devices": modbus.devices.iter().map(|d| &d.name).collect::<Vec<_>>(),
        "definitions": registry.len(),
        "duplicate_scope": modbus.duplicate_scope,
        "bit_field_trigger": modbus.bit_field_trigger,
    });

    runner
        .run_with_metadata(Some(metadata))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}

/// Print every validated definition as JSON, grouped by device.
fn print_registry(registry: &Registry) -> Result<()> {
    let mut by_device: BTreeMap<&str, Vec<&Definition>> = BTreeMap::new();
    for definition in registry.iter() {
        by_device
            .entry(definition.device.as_str())
            .or_default()
            .push(definition.as_ref());
    }

    println!("{}", serde_json::to_string_pretty(&by_device)?);
    eprintln!(
        "{} definition(s) on {} device(s) OK",
        registry.len(),
        by_device.len()
    );
    Ok(())
}

async fn scan(args: &BridgeArgs, config: &ModbusBridgeConfig, name: &str) -> Result<()> {
    let logging = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging().level.clone()),
        format: config.logging().format,
    };
    modbus2zenoh_framework::init_tracing(&logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    let device = config.modbus.device(name)?;
    let transport = ModbusTransport::new(
        &device.name,
        device.connection.clone(),
        device.unit_id,
        device.timeout(),
    );
    let mut scanner = RegisterScanner::new(
        &device.name,
        transport,
        ScanSettings {
            read_timeout: device.timeout(),
            ..ScanSettings::default()
        },
    );

    tokio::select! {
        report = scanner.run() => {
            info!(
                device = %device.name,
                active_stripes = report.active_stripes().len(),
                changes = report.changes.len(),
                failed_reads = report.failed_reads,
                "Scan finished"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!(device = %device.name, "Scan interrupted");
        }
    }

    Ok(())
}
