//! modbus2zenoh bridge framework
//!
//! Runtime plumbing shared by the bridge binary and its tests:
//!
//! - [`BridgeConfig`] trait for JSON5 configuration loading and validation
//! - [`BridgeRunner`] for the bridge lifecycle (logging, Zenoh session,
//!   worker tasks, cooperative shutdown on Ctrl+C)
//! - [`Publisher`] for publishing serialized payloads under a key prefix
//! - [`BridgeArgs`] for command-line parsing
//! - [`BridgeStatus`] for the `@/status` key
//! - [`Format`] with JSON/CBOR [`encode`]/[`decode`]
//!
//! # Example
//!
//! ```ignore
//! use modbus2zenoh_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("modbus2zenoh.json5");
//!     let config = MyConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("modbus", config, Some(&args)).await?;
//!     let shutdown = runner.shutdown_signal();
//!     runner.spawn(my_worker(runner.publisher(), shutdown));
//!
//!     runner.run_with_metadata(None).await
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod serialization;
mod session;
mod status;

pub use args::BridgeArgs;
pub use config::{BridgeConfig, LogFormat, LoggingConfig, ZenohConfig, parse_config};
pub use error::{BridgeError, Result};
pub use publisher::Publisher;
pub use runner::BridgeRunner;
pub use serialization::{Format, decode, decode_auto, detect_format, encode};
pub use session::connect;
pub use status::{BridgeStatus, StatusPublisher};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    installed.map_err(|e| BridgeError::config(format!("Failed to initialize tracing: {}", e)))
}
