//! Modbus to Zenoh bridge driven by declarative register definitions.
//!
//! Each configured device gets one polling loop that reads its definitions
//! on their own intervals, decodes the raw words (integers, reinterpreted
//! floats, bit fields, value maps) and publishes only what changed.
//!
//! # Key Expressions
//!
//! ```text
//! <key_prefix>/<topic>        definition value
//! <key_prefix>/<mqttPath>     published bit field
//! <key_prefix>/@/status       bridge status
//! ```

pub mod bits;
pub mod codec;
pub mod config;
pub mod definition;
pub mod detector;
pub mod emitter;
pub mod poller;
pub mod registry;
pub mod scanner;
pub mod transport;
