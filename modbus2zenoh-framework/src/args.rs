//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments of the bridge.
#[derive(Parser, Debug, Clone)]
#[command(about = "Polls Modbus devices and publishes changed values to Zenoh")]
#[command(version)]
pub struct BridgeArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Load and validate configuration and definitions, print them, and exit.
    #[arg(long)]
    pub check: bool,

    /// Scan the holding register space of the named device and log changes.
    #[arg(long, value_name = "DEVICE")]
    pub scan: Option<String>,
}

impl BridgeArgs {
    /// Parse CLI arguments, falling back to `default_config` for `--config`.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        match <Self as clap::FromArgMatches>::from_arg_matches(&matches) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
