//! Command-line argument parsing for the satlink client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// satlink command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "satlink", about = "Satellite receiver remote control")]
pub struct CliArgs {
    /// Receiver host name or IP address.
    #[arg(long)]
    pub host: Option<String>,

    /// Receiver control port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Reconnection attempts before giving up.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable the latency probe.
    #[arg(long)]
    pub no_probe: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref host) = args.host {
            self.device.host = host.clone();
        }
        if let Some(port) = args.port {
            self.device.port = port;
        }
        if let Some(max) = args.max_attempts {
            self.reconnect.max_attempts = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.no_probe {
            self.probe.enabled = false;
        }
    }
}
