//! CLI subcommands — daemon run loop and device discovery.

mod devices;
mod run;

use std::path::PathBuf;

use clap::Subcommand;
use serde::Serialize;

pub(super) use ossbridge_lib::error::Result;
pub(super) use ossbridge_lib::transport::DiscoveredDevice;

#[derive(Subcommand)]
pub enum Command {
    /// Serve the emulated OSS device
    Run {
        /// Device name; the node appears as /dev/<name>
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Device major number (0 = kernel-assigned)
        #[arg(short = 'M', long = "maj")]
        major: Option<u32>,

        /// Device minor number (0 = kernel-assigned)
        #[arg(short = 'm', long = "min")]
        minor: Option<u32>,

        /// Hardware fragment count
        #[arg(long)]
        hw_frags: Option<u32>,

        /// Hardware fragment size in bytes
        #[arg(long)]
        hw_fragsize: Option<u32>,

        /// Default sample rate in Hz
        #[arg(long)]
        hw_rate: Option<u32>,

        /// Audio backend
        #[arg(long)]
        backend: Option<String>,

        /// Load configuration from this file instead of the default path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Run in the background
        #[arg(short = 'D', long)]
        daemon: bool,
    },

    /// List connected USB audio-class devices
    Devices,
}

pub fn run(command: Command, json: bool) -> Result<()> {
    match command {
        Command::Run {
            name,
            major,
            minor,
            hw_frags,
            hw_fragsize,
            hw_rate,
            backend,
            config,
            daemon,
        } => run::cmd_run(run::RunOptions {
            name,
            major,
            minor,
            hw_frags,
            hw_fragsize,
            hw_rate,
            backend,
            config,
            daemon,
        }),
        Command::Devices => devices::cmd_devices(json),
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredDevice>,
}
