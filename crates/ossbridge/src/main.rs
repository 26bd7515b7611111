//! ossbridge daemon — legacy OSS `/dev/dsp` device for USB audio playback.
//!
//! Registers a userspace character device through the kernel's CUSE
//! facility and forwards audio to the configured transport backend.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

mod cli;
#[cfg(target_os = "linux")]
mod cuse;

/// Shared shutdown flag — set by the Ctrl+C handler.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser)]
#[command(
    name = "ossbridge",
    version,
    about = "OSS /dev/dsp character-device daemon for USB audio playback"
)]
struct Args {
    /// Output as JSON (for devices)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: cli::Command,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let args = Args::parse();

    #[cfg(not(windows))]
    {
        ctrlc::set_handler(move || {
            RUNNING.store(false, Ordering::SeqCst);
        })
        .ok();
    }

    if let Err(e) = cli::run(args.command, args.json) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
