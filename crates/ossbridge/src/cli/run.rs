//! `run` subcommand — bootstrap and serve the emulated device.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use super::Result;
use ossbridge_lib::config::Config;
use ossbridge_lib::engine::DspEngine;
use ossbridge_lib::sink::SinkTransport;
use ossbridge_lib::transport;

pub(super) struct RunOptions {
    pub name: Option<String>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub hw_frags: Option<u32>,
    pub hw_fragsize: Option<u32>,
    pub hw_rate: Option<u32>,
    pub backend: Option<String>,
    pub config: Option<PathBuf>,
    pub daemon: bool,
}

impl RunOptions {
    /// Command-line flags override whatever the config file said.
    fn apply_to(&self, config: &mut Config) {
        if let Some(ref name) = self.name {
            config.device_name = name.clone();
        }
        if let Some(major) = self.major {
            config.major = major;
        }
        if let Some(minor) = self.minor {
            config.minor = minor;
        }
        if let Some(frags) = self.hw_frags {
            config.frags = frags;
        }
        if let Some(fragsize) = self.hw_fragsize {
            config.fragsize = fragsize;
        }
        if let Some(rate) = self.hw_rate {
            config.sample_rate = rate;
        }
        if let Some(ref backend) = self.backend {
            config.backend = backend.clone();
        }
    }
}

pub(super) fn cmd_run(options: RunOptions) -> Result<()> {
    let (mut config, warnings) = match &options.config {
        Some(path) => Config::load_from(path),
        None => Config::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("{w}");
    }
    options.apply_to(&mut config);
    config.validate()?;

    for dev in transport::enumerate_devices() {
        info!(
            "USB audio device: {}{}",
            dev.path,
            dev.product
                .as_deref()
                .map(|p| format!(" ({p})"))
                .unwrap_or_default()
        );
    }

    let defaults = config.hw_defaults();
    info!(
        "hardware defaults: {} Hz, {} fragments of {} bytes, backend {:?}",
        defaults.sample_rate, defaults.frags, defaults.fragsize, config.backend
    );

    let sink = Arc::new(SinkTransport::new(config.streams));
    let engine = Arc::new(DspEngine::new(sink, defaults)?);
    let range = engine.volume_range();
    info!("device volume range: {}..={}", range.min, range.max);

    serve(&config, engine, options.daemon)
}

#[cfg(target_os = "linux")]
fn serve(config: &Config, engine: Arc<DspEngine<SinkTransport>>, daemon: bool) -> Result<()> {
    if daemon {
        crate::cuse::daemonize()?;
    }
    let session = crate::cuse::CuseSession::create(config, engine)?;
    info!("serving /dev/{}", config.device_name);
    session.run(&crate::RUNNING)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn serve(_config: &Config, _engine: Arc<DspEngine<SinkTransport>>, _daemon: bool) -> Result<()> {
    Err(ossbridge_lib::OssBridgeError::Config(
        "the kernel character-device transport requires Linux".into(),
    ))
}
