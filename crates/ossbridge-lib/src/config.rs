//! Daemon configuration — TOML-based, platform-aware paths.
//!
//! Everything here is fixed at process start: the device node identity and
//! the hardware buffering defaults every fresh stream slot is seeded with.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::{MIN_FRAGS, MIN_FRAGSIZE};
use crate::slots::HwDefaults;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# ossbridge configuration — changes made outside the daemon may be overwritten.\n\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device node name: the device appears as `/dev/$device_name`.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Character-device major number. 0 lets the kernel pick.
    #[serde(default)]
    pub major: u32,

    /// Character-device minor number. 0 lets the kernel pick.
    #[serde(default)]
    pub minor: u32,

    /// Hardware fragment count. Rounded up to a power of two.
    #[serde(default = "default_frags")]
    pub frags: u32,

    /// Hardware fragment size in bytes. Rounded up to a power of two.
    #[serde(default = "default_fragsize")]
    pub fragsize: u32,

    /// Default sample rate in Hz.
    #[serde(default = "default_rate")]
    pub sample_rate: u32,

    /// Audio backend: currently `"sink"` (software sink).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Concurrent streams the software sink offers.
    #[serde(default = "default_streams")]
    pub streams: usize,
}

fn default_device_name() -> String {
    "dsp".into()
}
fn default_frags() -> u32 {
    4
}
fn default_fragsize() -> u32 {
    16 * 1024
}
fn default_rate() -> u32 {
    48_000
}
fn default_backend() -> String {
    "sink".into()
}
fn default_streams() -> usize {
    2
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: default_device_name(),
            major: 0,
            minor: 0,
            frags: default_frags(),
            fragsize: default_fragsize(),
            sample_rate: default_rate(),
            backend: default_backend(),
            streams: default_streams(),
        }
    }
}

/// Validation errors that [`Config::validate`] can return.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `device_name` is empty or contains a path separator.
    InvalidDeviceName(String),
    /// `sample_rate` is zero.
    ZeroSampleRate,
    /// `backend` names no known backend.
    UnknownBackend(String),
    /// `streams` is zero.
    ZeroStreams,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidDeviceName(name) => {
                write!(f, "Invalid device name: {name:?}")
            }
            ValidationError::ZeroSampleRate => write!(f, "Sample rate cannot be zero"),
            ValidationError::UnknownBackend(b) => write!(f, "Unknown backend: {b:?}"),
            ValidationError::ZeroStreams => write!(f, "Stream count cannot be zero"),
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ossbridge"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Load config from an arbitrary path, returning the config and any
    /// parse warnings.
    ///
    /// Returns `(defaults, [])` if the file doesn't exist.
    /// Returns `(defaults, [warning])` if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Load config from the default path, returning the config and any
    /// parse warnings.
    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Save config to an arbitrary path atomically (write to temp file,
    /// then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems; fall back to direct write + cleanup
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    /// Save config to the default platform path.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.device_name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(ValidationError::InvalidDeviceName(self.device_name.clone()));
        }
        if self.sample_rate == 0 {
            return Err(ValidationError::ZeroSampleRate);
        }
        if self.backend != "sink" {
            return Err(ValidationError::UnknownBackend(self.backend.clone()));
        }
        if self.streams == 0 {
            return Err(ValidationError::ZeroStreams);
        }
        Ok(())
    }

    /// Hardware defaults for the slot table, with fragment geometry raised
    /// to the documented minimums and rounded up to powers of two.
    pub fn hw_defaults(&self) -> HwDefaults {
        HwDefaults {
            sample_rate: self.sample_rate,
            fragsize: self.fragsize.max(MIN_FRAGSIZE).next_power_of_two(),
            frags: self.frags.max(MIN_FRAGS).next_power_of_two(),
        }
    }
}
