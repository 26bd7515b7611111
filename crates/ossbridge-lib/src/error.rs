//! Unified error type for the ossbridge-lib crate.
//!
//! [`OssBridgeError`] wraps module-specific errors ([`DspError`],
//! [`TransportError`]) and configuration/I-O failures. `From` impls allow
//! `?` to propagate across module boundaries seamlessly.

use std::fmt;

use crate::engine::DspError;
use crate::transport::TransportError;

/// Unified error type for ossbridge-lib operations.
#[derive(Debug)]
pub enum OssBridgeError {
    /// Device-emulation protocol error (open, write, ioctl, poll).
    Dsp(DspError),
    /// Audio transport error (enumeration, stream open, volume).
    Transport(TransportError),
    /// Standard I/O error (config persistence, kernel device node).
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
}

impl fmt::Display for OssBridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OssBridgeError::Dsp(e) => write!(f, "{e}"),
            OssBridgeError::Transport(e) => write!(f, "{e}"),
            OssBridgeError::Io(e) => write!(f, "I/O error: {e}"),
            OssBridgeError::Config(e) => write!(f, "Config error: {e}"),
        }
    }
}

impl std::error::Error for OssBridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OssBridgeError::Dsp(e) => Some(e),
            OssBridgeError::Transport(e) => Some(e),
            OssBridgeError::Io(e) => Some(e),
            OssBridgeError::Config(_) => None,
        }
    }
}

impl From<DspError> for OssBridgeError {
    fn from(e: DspError) -> Self {
        OssBridgeError::Dsp(e)
    }
}

impl From<TransportError> for OssBridgeError {
    fn from(e: TransportError) -> Self {
        OssBridgeError::Transport(e)
    }
}

impl From<std::io::Error> for OssBridgeError {
    fn from(e: std::io::Error) -> Self {
        OssBridgeError::Io(e)
    }
}

impl From<crate::config::ValidationError> for OssBridgeError {
    fn from(e: crate::config::ValidationError) -> Self {
        OssBridgeError::Config(e.to_string())
    }
}

/// Crate-level Result alias using [`OssBridgeError`].
pub type Result<T> = std::result::Result<T, OssBridgeError>;
