//! Shared volume state — the boundary the external mixer utility drives.
//!
//! The device volume is one piece of state shared by every open handle and
//! by the out-of-band control collaborator. Both the `SETPLAYVOL`/
//! `GETPLAYVOL` ioctls and [`VolumeControl`] funnel through the same
//! helpers, holding the mixer lock across the (deliberately brief)
//! transport call so the cached percent and the hardware never diverge.

use std::sync::{Arc, Mutex};

use crate::engine::{DspError, Result};
use crate::transport::{AudioTransport, VOLUME_TIMEOUT};
use crate::volume::{self, VolumeRange};

/// Cached device volume on the 0–100 user scale. Lives behind the engine's
/// mixer lock.
pub struct MixerState {
    pub percent: u8,
}

/// Set the device volume from a user percent and update the cache.
///
/// `percent` may exceed 100 (it arrives as a raw channel byte); the curve
/// clamps into the device range and the cache stores at most 100.
pub(crate) fn apply_percent<T: AudioTransport>(
    transport: &T,
    range: VolumeRange,
    mixer: &Mutex<MixerState>,
    percent: u8,
) -> Result<()> {
    let mut mixer = mixer.lock().expect("mixer lock poisoned");
    let device = volume::to_device(percent, range);
    transport
        .set_volume(device, VOLUME_TIMEOUT)
        .map_err(|e| DspError::HardwareFault(format!("set volume: {e}")))?;
    mixer.percent = percent.min(100);
    Ok(())
}

/// Read the device volume, refresh the cache, and return the percent.
pub(crate) fn read_percent<T: AudioTransport>(
    transport: &T,
    range: VolumeRange,
    mixer: &Mutex<MixerState>,
) -> Result<u8> {
    let mut mixer = mixer.lock().expect("mixer lock poisoned");
    let device = transport
        .volume(VOLUME_TIMEOUT)
        .map_err(|e| DspError::HardwareFault(format!("get volume: {e}")))?;
    let percent = volume::to_percent(device, range);
    mixer.percent = percent;
    Ok(percent)
}

/// Cloneable handle for the external volume-control collaborator.
///
/// Clones share the engine's mixer state, so a volume change made here is
/// immediately visible to `GETPLAYVOL` on every open handle and vice versa.
pub struct VolumeControl<T: AudioTransport> {
    transport: Arc<T>,
    range: VolumeRange,
    mixer: Arc<Mutex<MixerState>>,
}

impl<T: AudioTransport> Clone for VolumeControl<T> {
    fn clone(&self) -> Self {
        VolumeControl {
            transport: self.transport.clone(),
            range: self.range,
            mixer: self.mixer.clone(),
        }
    }
}

impl<T: AudioTransport> VolumeControl<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        range: VolumeRange,
        mixer: Arc<Mutex<MixerState>>,
    ) -> Self {
        VolumeControl {
            transport,
            range,
            mixer,
        }
    }

    /// Last volume percent seen, without touching hardware.
    pub fn percent(&self) -> u8 {
        self.mixer.lock().expect("mixer lock poisoned").percent
    }

    /// Set the device volume (0 mutes).
    pub fn set_percent(&self, percent: u8) -> Result<()> {
        apply_percent(self.transport.as_ref(), self.range, &self.mixer, percent)
    }

    /// Query the device and refresh the cached percent.
    pub fn refresh(&self) -> Result<u8> {
        read_percent(self.transport.as_ref(), self.range, &self.mixer)
    }
}
