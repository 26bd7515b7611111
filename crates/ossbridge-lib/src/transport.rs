//! Audio transport boundary — trait, stream descriptors, USB enumeration.
//!
//! The engine never talks to hardware directly; everything flows through
//! [`AudioTransport`]. The trait mirrors the contract of a USB audio
//! transport library: numbered streams opened with a descriptor, a blocking
//! buffered write, an available-space query, a latency query, and device
//! volume with a timeout. In-repo implementations are the software sink
//! (`sink::SinkTransport`) and the test mock ([`mock::MockTransport`]);
//! hardware transports plug in behind the same trait.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::volume::{DeviceVolume, VolumeRange};

// ── Error type ──

/// Transport-level errors.
///
/// String payloads follow the convention **"context: details"** where
/// *context* identifies the operation (e.g. `"stream open"`) and *details*
/// describes what went wrong.
#[derive(Debug)]
pub enum TransportError {
    /// No usable audio device present.
    NoDevice,
    /// All hardware streams are in use.
    NoFreeStream,
    /// Stream open/descriptor query failed.
    StreamFailed(String),
    /// Volume get/set failed or timed out.
    VolumeFailed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NoDevice => write!(f, "no audio device found"),
            TransportError::NoFreeStream => write!(f, "no free hardware stream"),
            TransportError::StreamFailed(e) => write!(f, "stream operation failed: {e}"),
            TransportError::VolumeFailed(e) => write!(f, "volume operation failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

// ── Stream types ──

/// Identifier of a hardware stream within the transport.
pub type StreamId = usize;

/// Timeout used for device volume transactions.
pub const VOLUME_TIMEOUT: Duration = Duration::from_micros(50_000);

/// Sample-rate support advertised by a stream descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSpec {
    /// The stream runs at exactly this rate.
    Fixed(u32),
    /// Any rate within the inclusive range.
    Range { min: u32, max: u32 },
}

/// Capability descriptor of a hardware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDesc {
    pub rate: RateSpec,
    pub channels: u8,
    pub bits: u8,
}

/// Parameters a stream is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
    /// Transfer granularity in bytes.
    pub fragment_size: u32,
    /// Total buffer capacity in bytes.
    pub buffer_size: u32,
}

impl StreamParams {
    /// Bytes per sample frame (all channels).
    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits) / 8
    }
}

/// Callback fired from the transport's background context whenever buffer
/// space frees up on a stream.
pub type WriteNotifier = Box<dyn Fn() + Send + Sync>;

// ── Trait ──

pub trait AudioTransport: Send + Sync {
    /// Number of streams the hardware supports concurrently.
    fn num_streams(&self) -> usize;

    /// First stream not currently open, if any. Does not reserve it.
    fn find_available_stream(&self) -> Option<StreamId>;

    /// Capability descriptors for a stream, ordered by preference.
    fn stream_descs(&self, stream: StreamId) -> Result<Vec<StreamDesc>>;

    fn open_stream(&self, stream: StreamId, params: &StreamParams) -> Result<()>;

    /// Close a stream. A no-op for streams that are not open.
    fn close_stream(&self, stream: StreamId);

    /// Register the write-space callback for an open stream, replacing any
    /// previous one.
    fn set_write_notifier(&self, stream: StreamId, notifier: WriteNotifier);

    /// Blocking buffered write. Returns the bytes accepted; zero signals a
    /// hardware fault.
    fn write(&self, stream: StreamId, data: &[u8]) -> usize;

    /// Bytes that can currently be written without blocking.
    fn write_avail(&self, stream: StreamId) -> usize;

    /// Current playback latency, or `None` when the transport cannot tell.
    fn latency(&self, stream: StreamId) -> Option<Duration>;

    fn volume(&self, timeout: Duration) -> Result<DeviceVolume>;

    fn set_volume(&self, volume: DeviceVolume, timeout: Duration) -> Result<()>;

    fn volume_range(&self, timeout: Duration) -> Result<VolumeRange>;
}

// ── Device enumeration ──

/// A discovered USB audio-class device (not opened).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Bus path, e.g. `usb:001/004 [1235:8215]`.
    pub path: String,
    /// Product string from the device descriptor, if available.
    pub product: Option<String>,
    /// USB serial number, if available.
    pub serial: Option<String>,
}

/// USB audio class code (`bInterfaceClass`).
#[cfg(target_os = "linux")]
const USB_CLASS_AUDIO: u8 = 1;

/// Enumerate USB devices carrying an audio-class interface.
///
/// Returns discovery records without opening anything. On platforms without
/// USB enumeration support this is always empty.
pub fn enumerate_devices() -> Vec<DiscoveredDevice> {
    #[cfg(target_os = "linux")]
    {
        enumerate_devices_linux()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
fn enumerate_devices_linux() -> Vec<DiscoveredDevice> {
    let Ok(devices) = nusb::list_devices() else {
        return Vec::new();
    };

    devices
        .filter(|dev| {
            dev.interfaces()
                .any(|iface| iface.class() == USB_CLASS_AUDIO)
        })
        .map(|dev| {
            let path = format!(
                "usb:{:03}/{:03} [{:04x}:{:04x}]",
                dev.bus_number(),
                dev.device_address(),
                dev.vendor_id(),
                dev.product_id(),
            );
            DiscoveredDevice {
                path,
                product: dev.product_string().map(|s| s.to_string()),
                serial: dev.serial_number().map(|s| s.to_string()),
            }
        })
        .collect()
}

// ── Mock transport for testing ──

/// In-memory transport for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockStream {
        open: bool,
        params: Option<StreamParams>,
        notifier: Option<WriteNotifier>,
        avail: usize,
    }

    /// Scriptable in-memory transport. Streams track open state and a
    /// manually adjustable available-space figure; writes are recorded.
    pub struct MockTransport {
        streams: Vec<Mutex<MockStream>>,
        descs: Vec<StreamDesc>,
        volume: Mutex<DeviceVolume>,
        range: VolumeRange,
        latency: Mutex<Option<Duration>>,
        /// Recorded (stream, bytes) pairs for every write call.
        pub writes: Mutex<Vec<(StreamId, Vec<u8>)>>,
        /// If set, `open_stream` fails.
        pub fail_open: AtomicBool,
        /// If set, volume get/set fail.
        pub fail_volume: AtomicBool,
        /// If set, `write` accepts zero bytes (hardware fault).
        pub fail_write: AtomicBool,
    }

    impl MockTransport {
        pub fn new(num_streams: usize) -> Self {
            MockTransport {
                streams: (0..num_streams).map(|_| Mutex::new(MockStream::default())).collect(),
                descs: vec![StreamDesc {
                    rate: RateSpec::Range {
                        min: 8_000,
                        max: 96_000,
                    },
                    channels: 2,
                    bits: 16,
                }],
                volume: Mutex::new(0),
                range: VolumeRange {
                    min: -11520,
                    max: 0,
                },
                latency: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
                fail_open: AtomicBool::new(false),
                fail_volume: AtomicBool::new(false),
                fail_write: AtomicBool::new(false),
            }
        }

        /// Replace the descriptor list every stream reports.
        pub fn with_descs(mut self, descs: Vec<StreamDesc>) -> Self {
            self.descs = descs;
            self
        }

        pub fn with_volume_range(mut self, range: VolumeRange) -> Self {
            self.range = range;
            self
        }

        /// Force the available-space figure of a stream.
        pub fn set_avail(&self, stream: StreamId, avail: usize) {
            self.streams[stream].lock().unwrap().avail = avail;
        }

        pub fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.lock().unwrap() = latency;
        }

        pub fn is_open(&self, stream: StreamId) -> bool {
            self.streams[stream].lock().unwrap().open
        }

        pub fn open_params(&self, stream: StreamId) -> Option<StreamParams> {
            self.streams[stream].lock().unwrap().params
        }

        pub fn device_volume(&self) -> DeviceVolume {
            *self.volume.lock().unwrap()
        }

        /// Fire the registered write-space notifier of a stream, as the
        /// transport's background context would.
        pub fn fire_write_notifier(&self, stream: StreamId) {
            // Take the notifier out so the callback can re-enter the mock.
            let notifier = self.streams[stream].lock().unwrap().notifier.take();
            if let Some(notifier) = notifier {
                notifier();
                self.streams[stream].lock().unwrap().notifier.get_or_insert(notifier);
            }
        }

        pub fn has_notifier(&self, stream: StreamId) -> bool {
            self.streams[stream].lock().unwrap().notifier.is_some()
        }
    }

    impl AudioTransport for MockTransport {
        fn num_streams(&self) -> usize {
            self.streams.len()
        }

        fn find_available_stream(&self) -> Option<StreamId> {
            self.streams
                .iter()
                .position(|s| !s.lock().unwrap().open)
        }

        fn stream_descs(&self, _stream: StreamId) -> Result<Vec<StreamDesc>> {
            Ok(self.descs.clone())
        }

        fn open_stream(&self, stream: StreamId, params: &StreamParams) -> Result<()> {
            if self.fail_open.load(Ordering::Relaxed) {
                return Err(TransportError::StreamFailed("mock: open failure injected".into()));
            }
            let mut s = self.streams[stream].lock().unwrap();
            if s.open {
                return Err(TransportError::StreamFailed(format!(
                    "stream {stream} already open"
                )));
            }
            s.open = true;
            s.params = Some(*params);
            s.avail = params.buffer_size as usize;
            Ok(())
        }

        fn close_stream(&self, stream: StreamId) {
            let mut s = self.streams[stream].lock().unwrap();
            s.open = false;
            s.params = None;
            s.notifier = None;
            s.avail = 0;
        }

        fn set_write_notifier(&self, stream: StreamId, notifier: WriteNotifier) {
            self.streams[stream].lock().unwrap().notifier = Some(notifier);
        }

        fn write(&self, stream: StreamId, data: &[u8]) -> usize {
            if self.fail_write.load(Ordering::Relaxed) {
                return 0;
            }
            {
                let mut s = self.streams[stream].lock().unwrap();
                s.avail = s.avail.saturating_sub(data.len());
            }
            self.writes
                .lock()
                .unwrap()
                .push((stream, data.to_vec()));
            data.len()
        }

        fn write_avail(&self, stream: StreamId) -> usize {
            self.streams[stream].lock().unwrap().avail
        }

        fn latency(&self, _stream: StreamId) -> Option<Duration> {
            *self.latency.lock().unwrap()
        }

        fn volume(&self, _timeout: Duration) -> Result<DeviceVolume> {
            if self.fail_volume.load(Ordering::Relaxed) {
                return Err(TransportError::VolumeFailed("mock: failure injected".into()));
            }
            Ok(*self.volume.lock().unwrap())
        }

        fn set_volume(&self, volume: DeviceVolume, _timeout: Duration) -> Result<()> {
            if self.fail_volume.load(Ordering::Relaxed) {
                return Err(TransportError::VolumeFailed("mock: failure injected".into()));
            }
            *self.volume.lock().unwrap() = volume;
            Ok(())
        }

        fn volume_range(&self, _timeout: Duration) -> Result<VolumeRange> {
            Ok(self.range)
        }
    }
}
