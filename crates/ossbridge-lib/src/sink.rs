//! Software sink — a clock-paced transport for running without hardware.
//!
//! The sink models a playback device as a byte bucket drained in real time
//! at the stream's data rate. Writes queue into the bucket and block once
//! it is full; a pacer thread per open stream re-checks the drain and
//! fires the write-space notifier, so poll wake-ups behave like they do on
//! hardware. Useful for exercising the whole emulation path (and the
//! daemon itself) on machines with no USB audio device attached.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::transport::{
    AudioTransport, RateSpec, Result, StreamDesc, StreamId, StreamParams, TransportError,
    WriteNotifier,
};
use crate::volume::{DeviceVolume, VolumeRange};

/// Volume range the sink advertises: -45 dB .. 0 dB in 1/256 dB units.
const SINK_VOLUME_RANGE: VolumeRange = VolumeRange {
    min: -11520,
    max: 0,
};

struct OpenSink {
    params: StreamParams,
    /// Bytes currently queued, after accounting for drain.
    buffered: f64,
    last_drain: Instant,
    notifier: Option<WriteNotifier>,
    stop_pacer: Arc<AtomicBool>,
}

impl OpenSink {
    fn byte_rate(&self) -> f64 {
        f64::from(self.params.sample_rate) * self.params.frame_size() as f64
    }

    /// Advance the drain clock: playback consumes bytes in real time.
    fn drain(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_drain).as_secs_f64();
        self.buffered = (self.buffered - elapsed * self.byte_rate()).max(0.0);
        self.last_drain = now;
    }

    fn avail(&self) -> usize {
        (f64::from(self.params.buffer_size) - self.buffered).max(0.0) as usize
    }

    fn fragment_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.params.fragment_size) / self.byte_rate())
    }
}

/// Clock-paced software playback transport.
pub struct SinkTransport {
    streams: Vec<Arc<Mutex<Option<OpenSink>>>>,
    volume: Mutex<DeviceVolume>,
}

impl SinkTransport {
    pub fn new(num_streams: usize) -> Self {
        SinkTransport {
            streams: (0..num_streams.max(1))
                .map(|_| Arc::new(Mutex::new(None)))
                .collect(),
            volume: Mutex::new(SINK_VOLUME_RANGE.max),
        }
    }

    fn stream(&self, stream: StreamId) -> &Arc<Mutex<Option<OpenSink>>> {
        &self.streams[stream]
    }

    /// Pacer loop: periodically account for drain and fire the notifier
    /// when space is available. Exits when the stream closes.
    fn run_pacer(cell: Arc<Mutex<Option<OpenSink>>>, stop: Arc<AtomicBool>, tick: Duration) {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(tick);

            // The notifier is called without holding the stream lock: it
            // re-enters the slot lock on the engine side.
            let notifier = {
                let mut guard = cell.lock().expect("sink stream lock poisoned");
                let Some(sink) = guard.as_mut() else { break };
                sink.drain();
                if sink.avail() > 0 {
                    sink.notifier.take()
                } else {
                    None
                }
            };
            if let Some(notifier) = notifier {
                notifier();
                let mut guard = cell.lock().expect("sink stream lock poisoned");
                if let Some(sink) = guard.as_mut() {
                    sink.notifier.get_or_insert(notifier);
                }
            }
        }
    }
}

impl AudioTransport for SinkTransport {
    fn num_streams(&self) -> usize {
        self.streams.len()
    }

    fn find_available_stream(&self) -> Option<StreamId> {
        self.streams
            .iter()
            .position(|s| s.lock().expect("sink stream lock poisoned").is_none())
    }

    fn stream_descs(&self, _stream: StreamId) -> Result<Vec<StreamDesc>> {
        Ok(vec![StreamDesc {
            rate: RateSpec::Range {
                min: 4_000,
                max: 192_000,
            },
            channels: 2,
            bits: 16,
        }])
    }

    fn open_stream(&self, stream: StreamId, params: &StreamParams) -> Result<()> {
        if params.sample_rate == 0
            || params.frame_size() == 0
            || params.fragment_size == 0
            || params.buffer_size == 0
        {
            return Err(TransportError::StreamFailed(format!(
                "stream open: unusable parameters {params:?}"
            )));
        }

        let cell = self.stream(stream);
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut guard = cell.lock().expect("sink stream lock poisoned");
            if guard.is_some() {
                return Err(TransportError::StreamFailed(format!(
                    "stream open: {stream} already open"
                )));
            }
            *guard = Some(OpenSink {
                params: *params,
                buffered: 0.0,
                last_drain: Instant::now(),
                notifier: None,
                stop_pacer: stop.clone(),
            });
        }

        let byte_rate = f64::from(params.sample_rate) * params.frame_size() as f64;
        let tick = Duration::from_secs_f64(f64::from(params.fragment_size) / byte_rate);
        let pacer_cell = cell.clone();
        thread::spawn(move || Self::run_pacer(pacer_cell, stop, tick));

        debug!(
            "sink stream {stream}: open at {} Hz, {} B buffer",
            params.sample_rate, params.buffer_size
        );
        Ok(())
    }

    fn close_stream(&self, stream: StreamId) {
        let mut guard = self.stream(stream).lock().expect("sink stream lock poisoned");
        if let Some(sink) = guard.take() {
            sink.stop_pacer.store(true, Ordering::Relaxed);
            debug!("sink stream {stream}: closed");
        }
    }

    fn set_write_notifier(&self, stream: StreamId, notifier: WriteNotifier) {
        let mut guard = self.stream(stream).lock().expect("sink stream lock poisoned");
        if let Some(sink) = guard.as_mut() {
            sink.notifier = Some(notifier);
        }
    }

    fn write(&self, stream: StreamId, data: &[u8]) -> usize {
        let cell = self.stream(stream);
        let mut written = 0;

        while written < data.len() {
            let wait = {
                let mut guard = cell.lock().expect("sink stream lock poisoned");
                let Some(sink) = guard.as_mut() else {
                    // Stream closed underneath the writer.
                    return written;
                };
                sink.drain();
                let space = sink.avail().min(data.len() - written);
                if space > 0 {
                    sink.buffered += space as f64;
                    written += space;
                    None
                } else {
                    Some(sink.fragment_duration())
                }
            };
            if let Some(wait) = wait {
                thread::sleep(wait);
            }
        }
        written
    }

    fn write_avail(&self, stream: StreamId) -> usize {
        let mut guard = self.stream(stream).lock().expect("sink stream lock poisoned");
        match guard.as_mut() {
            Some(sink) => {
                sink.drain();
                sink.avail()
            }
            None => 0,
        }
    }

    fn latency(&self, stream: StreamId) -> Option<Duration> {
        let mut guard = self.stream(stream).lock().expect("sink stream lock poisoned");
        let sink = guard.as_mut()?;
        sink.drain();
        Some(Duration::from_secs_f64(sink.buffered / sink.byte_rate()))
    }

    fn volume(&self, _timeout: Duration) -> Result<DeviceVolume> {
        Ok(*self.volume.lock().expect("sink volume lock poisoned"))
    }

    fn set_volume(&self, volume: DeviceVolume, _timeout: Duration) -> Result<()> {
        *self.volume.lock().expect("sink volume lock poisoned") = volume;
        Ok(())
    }

    fn volume_range(&self, _timeout: Duration) -> Result<VolumeRange> {
        Ok(SINK_VOLUME_RANGE)
    }
}
