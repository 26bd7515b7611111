//! Device driver handlers — the OSS protocol state machine.
//!
//! One [`DspEngine`] serves every open handle of the emulated device. Each
//! handler mirrors a character-device operation: open, write, ioctl, poll,
//! release, plus the asynchronous write-space notification the transport
//! delivers when buffer room frees up. Handlers return typed replies; the
//! kernel transport adapter translates them into wire responses and errno
//! values.
//!
//! A slot binds to a hardware stream lazily, on its first write, because
//! format-defining ioctls arrive after open but must take effect before
//! any hardware commitment. Reset unbinds; release tears down.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libc::c_int;
use log::{debug, info, warn};

use crate::control::{self, MixerState, VolumeControl};
use crate::marshal::{self, IoctlArgs, MarshalError, Staged};
use crate::protocol::{self, AudioBufInfo, CountInfo, DspIoctl, FragmentRequest};
use crate::slots::{
    Binding, ClientInfo, HwDefaults, PollHandle, SlotId, SlotState, SlotTable,
};
use crate::transport::{AudioTransport, RateSpec, StreamId, StreamParams, VOLUME_TIMEOUT};
use crate::volume::VolumeRange;

// ── Error type ──

/// Per-operation engine errors, mapped onto OS error codes at the kernel
/// boundary.
#[derive(Debug)]
pub enum DspError {
    /// No free slot, or no free hardware stream to bind.
    Busy,
    /// Open access mode was not write-only.
    AccessDenied,
    /// Non-blocking write found no room.
    WouldBlock,
    /// The slot's sticky error flag is set.
    BrokenStream,
    /// The transport failed mid-operation.
    HardwareFault(String),
    InvalidArgument(String),
}

impl DspError {
    /// OS error code the kernel adapter reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            DspError::Busy => libc::EBUSY,
            DspError::AccessDenied => libc::EACCES,
            DspError::WouldBlock => libc::EAGAIN,
            DspError::BrokenStream => libc::EPIPE,
            DspError::HardwareFault(_) => libc::EIO,
            DspError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

impl fmt::Display for DspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DspError::Busy => write!(f, "device busy"),
            DspError::AccessDenied => write!(f, "permission denied"),
            DspError::WouldBlock => write!(f, "try again"),
            DspError::BrokenStream => write!(f, "broken pipe"),
            DspError::HardwareFault(e) => write!(f, "I/O error: {e}"),
            DspError::InvalidArgument(e) => write!(f, "invalid argument: {e}"),
        }
    }
}

impl std::error::Error for DspError {}

impl From<MarshalError> for DspError {
    fn from(e: MarshalError) -> Self {
        DspError::InvalidArgument(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DspError>;

// ── Reply types ──

/// Access mode requested at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Completed or retried ioctl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlReply {
    /// Argument buffers are not resident yet: stage these sizes and
    /// re-invoke. No side effects have happened.
    Retry { in_size: usize, out_size: usize },
    /// Done; the payload is copied into the caller's output buffer.
    Done(Vec<u8>),
}

/// Poll readiness bits, matching the kernel's `poll.h` values.
pub const POLLOUT: u32 = 0x0004;
pub const POLLHUP: u32 = 0x0010;

/// Upper bound on `fragsize * frags`, keeping every buffer figure
/// representable as a `c_int`.
const MAX_BUFFER_BYTES: u64 = 1 << 26;

// ── Engine ──

pub struct DspEngine<T: AudioTransport> {
    transport: Arc<T>,
    defaults: HwDefaults,
    /// Queried once at startup; read-only afterwards, so unlocked.
    volume_range: VolumeRange,
    table: SlotTable,
    /// Volume state shared with the external control utility.
    mixer: Arc<Mutex<MixerState>>,
}

impl<T: AudioTransport> DspEngine<T> {
    /// Build an engine over a transport. Queries the device volume range
    /// once; it is immutable for the life of the process.
    pub fn new(transport: Arc<T>, defaults: HwDefaults) -> Result<Self> {
        let volume_range = transport
            .volume_range(VOLUME_TIMEOUT)
            .map_err(|e| DspError::HardwareFault(format!("volume range query: {e}")))?;

        let percent = transport
            .volume(VOLUME_TIMEOUT)
            .map(|v| crate::volume::to_percent(v, volume_range))
            .unwrap_or(100);

        Ok(DspEngine {
            transport,
            defaults,
            volume_range,
            table: SlotTable::new(),
            mixer: Arc::new(Mutex::new(MixerState { percent })),
        })
    }

    pub fn volume_range(&self) -> VolumeRange {
        self.volume_range
    }

    /// Handle for the out-of-band volume-control collaborator.
    pub fn volume_control(&self) -> VolumeControl<T> {
        VolumeControl::new(self.transport.clone(), self.volume_range, self.mixer.clone())
    }

    // ── open ──

    /// Claim a slot for a new device handle. The device is playback-only,
    /// so anything but write-only access is refused.
    pub fn open(&self, mode: AccessMode, client: ClientInfo) -> Result<SlotId> {
        if mode != AccessMode::WriteOnly {
            return Err(DspError::AccessDenied);
        }
        let id = self
            .table
            .acquire(&self.defaults, client.clone())
            .ok_or(DspError::Busy)?;
        info!("slot {id}: opened by {:?} (pid {})", client.name, client.pid);
        Ok(id)
    }

    // ── write ──

    /// Submit playback data. `handle_nonblock` reflects `O_NONBLOCK` on the
    /// file handle; the slot's sticky flag from `SNDCTL_DSP_NONBLOCK` has
    /// the same effect.
    pub fn write(&self, slot: SlotId, data: &[u8], handle_nonblock: bool) -> Result<usize> {
        let cell = self.table.slot(slot);

        let (stream, to_write) = {
            let mut state = cell.lock().expect("slot lock poisoned");
            if state.error {
                return Err(DspError::BrokenStream);
            }
            if data.is_empty() {
                return Ok(0);
            }

            let stream = match state.binding.stream() {
                Some(stream) => stream,
                None => self.bind(&mut state, &cell)?,
            };

            let to_write = if handle_nonblock || state.nonblock {
                // Clamp to available space, rounded down to whole frames.
                let frame = state.frame_size().max(1);
                let avail = self.transport.write_avail(stream) / frame * frame;
                avail.min(data.len())
            } else {
                data.len()
            };
            if to_write == 0 {
                return Err(DspError::WouldBlock);
            }
            (stream, to_write)
        };

        // The blocking transfer runs outside the slot lock so the
        // write-space notification path stays live.
        let accepted = self.transport.write(stream, &data[..to_write]);
        if accepted == 0 {
            return Err(DspError::HardwareFault("stream accepted no data".into()));
        }

        let mut state = cell.lock().expect("slot lock poisoned");
        state.write_cnt += accepted as u64;
        Ok(accepted)
    }

    /// Bind the slot to a hardware stream using its negotiated format and
    /// geometry. On failure the slot stays unbound for a later attempt.
    fn bind(&self, state: &mut SlotState, cell: &Arc<Mutex<SlotState>>) -> Result<StreamId> {
        let stream = self
            .transport
            .find_available_stream()
            .ok_or(DspError::Busy)?;

        let params = StreamParams {
            sample_rate: state.sample_rate,
            channels: state.channels,
            bits: state.bits,
            fragment_size: state.fragsize,
            buffer_size: state.buffer_size(),
        };
        if let Err(e) = self.transport.open_stream(stream, &params) {
            warn!("stream {stream} bind failed: {e}");
            return Err(DspError::Busy);
        }

        let notify_cell = cell.clone();
        self.transport.set_write_notifier(
            stream,
            Box::new(move || {
                let mut state = notify_cell.lock().expect("slot lock poisoned");
                if let Some(handle) = state.poll_handle.take() {
                    handle.complete();
                }
            }),
        );

        debug!(
            "stream {stream}: bound at {} Hz, {} ch, {} bit, {}x{} buffer",
            params.sample_rate, params.channels, params.bits, state.frags, state.fragsize
        );
        state.binding = Binding::Bound(stream);
        Ok(stream)
    }

    // ── ioctl ──

    pub fn ioctl(&self, slot: SlotId, cmd: u32, args: &IoctlArgs<'_>) -> Result<IoctlReply> {
        let Some(op) = DspIoctl::decode(cmd) else {
            return Err(DspError::InvalidArgument(format!(
                "unrecognized ioctl {cmd:#010X}"
            )));
        };

        let (in_size, out_size) = op.arg_sizes();
        let input = match marshal::stage(in_size, out_size, args)? {
            Staged::Retry { in_size, out_size } => {
                return Ok(IoctlReply::Retry { in_size, out_size });
            }
            Staged::Ready { input } => input,
        };

        debug!("slot {slot}: ioctl {op}");
        let cell = self.table.slot(slot);

        match op {
            DspIoctl::GetVersion => Ok(reply_int(protocol::OSS_VERSION_ID)),

            // Echoed without effect; the emulation has no cooked/raw split.
            DspIoctl::CookedMode => Ok(IoctlReply::Done(input)),

            DspIoctl::SetNonblock => {
                cell.lock().expect("slot lock poisoned").nonblock = true;
                Ok(IoctlReply::Done(Vec::new()))
            }

            DspIoctl::GetCaps => {
                let mut caps = protocol::DSP_CAP_REALTIME | protocol::DSP_CAP_TRIGGER;
                if self.transport.num_streams() > 1 {
                    caps |= protocol::DSP_CAP_MULTI;
                }
                Ok(reply_int(caps))
            }

            DspIoctl::Reset => {
                let mut state = cell.lock().expect("slot lock poisoned");
                if let Some(stream) = state.binding.stream() {
                    self.transport.close_stream(stream);
                    state.binding = Binding::Unbound;
                    state.write_cnt = 0;
                    debug!("slot {slot}: reset, stream {stream} closed");
                }
                Ok(IoctlReply::Done(Vec::new()))
            }

            DspIoctl::Speed => self.negotiate_speed(&cell, &input),

            DspIoctl::GetFormats | DspIoctl::SetFormat => {
                let state = cell.lock().expect("slot lock poisoned");
                let token = match state.bits {
                    8 => protocol::AFMT_U8,
                    _ => protocol::AFMT_S16_LE,
                };
                Ok(reply_int(token))
            }

            DspIoctl::Channels => {
                let state = cell.lock().expect("slot lock poisoned");
                Ok(reply_int(c_int::from(state.channels)))
            }

            DspIoctl::Stereo => {
                let state = cell.lock().expect("slot lock poisoned");
                Ok(reply_int(c_int::from(state.channels > 1)))
            }

            DspIoctl::GetOutputSpace => {
                let state = cell.lock().expect("slot lock poisoned");
                let avail = match state.binding.stream() {
                    // Not bound: the whole configured buffer minus one byte.
                    None => state.buffer_size() as usize - 1,
                    Some(stream) => self.transport.write_avail(stream),
                };
                let info = AudioBufInfo {
                    fragments: (avail / state.fragsize as usize) as c_int,
                    fragstotal: state.frags as c_int,
                    fragsize: state.fragsize as c_int,
                    bytes: avail as c_int,
                };
                Ok(IoctlReply::Done(info.to_ne_bytes().to_vec()))
            }

            DspIoctl::GetBlockSize => {
                let state = cell.lock().expect("slot lock poisoned");
                Ok(reply_int(state.fragsize as c_int))
            }

            DspIoctl::SetFragment => self.set_fragment(&cell, &input),

            DspIoctl::GetOutputDelay => {
                let state = cell.lock().expect("slot lock poisoned");
                let bytes = match state.binding.stream() {
                    Some(stream) => match self.transport.latency(stream) {
                        Some(latency) => latency_bytes(&state, latency),
                        None => 0,
                    },
                    None => 0,
                };
                Ok(reply_int(bytes))
            }

            DspIoctl::Sync => {
                let latency = {
                    let state = cell.lock().expect("slot lock poisoned");
                    state
                        .binding
                        .stream()
                        .and_then(|stream| self.transport.latency(stream))
                };
                // Best-effort drain: sleep out the reported latency. The
                // slot lock is released first.
                if let Some(latency) = latency {
                    std::thread::sleep(latency);
                }
                Ok(IoctlReply::Done(Vec::new()))
            }

            DspIoctl::GetOutputPointer => {
                let state = cell.lock().expect("slot lock poisoned");
                let position = match state.binding.stream() {
                    None => 0,
                    Some(stream) => {
                        let avail = self.transport.write_avail(stream) as i64;
                        let total = i64::from(state.buffer_size());
                        // Transiently negative right after binding, before
                        // any data is in flight; clamp instead of wrapping.
                        (state.write_cnt as i64 + avail - (total - 1)).max(0)
                    }
                };
                let total = i64::from(state.buffer_size());
                let info = CountInfo {
                    bytes: position as c_int,
                    blocks: (position / i64::from(state.fragsize)) as c_int,
                    ptr: (position % total) as c_int,
                };
                Ok(IoctlReply::Done(info.to_ne_bytes().to_vec()))
            }

            DspIoctl::SetPlayVolume => {
                let word = protocol::arg_int(&input)
                    .ok_or_else(|| DspError::InvalidArgument("short volume argument".into()))?;
                let left = (word & 0xff) as u8;
                control::apply_percent(
                    self.transport.as_ref(),
                    self.volume_range,
                    &self.mixer,
                    left,
                )?;
                Ok(reply_int(c_int::from(left) << 8 | c_int::from(left)))
            }

            DspIoctl::GetPlayVolume => {
                let percent = control::read_percent(
                    self.transport.as_ref(),
                    self.volume_range,
                    &self.mixer,
                )?;
                Ok(reply_int(c_int::from(percent) << 8 | c_int::from(percent)))
            }

            // Placeholder until mmap playback exists.
            DspIoctl::SetTrigger => Ok(IoctlReply::Done(input)),

            DspIoctl::Post => Ok(IoctlReply::Done(Vec::new())),
        }
    }

    fn negotiate_speed(&self, cell: &Arc<Mutex<SlotState>>, input: &[u8]) -> Result<IoctlReply> {
        let requested = protocol::arg_int(input)
            .ok_or_else(|| DspError::InvalidArgument("short rate argument".into()))?;

        let mut state = cell.lock().expect("slot lock poisoned");

        // An unbound slot borrows an available stream purely to read its
        // descriptor; nothing is opened or reserved.
        let probe = match state.binding.stream() {
            Some(stream) => stream,
            None => self
                .transport
                .find_available_stream()
                .ok_or(DspError::Busy)?,
        };
        let descs = self
            .transport
            .stream_descs(probe)
            .map_err(|e| DspError::HardwareFault(format!("descriptor query: {e}")))?;
        let desc = descs
            .first()
            .ok_or_else(|| DspError::HardwareFault("stream has no descriptors".into()))?;

        let granted = match desc.rate {
            // A fixed hardware rate silently overrides the request.
            RateSpec::Fixed(rate) => rate,
            RateSpec::Range { min, max } => {
                i64::from(requested).clamp(i64::from(min), i64::from(max)) as u32
            }
        };

        state.sample_rate = granted;
        Ok(reply_int(granted as c_int))
    }

    fn set_fragment(&self, cell: &Arc<Mutex<SlotState>>, input: &[u8]) -> Result<IoctlReply> {
        let word = protocol::arg_int(input)
            .ok_or_else(|| DspError::InvalidArgument("short fragment argument".into()))?;

        let mut state = cell.lock().expect("slot lock poisoned");
        if state.binding.is_bound() {
            return Err(DspError::InvalidArgument(
                "fragment geometry is fixed while a stream is bound".into(),
            ));
        }

        let request = FragmentRequest::decode(word as u32);
        let frags = request.frags.next_power_of_two();
        let total = u64::from(request.fragsize) * u64::from(frags);
        if request.fragsize < protocol::MIN_FRAGSIZE
            || request.frags < protocol::MIN_FRAGS
            || total > MAX_BUFFER_BYTES
        {
            return Err(DspError::InvalidArgument(format!(
                "fragment geometry {}x{} out of range",
                request.frags, request.fragsize
            )));
        }

        state.fragsize = request.fragsize;
        state.frags = frags;
        Ok(IoctlReply::Done(input.to_vec()))
    }

    // ── poll ──

    /// Register interest in readiness and report the current state. Never
    /// blocks: a zero result means the caller waits for the write-space
    /// notification to complete the handle.
    pub fn poll(&self, slot: SlotId, handle: Option<Box<dyn PollHandle>>) -> u32 {
        let cell = self.table.slot(slot);
        let mut state = cell.lock().expect("slot lock poisoned");

        // At most one pending handle; the replaced one is destroyed.
        let _replaced = std::mem::replace(&mut state.poll_handle, handle);

        if state.error {
            return POLLHUP;
        }
        match state.binding.stream() {
            // Always writable before the stream is bound.
            None => POLLOUT,
            Some(stream) => {
                if self.transport.write_avail(stream) >= state.fragsize as usize {
                    POLLOUT
                } else {
                    0
                }
            }
        }
    }

    // ── release ──

    /// Tear the handle down. Always succeeds.
    pub fn release(&self, slot: SlotId) {
        let stream = {
            let cell = self.table.slot(slot);
            let mut state = cell.lock().expect("slot lock poisoned");
            state.poll_handle.take();
            state.binding.stream()
        };
        if let Some(stream) = stream {
            self.transport.close_stream(stream);
        }
        self.table.clear(slot);
        debug!("slot {slot}: released");
    }

    // ── notifications ──

    /// Mark the slot's stream broken (e.g. device unplugged). Subsequent
    /// writes fail with a broken pipe until the client reopens; a parked
    /// poller is woken so it can observe the hangup.
    pub fn mark_error(&self, slot: SlotId) {
        let cell = self.table.slot(slot);
        let mut state = cell.lock().expect("slot lock poisoned");
        state.error = true;
        if let Some(handle) = state.poll_handle.take() {
            handle.complete();
        }
    }
}

fn reply_int(value: c_int) -> IoctlReply {
    IoctlReply::Done(value.to_ne_bytes().to_vec())
}

/// Convert a playback latency into a byte count at the slot's format.
fn latency_bytes(state: &SlotState, latency: Duration) -> c_int {
    let bytes = latency.as_micros() as u64
        * u64::from(state.sample_rate)
        * state.frame_size() as u64
        / 1_000_000;
    bytes.min(c_int::MAX as u64) as c_int
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::IoctlArgs;
    use crate::protocol::*;
    use crate::transport::mock::MockTransport;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DEFAULTS: HwDefaults = HwDefaults {
        sample_rate: 48_000,
        fragsize: 4096,
        frags: 4,
    };

    fn engine() -> DspEngine<MockTransport> {
        engine_with(MockTransport::new(2))
    }

    fn engine_with(mock: MockTransport) -> DspEngine<MockTransport> {
        DspEngine::new(Arc::new(mock), DEFAULTS).unwrap()
    }

    fn client() -> ClientInfo {
        ClientInfo {
            pid: 42,
            name: "ossplay".into(),
        }
    }

    fn open(engine: &DspEngine<MockTransport>) -> SlotId {
        engine.open(AccessMode::WriteOnly, client()).unwrap()
    }

    /// Run an ioctl through both staging passes and return the final reply.
    fn ioctl(engine: &DspEngine<MockTransport>, slot: SlotId, cmd: u32, arg: c_int) -> Result<Vec<u8>> {
        let first = engine.ioctl(slot, cmd, &IoctlArgs::UNSTAGED)?;
        let (in_size, out_size) = match first {
            IoctlReply::Done(data) => return Ok(data),
            IoctlReply::Retry { in_size, out_size } => (in_size, out_size),
        };
        let input = arg.to_ne_bytes();
        let args = IoctlArgs {
            input: &input[..in_size],
            output_capacity: out_size,
        };
        match engine.ioctl(slot, cmd, &args)? {
            IoctlReply::Done(data) => Ok(data),
            IoctlReply::Retry { .. } => panic!("second staging pass retried again"),
        }
    }

    fn ioctl_int(engine: &DspEngine<MockTransport>, slot: SlotId, cmd: u32, arg: c_int) -> c_int {
        let data = ioctl(engine, slot, cmd, arg).unwrap();
        arg_int(&data).expect("int-sized reply")
    }

    struct FlagHandle(Arc<AtomicBool>);

    impl PollHandle for FlagHandle {
        fn complete(self: Box<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    // ── open ──

    #[test]
    fn open_requires_write_only() {
        let engine = engine();
        assert!(matches!(
            engine.open(AccessMode::ReadOnly, client()),
            Err(DspError::AccessDenied)
        ));
        assert!(matches!(
            engine.open(AccessMode::ReadWrite, client()),
            Err(DspError::AccessDenied)
        ));
        assert!(engine.open(AccessMode::WriteOnly, client()).is_ok());
    }

    #[test]
    fn open_exhaustion_reports_busy_and_release_recovers() {
        let engine = engine();
        let mut slots = Vec::new();
        for _ in 0..crate::slots::MAX_STREAMS {
            slots.push(open(&engine));
        }
        assert!(matches!(
            engine.open(AccessMode::WriteOnly, client()),
            Err(DspError::Busy)
        ));

        engine.release(slots[0]);
        assert!(engine.open(AccessMode::WriteOnly, client()).is_ok());
        assert!(matches!(
            engine.open(AccessMode::WriteOnly, client()),
            Err(DspError::Busy)
        ));
    }

    // ── write ──

    #[test]
    fn zero_length_write_succeeds_without_binding() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(engine.write(slot, &[], false).unwrap(), 0);
        let cell = engine.table.slot(slot);
        let state = cell.lock().unwrap();
        assert_eq!(state.write_cnt, 0);
        assert_eq!(state.binding, Binding::Unbound);
    }

    #[test]
    fn first_write_binds_with_negotiated_params() {
        let mock = MockTransport::new(2);
        let engine = engine_with(mock);
        let slot = open(&engine);

        assert_eq!(engine.write(slot, &[0u8; 4096], false).unwrap(), 4096);

        let params = engine.transport.open_params(0).expect("stream 0 bound");
        assert_eq!(params.sample_rate, 48_000);
        assert_eq!(params.channels, 2);
        assert_eq!(params.bits, 16);
        assert_eq!(params.fragment_size, 4096);
        assert_eq!(params.buffer_size, 16384);
        assert!(engine.transport.has_notifier(0));

        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().write_cnt, 4096);
    }

    #[test]
    fn bind_failure_is_busy_and_slot_stays_unbound() {
        let mock = MockTransport::new(1);
        mock.fail_open.store(true, Ordering::SeqCst);
        let engine = engine_with(mock);
        let slot = open(&engine);

        assert!(matches!(
            engine.write(slot, &[0u8; 16], false),
            Err(DspError::Busy)
        ));
        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().binding, Binding::Unbound);

        // A later attempt may succeed.
        engine.transport.fail_open.store(false, Ordering::SeqCst);
        assert_eq!(engine.write(slot, &[0u8; 16], false).unwrap(), 16);
    }

    #[test]
    fn sticky_error_fails_every_write() {
        let engine = engine();
        let slot = open(&engine);
        engine.mark_error(slot);
        assert!(matches!(
            engine.write(slot, &[0u8; 16], false),
            Err(DspError::BrokenStream)
        ));
        assert!(matches!(
            engine.write(slot, &[], false),
            Err(DspError::BrokenStream)
        ));
    }

    #[test]
    fn nonblocking_write_with_no_space_is_would_block() {
        let engine = engine();
        let slot = open(&engine);
        // Bind first so available space is consulted.
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.set_avail(0, 0);

        assert!(matches!(
            engine.write(slot, &[0u8; 100], true),
            Err(DspError::WouldBlock)
        ));
        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().write_cnt, 16, "nothing accepted");
    }

    #[test]
    fn nonblocking_write_clamps_to_whole_frames() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        // 10 bytes available, frame size 4: only 8 writable.
        engine.transport.set_avail(0, 10);

        assert_eq!(engine.write(slot, &[0u8; 100], true).unwrap(), 8);
    }

    #[test]
    fn sticky_nonblock_flag_applies_without_handle_flag() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        ioctl(&engine, slot, SNDCTL_DSP_NONBLOCK, 0).unwrap();
        engine.transport.set_avail(0, 0);

        assert!(matches!(
            engine.write(slot, &[0u8; 100], false),
            Err(DspError::WouldBlock)
        ));
    }

    #[test]
    fn transport_accepting_nothing_is_hardware_fault() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.fail_write.store(true, Ordering::SeqCst);

        assert!(matches!(
            engine.write(slot, &[0u8; 64], false),
            Err(DspError::HardwareFault(_))
        ));
        // Not sticky: the flag is reserved for stream death.
        engine.transport.fail_write.store(false, Ordering::SeqCst);
        assert_eq!(engine.write(slot, &[0u8; 64], false).unwrap(), 64);
    }

    // ── ioctl: staging ──

    #[test]
    fn ioctl_first_pass_retries_with_declared_sizes() {
        let engine = engine();
        let slot = open(&engine);
        let reply = engine
            .ioctl(slot, SNDCTL_DSP_SPEED, &IoctlArgs::UNSTAGED)
            .unwrap();
        assert_eq!(
            reply,
            IoctlReply::Retry {
                in_size: 4,
                out_size: 4
            }
        );
    }

    #[test]
    fn ioctl_without_args_completes_first_pass() {
        let engine = engine();
        let slot = open(&engine);
        let reply = engine
            .ioctl(slot, SNDCTL_DSP_POST, &IoctlArgs::UNSTAGED)
            .unwrap();
        assert_eq!(reply, IoctlReply::Done(Vec::new()));
    }

    #[test]
    fn unknown_ioctl_is_invalid_argument() {
        let engine = engine();
        let slot = open(&engine);
        let err = engine
            .ioctl(slot, 0xDEAD_BEEF, &IoctlArgs::UNSTAGED)
            .unwrap_err();
        assert!(matches!(err, DspError::InvalidArgument(_)));
        assert_eq!(err.errno(), libc::EINVAL);
    }

    // ── ioctl: queries ──

    #[test]
    fn version_and_caps() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, OSS_GETVERSION, 0), OSS_VERSION_ID);

        // Two hardware streams: multi-open capability advertised.
        let caps = ioctl_int(&engine, slot, SNDCTL_DSP_GETCAPS, 0);
        assert_ne!(caps & DSP_CAP_REALTIME, 0);
        assert_ne!(caps & DSP_CAP_TRIGGER, 0);
        assert_ne!(caps & DSP_CAP_MULTI, 0);
    }

    #[test]
    fn caps_single_stream_has_no_multi() {
        let engine = engine_with(MockTransport::new(1));
        let slot = open(&engine);
        let caps = ioctl_int(&engine, slot, SNDCTL_DSP_GETCAPS, 0);
        assert_eq!(caps & DSP_CAP_MULTI, 0);
    }

    #[test]
    fn format_follows_bit_depth() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SETFMT, 0), AFMT_S16_LE);
        {
            let cell = engine.table.slot(slot);
            cell.lock().unwrap().bits = 8;
        }
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_GETFMTS, 0), AFMT_U8);
    }

    #[test]
    fn channels_and_stereo() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_CHANNELS, 0), 2);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_STEREO, 0), 1);
        {
            let cell = engine.table.slot(slot);
            cell.lock().unwrap().channels = 1;
        }
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_STEREO, 0), 0);
    }

    #[test]
    fn block_size_reports_fragsize() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_GETBLKSIZE, 0), 4096);
    }

    // ── ioctl: speed ──

    #[test]
    fn speed_clamps_into_descriptor_range() {
        let engine = engine(); // mock range 8000..=96000
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SPEED, 44_100), 44_100);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SPEED, 4_000), 8_000);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SPEED, 200_000), 96_000);

        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().sample_rate, 96_000);
    }

    #[test]
    fn speed_fixed_rate_overrides_request() {
        let mock = MockTransport::new(1).with_descs(vec![crate::transport::StreamDesc {
            rate: crate::transport::RateSpec::Fixed(48_000),
            channels: 2,
            bits: 16,
        }]);
        let engine = engine_with(mock);
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SPEED, 44_100), 48_000);
        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().sample_rate, 48_000);
    }

    // ── ioctl: fragment geometry ──

    #[test]
    fn set_fragment_stores_geometry() {
        let engine = engine();
        let slot = open(&engine);
        // 8 fragments of 2^11 = 2048 bytes
        let word = (8 << 16) | 11;
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SETFRAGMENT, word), word);

        let cell = engine.table.slot(slot);
        let state = cell.lock().unwrap();
        assert_eq!(state.fragsize, 2048);
        assert_eq!(state.frags, 8);
    }

    #[test]
    fn set_fragment_rounds_count_to_power_of_two() {
        let engine = engine();
        let slot = open(&engine);
        let word = (3 << 16) | 12;
        ioctl(&engine, slot, SNDCTL_DSP_SETFRAGMENT, word).unwrap();
        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().frags, 4);
    }

    #[test]
    fn set_fragment_rejects_small_fragsize() {
        let engine = engine();
        let slot = open(&engine);
        // 2^8 = 256 bytes, below the 512 minimum
        let err = ioctl(&engine, slot, SNDCTL_DSP_SETFRAGMENT, (4 << 16) | 8).unwrap_err();
        assert!(matches!(err, DspError::InvalidArgument(_)));
    }

    #[test]
    fn set_fragment_rejects_single_fragment() {
        let engine = engine();
        let slot = open(&engine);
        let err = ioctl(&engine, slot, SNDCTL_DSP_SETFRAGMENT, (1 << 16) | 12).unwrap_err();
        assert!(matches!(err, DspError::InvalidArgument(_)));
    }

    #[test]
    fn set_fragment_rejected_once_bound() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        let err = ioctl(&engine, slot, SNDCTL_DSP_SETFRAGMENT, (4 << 16) | 12).unwrap_err();
        assert!(matches!(err, DspError::InvalidArgument(_)));
    }

    // ── ioctl: reset ──

    #[test]
    fn reset_unbinds_and_zeroes_counter() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 4096], false).unwrap();
        assert!(engine.transport.is_open(0));

        ioctl(&engine, slot, SNDCTL_DSP_RESET, 0).unwrap();

        assert!(!engine.transport.is_open(0));
        let cell = engine.table.slot(slot);
        {
            let state = cell.lock().unwrap();
            assert_eq!(state.binding, Binding::Unbound);
            assert_eq!(state.write_cnt, 0);
        }

        // Output space falls back to the full configured buffer minus one.
        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOSPACE, 0).unwrap();
        assert_eq!(arg_int(&data[12..16]), Some(16384 - 1));
    }

    #[test]
    fn reset_on_unbound_slot_is_a_no_op() {
        let engine = engine();
        let slot = open(&engine);
        ioctl(&engine, slot, SNDCTL_DSP_RESET, 0).unwrap();
        let cell = engine.table.slot(slot);
        assert_eq!(cell.lock().unwrap().binding, Binding::Unbound);
    }

    // ── ioctl: output space ──

    #[test]
    fn output_space_unbound_reports_buffer_minus_one() {
        let engine = engine();
        let slot = open(&engine);
        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOSPACE, 0).unwrap();
        let info_bytes = arg_int(&data[12..16]).unwrap();
        let fragments = arg_int(&data[0..4]).unwrap();
        let fragstotal = arg_int(&data[4..8]).unwrap();
        let fragsize = arg_int(&data[8..12]).unwrap();
        assert_eq!(info_bytes, 16383);
        assert_eq!(fragments, 16383 / 4096);
        assert_eq!(fragstotal, 4);
        assert_eq!(fragsize, 4096);
    }

    #[test]
    fn output_space_bound_reports_live_avail() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.set_avail(0, 8192);
        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOSPACE, 0).unwrap();
        assert_eq!(arg_int(&data[12..16]), Some(8192));
        assert_eq!(arg_int(&data[0..4]), Some(2));
    }

    // ── ioctl: output pointer ──

    #[test]
    fn output_pointer_after_write_is_within_bounds() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 4096], false).unwrap();

        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOPTR, 0).unwrap();
        let bytes = arg_int(&data[0..4]).unwrap();
        let blocks = arg_int(&data[4..8]).unwrap();
        assert!((0..=4096).contains(&bytes), "bytes = {bytes}");
        assert_eq!(blocks, bytes / 4096);
    }

    #[test]
    fn output_pointer_clamps_transient_underflow() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        // Freshly bound with almost nothing in flight: the estimate
        // write_cnt + avail - (buffer - 1) would go negative.
        engine.transport.set_avail(0, 0);
        {
            let cell = engine.table.slot(slot);
            cell.lock().unwrap().write_cnt = 0;
        }

        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOPTR, 0).unwrap();
        assert_eq!(arg_int(&data[0..4]), Some(0));
        assert_eq!(arg_int(&data[4..8]), Some(0));
        assert_eq!(arg_int(&data[8..12]), Some(0));
    }

    #[test]
    fn output_pointer_unbound_is_zero() {
        let engine = engine();
        let slot = open(&engine);
        let data = ioctl(&engine, slot, SNDCTL_DSP_GETOPTR, 0).unwrap();
        assert_eq!(arg_int(&data[0..4]), Some(0));
    }

    // ── ioctl: delay ──

    #[test]
    fn output_delay_converts_latency_to_bytes() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine
            .transport
            .set_latency(Some(Duration::from_millis(100)));

        // 100 ms at 48 kHz stereo 16-bit = 0.1 * 48000 * 4 bytes
        let delay = ioctl_int(&engine, slot, SNDCTL_DSP_GETODELAY, 0);
        assert_eq!(delay, 19_200);
    }

    #[test]
    fn output_delay_unavailable_is_zero() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.set_latency(None);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_GETODELAY, 0), 0);
    }

    #[test]
    fn output_delay_unbound_is_zero() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_GETODELAY, 0), 0);
    }

    // ── ioctl: volume ──

    #[test]
    fn set_volume_applies_curve_and_echoes_both_channels() {
        let engine = engine();
        let slot = open(&engine);
        let reply = ioctl_int(&engine, slot, SNDCTL_DSP_SETPLAYVOL, 50);
        assert_eq!(reply, (50 << 8) | 50);
        // Mock range is -11520..=0; the linear midpoint is -5760.
        assert_eq!(engine.transport.device_volume(), -5760);

        let read = ioctl_int(&engine, slot, SNDCTL_DSP_GETPLAYVOL, 0);
        let percent = read & 0xff;
        assert!((49..=51).contains(&percent), "percent = {percent}");
        assert_eq!(read >> 8, percent);
    }

    #[test]
    fn set_volume_zero_mutes() {
        let engine = engine();
        let slot = open(&engine);
        ioctl(&engine, slot, SNDCTL_DSP_SETPLAYVOL, 0).unwrap();
        assert_eq!(engine.transport.device_volume(), crate::volume::VOLUME_MUTE);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_GETPLAYVOL, 0), 0);
    }

    #[test]
    fn volume_failure_is_hardware_fault() {
        let engine = engine();
        let slot = open(&engine);
        engine.transport.fail_volume.store(true, Ordering::SeqCst);
        let err = ioctl(&engine, slot, SNDCTL_DSP_SETPLAYVOL, 80).unwrap_err();
        assert!(matches!(err, DspError::HardwareFault(_)));
        assert_eq!(err.errno(), libc::EIO);
    }

    // ── ioctl: no-ops ──

    #[test]
    fn trigger_and_cooked_mode_echo() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_SETTRIGGER, 3), 3);
        assert_eq!(ioctl_int(&engine, slot, SNDCTL_DSP_COOKEDMODE, 1), 1);
    }

    // ── poll ──

    #[test]
    fn poll_unbound_is_writable() {
        let engine = engine();
        let slot = open(&engine);
        assert_eq!(engine.poll(slot, None), POLLOUT);
    }

    #[test]
    fn poll_error_is_hangup() {
        let engine = engine();
        let slot = open(&engine);
        engine.mark_error(slot);
        assert_eq!(engine.poll(slot, None), POLLHUP);
    }

    #[test]
    fn poll_bound_depends_on_fragment_space() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();

        engine.transport.set_avail(0, 4096);
        assert_eq!(engine.poll(slot, None), POLLOUT);

        engine.transport.set_avail(0, 4095);
        assert_eq!(engine.poll(slot, None), 0);
    }

    #[test]
    fn notification_completes_pending_handle_once() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.set_avail(0, 0);

        let woken = Arc::new(AtomicBool::new(false));
        let events = engine.poll(slot, Some(Box::new(FlagHandle(woken.clone()))));
        assert_eq!(events, 0);

        engine.transport.fire_write_notifier(0);
        assert!(woken.load(Ordering::SeqCst));

        // The handle was consumed; a second notification finds none.
        let cell = engine.table.slot(slot);
        assert!(cell.lock().unwrap().poll_handle.is_none());
        engine.transport.fire_write_notifier(0);
    }

    #[test]
    fn newer_poll_replaces_pending_handle_without_waking_it() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        engine.transport.set_avail(0, 0);

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        engine.poll(slot, Some(Box::new(FlagHandle(first.clone()))));
        engine.poll(slot, Some(Box::new(FlagHandle(second.clone()))));

        engine.transport.fire_write_notifier(0);
        assert!(!first.load(Ordering::SeqCst), "replaced handle destroyed");
        assert!(second.load(Ordering::SeqCst));
    }

    // ── release ──

    #[test]
    fn release_closes_stream_and_frees_slot() {
        let engine = engine();
        let slot = open(&engine);
        engine.write(slot, &[0u8; 16], false).unwrap();
        assert!(engine.transport.is_open(0));

        engine.release(slot);
        assert!(!engine.transport.is_open(0));
        assert_eq!(engine.table.active_count(), 0);
    }

    #[test]
    fn release_unbound_is_safe() {
        let engine = engine();
        let slot = open(&engine);
        engine.release(slot);
        assert_eq!(engine.table.active_count(), 0);
    }

    // ── errno mapping ──

    #[test]
    fn errno_mapping_matches_taxonomy() {
        assert_eq!(DspError::Busy.errno(), libc::EBUSY);
        assert_eq!(DspError::AccessDenied.errno(), libc::EACCES);
        assert_eq!(DspError::WouldBlock.errno(), libc::EAGAIN);
        assert_eq!(DspError::BrokenStream.errno(), libc::EPIPE);
        assert_eq!(DspError::HardwareFault(String::new()).errno(), libc::EIO);
        assert_eq!(DspError::InvalidArgument(String::new()).errno(), libc::EINVAL);
    }
}
