//! OSS protocol constants — legacy `/dev/dsp` ioctl surface.
//!
//! Numeric values follow the Linux `sys/soundcard.h` encoding: an ioctl
//! command packs a direction, an argument size, a magic byte, and a command
//! number into one 32-bit word. Argument records are fixed-size and must
//! match the native byte layout exactly, because clients reinterpret them
//! in place.
//!
//! Only the output path is covered — this device emulates a playback-only
//! OSS device, so the capture ioctls (`GETISPACE`, `GETIPTR`, ...) are not
//! part of the surface and decode to "unsupported".

use std::fmt;

use libc::c_int;

// ── ioctl word encoding ──

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, magic: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((magic as u32) << 8) | nr as u32
}

const fn io(magic: u8, nr: u8) -> u32 {
    ioc(IOC_NONE, magic, nr, 0)
}

const fn ior(magic: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, magic, nr, size)
}

const fn iow(magic: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, magic, nr, size)
}

const fn iowr(magic: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, magic, nr, size)
}

const DSP_MAGIC: u8 = b'P';
const MIXER_MAGIC: u8 = b'M';

const INT: usize = size_of::<c_int>();

// ── Command words ──

/// OSS API version query. Lives under the mixer magic for historic reasons.
pub const OSS_GETVERSION: u32 = ior(MIXER_MAGIC, 118, INT);

/// Stop and discard — returns the handle to its just-opened state.
pub const SNDCTL_DSP_RESET: u32 = io(DSP_MAGIC, 0);

/// Drain pending playback (best effort).
pub const SNDCTL_DSP_SYNC: u32 = io(DSP_MAGIC, 1);

/// Sample-rate negotiation: request a rate, read back what was granted.
pub const SNDCTL_DSP_SPEED: u32 = iowr(DSP_MAGIC, 2, INT);

/// Legacy mono/stereo toggle (read back as 0/1).
pub const SNDCTL_DSP_STEREO: u32 = iowr(DSP_MAGIC, 3, INT);

/// Fragment size in bytes.
pub const SNDCTL_DSP_GETBLKSIZE: u32 = iowr(DSP_MAGIC, 4, INT);

/// Sample-format negotiation.
pub const SNDCTL_DSP_SETFMT: u32 = iowr(DSP_MAGIC, 5, INT);

/// Channel-count negotiation.
pub const SNDCTL_DSP_CHANNELS: u32 = iowr(DSP_MAGIC, 6, INT);

/// Hint that a logical block of output ended. Accepted as a no-op.
pub const SNDCTL_DSP_POST: u32 = io(DSP_MAGIC, 8);

/// Fragment geometry request: packed (count, size-exponent) word.
pub const SNDCTL_DSP_SETFRAGMENT: u32 = iowr(DSP_MAGIC, 10, INT);

/// Bitmask of supported sample formats.
pub const SNDCTL_DSP_GETFMTS: u32 = ior(DSP_MAGIC, 11, INT);

/// Output buffer space, reported as an [`AudioBufInfo`] record.
pub const SNDCTL_DSP_GETOSPACE: u32 = ior(DSP_MAGIC, 12, size_of::<AudioBufInfo>());

/// Per-handle non-blocking mode (sticky; no argument).
pub const SNDCTL_DSP_NONBLOCK: u32 = io(DSP_MAGIC, 14);

/// Device capability bits.
pub const SNDCTL_DSP_GETCAPS: u32 = ior(DSP_MAGIC, 15, INT);

/// Trigger mask set. Accepted as a no-op until mmap playback exists.
pub const SNDCTL_DSP_SETTRIGGER: u32 = iow(DSP_MAGIC, 16, INT);

/// Output position, reported as a [`CountInfo`] record.
pub const SNDCTL_DSP_GETOPTR: u32 = ior(DSP_MAGIC, 18, size_of::<CountInfo>());

/// Unplayed output in bytes, derived from transport latency.
pub const SNDCTL_DSP_GETODELAY: u32 = ior(DSP_MAGIC, 23, INT);

/// Playback volume query (0–100 in each channel byte).
pub const SNDCTL_DSP_GETPLAYVOL: u32 = ior(DSP_MAGIC, 24, INT);

/// Playback volume set (left channel byte is authoritative).
pub const SNDCTL_DSP_SETPLAYVOL: u32 = iowr(DSP_MAGIC, 24, INT);

/// OSSv4 cooked-mode toggle. Echoed back without effect.
pub const SNDCTL_DSP_COOKEDMODE: u32 = iowr(DSP_MAGIC, 30, INT);

/// `SNDCTL_DSP_HALT` is the OSSv4 name for reset; same command word.
pub const SNDCTL_DSP_HALT: u32 = SNDCTL_DSP_RESET;

// ── Sample formats ──

/// Unsigned 8-bit.
pub const AFMT_U8: c_int = 0x0000_0008;

/// Signed 16-bit little-endian. USB audio is little-endian only, so this is
/// the sole 16-bit format the device ever reports.
pub const AFMT_S16_LE: c_int = 0x0000_0010;

// ── Capability bits ──

pub const DSP_CAP_REALTIME: c_int = 0x0000_0200;
pub const DSP_CAP_TRIGGER: c_int = 0x0000_1000;

/// Advertised when the transport supports more than one concurrent stream.
pub const DSP_CAP_MULTI: c_int = 0x0000_4000;

/// Version reported by [`OSS_GETVERSION`]: 3.8.1.
pub const OSS_VERSION_ID: c_int = (3 << 16) | (8 << 8) | (1 << 4);

// ── Fragment geometry ──

/// Smallest fragment size the device accepts, in bytes.
pub const MIN_FRAGSIZE: u32 = 512;

/// Smallest fragment count the device accepts.
pub const MIN_FRAGS: u32 = 2;

/// Decoded `SNDCTL_DSP_SETFRAGMENT` argument.
///
/// The packed word carries the fragment-size exponent in the low 16 bits
/// and the fragment count in the high 16 bits. Validation (minimums,
/// power-of-two rounding) is the handler's job; decoding is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRequest {
    pub fragsize: u32,
    pub frags: u32,
}

impl FragmentRequest {
    pub fn decode(word: u32) -> Self {
        FragmentRequest {
            fragsize: 1u32.wrapping_shl(word & 0xffff),
            frags: (word >> 16) & 0xffff,
        }
    }
}

// ── Argument records ──

/// `audio_buf_info` — output-space report for `SNDCTL_DSP_GETOSPACE`.
///
/// Field order matters: clients reinterpret the reply buffer as this exact
/// struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioBufInfo {
    /// Whole fragments that can be written without blocking.
    pub fragments: c_int,
    /// Total fragment count of the buffer.
    pub fragstotal: c_int,
    /// Fragment size in bytes.
    pub fragsize: c_int,
    /// Writable bytes (may be less than `fragments * fragsize`).
    pub bytes: c_int,
}

impl AudioBufInfo {
    pub fn to_ne_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.fragments.to_ne_bytes());
        out[4..8].copy_from_slice(&self.fragstotal.to_ne_bytes());
        out[8..12].copy_from_slice(&self.fragsize.to_ne_bytes());
        out[12..16].copy_from_slice(&self.bytes.to_ne_bytes());
        out
    }
}

/// `count_info` — output-pointer report for `SNDCTL_DSP_GETOPTR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountInfo {
    /// Bytes played since the stream was bound.
    pub bytes: c_int,
    /// `bytes` in whole fragments.
    pub blocks: c_int,
    /// Ring-buffer offset: `bytes` modulo the total buffer size.
    pub ptr: c_int,
}

impl CountInfo {
    pub fn to_ne_bytes(self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.bytes.to_ne_bytes());
        out[4..8].copy_from_slice(&self.blocks.to_ne_bytes());
        out[8..12].copy_from_slice(&self.ptr.to_ne_bytes());
        out
    }
}

// ── Typed command set ──

/// The closed set of ioctls the device implements.
///
/// Raw command words are decoded exactly once, at the transport boundary;
/// handlers dispatch on this enum and never touch the numeric encoding
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspIoctl {
    GetVersion,
    CookedMode,
    SetNonblock,
    GetCaps,
    Reset,
    Speed,
    GetFormats,
    SetFormat,
    Channels,
    Stereo,
    GetOutputSpace,
    GetBlockSize,
    SetFragment,
    GetOutputDelay,
    Sync,
    GetOutputPointer,
    SetPlayVolume,
    GetPlayVolume,
    SetTrigger,
    Post,
}

impl DspIoctl {
    /// Decode a raw command word. `None` means the command is not part of
    /// the emulated surface and must fail with "invalid argument".
    pub fn decode(cmd: u32) -> Option<Self> {
        Some(match cmd {
            OSS_GETVERSION => DspIoctl::GetVersion,
            SNDCTL_DSP_COOKEDMODE => DspIoctl::CookedMode,
            SNDCTL_DSP_NONBLOCK => DspIoctl::SetNonblock,
            SNDCTL_DSP_GETCAPS => DspIoctl::GetCaps,
            SNDCTL_DSP_RESET => DspIoctl::Reset,
            SNDCTL_DSP_SPEED => DspIoctl::Speed,
            SNDCTL_DSP_GETFMTS => DspIoctl::GetFormats,
            SNDCTL_DSP_SETFMT => DspIoctl::SetFormat,
            SNDCTL_DSP_CHANNELS => DspIoctl::Channels,
            SNDCTL_DSP_STEREO => DspIoctl::Stereo,
            SNDCTL_DSP_GETOSPACE => DspIoctl::GetOutputSpace,
            SNDCTL_DSP_GETBLKSIZE => DspIoctl::GetBlockSize,
            SNDCTL_DSP_SETFRAGMENT => DspIoctl::SetFragment,
            SNDCTL_DSP_GETODELAY => DspIoctl::GetOutputDelay,
            SNDCTL_DSP_SYNC => DspIoctl::Sync,
            SNDCTL_DSP_GETOPTR => DspIoctl::GetOutputPointer,
            SNDCTL_DSP_SETPLAYVOL => DspIoctl::SetPlayVolume,
            SNDCTL_DSP_GETPLAYVOL => DspIoctl::GetPlayVolume,
            SNDCTL_DSP_SETTRIGGER => DspIoctl::SetTrigger,
            SNDCTL_DSP_POST => DspIoctl::Post,
            _ => return None,
        })
    }

    /// Argument sizes as (input bytes, output bytes) the command stages
    /// across the privilege boundary.
    ///
    /// These follow the original driver's staging declarations rather than
    /// the direction bits in the command word: `SETTRIGGER` is echoed back,
    /// so it stages an output buffer too.
    pub fn arg_sizes(self) -> (usize, usize) {
        match self {
            DspIoctl::GetVersion
            | DspIoctl::GetCaps
            | DspIoctl::GetBlockSize
            | DspIoctl::GetOutputDelay
            | DspIoctl::GetPlayVolume => (0, INT),
            DspIoctl::CookedMode
            | DspIoctl::Speed
            | DspIoctl::GetFormats
            | DspIoctl::SetFormat
            | DspIoctl::Channels
            | DspIoctl::Stereo
            | DspIoctl::SetFragment
            | DspIoctl::SetPlayVolume
            | DspIoctl::SetTrigger => (INT, INT),
            DspIoctl::GetOutputSpace => (0, size_of::<AudioBufInfo>()),
            DspIoctl::GetOutputPointer => (0, size_of::<CountInfo>()),
            DspIoctl::SetNonblock | DspIoctl::Reset | DspIoctl::Sync | DspIoctl::Post => (0, 0),
        }
    }
}

impl fmt::Display for DspIoctl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DspIoctl::GetVersion => "OSS_GETVERSION",
            DspIoctl::CookedMode => "SNDCTL_DSP_COOKEDMODE",
            DspIoctl::SetNonblock => "SNDCTL_DSP_NONBLOCK",
            DspIoctl::GetCaps => "SNDCTL_DSP_GETCAPS",
            DspIoctl::Reset => "SNDCTL_DSP_RESET",
            DspIoctl::Speed => "SNDCTL_DSP_SPEED",
            DspIoctl::GetFormats => "SNDCTL_DSP_GETFMTS",
            DspIoctl::SetFormat => "SNDCTL_DSP_SETFMT",
            DspIoctl::Channels => "SNDCTL_DSP_CHANNELS",
            DspIoctl::Stereo => "SNDCTL_DSP_STEREO",
            DspIoctl::GetOutputSpace => "SNDCTL_DSP_GETOSPACE",
            DspIoctl::GetBlockSize => "SNDCTL_DSP_GETBLKSIZE",
            DspIoctl::SetFragment => "SNDCTL_DSP_SETFRAGMENT",
            DspIoctl::GetOutputDelay => "SNDCTL_DSP_GETODELAY",
            DspIoctl::Sync => "SNDCTL_DSP_SYNC",
            DspIoctl::GetOutputPointer => "SNDCTL_DSP_GETOPTR",
            DspIoctl::SetPlayVolume => "SNDCTL_DSP_SETPLAYVOL",
            DspIoctl::GetPlayVolume => "SNDCTL_DSP_GETPLAYVOL",
            DspIoctl::SetTrigger => "SNDCTL_DSP_SETTRIGGER",
            DspIoctl::Post => "SNDCTL_DSP_POST",
        };
        f.write_str(name)
    }
}

/// Read a native-endian `c_int` from a staged argument buffer.
pub fn arg_int(buf: &[u8]) -> Option<c_int> {
    let bytes: [u8; 4] = buf.get(0..4)?.try_into().ok()?;
    Some(c_int::from_ne_bytes(bytes))
}
