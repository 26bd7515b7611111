//! CUSE session — the kernel character-device transport.
//!
//! Speaks the FUSE wire protocol over `/dev/cuse`: one INIT handshake that
//! names the device node, then a request loop. Each request is dispatched
//! to the engine on its own thread (writes and `SNDCTL_DSP_SYNC` may block
//! for buffer space) and answered with a framed reply on the shared device
//! descriptor. Two-phase ioctl staging surfaces here as a retry reply
//! carrying the argument iovecs; poll wake-ups go out as unsolicited
//! notify messages.
//!
//! Wire structures follow the kernel's `uapi/linux/fuse.h`; all integers
//! are native-endian. Messages are built and parsed field by field, so no
//! layout tricks are needed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, error, warn};

use ossbridge_lib::config::Config;
use ossbridge_lib::engine::{AccessMode, DspEngine, IoctlReply};
use ossbridge_lib::marshal::IoctlArgs;
use ossbridge_lib::slots::{ClientInfo, PollHandle, SlotId};
use ossbridge_lib::transport::AudioTransport;

// ── FUSE wire protocol ──

const FUSE_KERNEL_VERSION: u32 = 7;
const FUSE_KERNEL_MINOR_VERSION: u32 = 19;

const FUSE_OPEN: u32 = 14;
const FUSE_WRITE: u32 = 16;
const FUSE_RELEASE: u32 = 18;
const FUSE_FLUSH: u32 = 25;
const FUSE_INTERRUPT: u32 = 36;
const FUSE_DESTROY: u32 = 38;
const FUSE_IOCTL: u32 = 39;
const FUSE_POLL: u32 = 40;
const CUSE_INIT: u32 = 4096;

/// `fuse_in_header` size.
const IN_HEADER_LEN: usize = 40;

const FOPEN_DIRECT_IO: u32 = 1 << 0;
const FOPEN_NONSEEKABLE: u32 = 1 << 2;

const FUSE_IOCTL_RETRY: u32 = 1 << 2;
const FUSE_POLL_SCHEDULE_NOTIFY: u32 = 1 << 0;
const FUSE_NOTIFY_POLL: i32 = 1;

const CUSE_UNRESTRICTED_IOCTL: u32 = 1 << 0;

/// Largest write payload we ask the kernel to deliver.
const MAX_WRITE: usize = 128 * 1024;

/// Read buffer: the negotiated max write plus header slack.
const BUFFER_SIZE: usize = MAX_WRITE + 8192;

// ── Parse helpers ──

fn get_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

fn get_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = buf.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_ne_bytes(bytes))
}

/// `fuse_in_header` — prefix of every kernel request.
#[derive(Debug, Clone, Copy)]
struct InHeader {
    opcode: u32,
    unique: u64,
    pid: u32,
}

impl InHeader {
    fn parse(buf: &[u8]) -> Option<InHeader> {
        if buf.len() < IN_HEADER_LEN {
            return None;
        }
        Some(InHeader {
            opcode: get_u32(buf, 4)?,
            unique: get_u64(buf, 8)?,
            pid: get_u32(buf, 32)?,
        })
    }
}

// ── Reply builders ──

/// Frame a reply: `fuse_out_header` + payload.
fn build_reply(unique: u64, error: i32, payload: &[u8]) -> Vec<u8> {
    let len = 16 + payload.len();
    let mut msg = Vec::with_capacity(len);
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&error.to_ne_bytes());
    msg.extend_from_slice(&unique.to_ne_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// `cuse_init_out` + the DEVNAME string, answering CUSE_INIT.
fn build_init_payload(devname: &str, dev_major: u32, dev_minor: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(72 + devname.len() + 9);
    payload.extend_from_slice(&FUSE_KERNEL_VERSION.to_ne_bytes());
    payload.extend_from_slice(&FUSE_KERNEL_MINOR_VERSION.to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes()); // unused
    payload.extend_from_slice(&CUSE_UNRESTRICTED_IOCTL.to_ne_bytes());
    payload.extend_from_slice(&(MAX_WRITE as u32).to_ne_bytes()); // max_read
    payload.extend_from_slice(&(MAX_WRITE as u32).to_ne_bytes()); // max_write
    payload.extend_from_slice(&dev_major.to_ne_bytes());
    payload.extend_from_slice(&dev_minor.to_ne_bytes());
    payload.extend_from_slice(&[0u8; 40]); // spare
    payload.extend_from_slice(b"DEVNAME=");
    payload.extend_from_slice(devname.as_bytes());
    payload.push(0);
    payload
}

/// `fuse_open_out` for a claimed slot.
fn build_open_payload(slot: SlotId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&(slot as u64).to_ne_bytes());
    payload.extend_from_slice(&(FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE).to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes());
    payload
}

/// `fuse_ioctl_out` + output data for a completed ioctl.
fn build_ioctl_done_payload(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + data.len());
    payload.extend_from_slice(&0i32.to_ne_bytes()); // result
    payload.extend_from_slice(&0u32.to_ne_bytes()); // flags
    payload.extend_from_slice(&0u32.to_ne_bytes()); // in_iovs
    payload.extend_from_slice(&0u32.to_ne_bytes()); // out_iovs
    payload.extend_from_slice(data);
    payload
}

/// `fuse_ioctl_out` + one input and one output iovec asking the kernel to
/// stage the argument ranges and re-send the ioctl.
fn build_ioctl_retry_payload(arg: u64, in_size: usize, out_size: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + 32);
    payload.extend_from_slice(&0i32.to_ne_bytes()); // result
    payload.extend_from_slice(&FUSE_IOCTL_RETRY.to_ne_bytes());
    payload.extend_from_slice(&1u32.to_ne_bytes()); // in_iovs
    payload.extend_from_slice(&1u32.to_ne_bytes()); // out_iovs
    let in_base = if in_size > 0 { arg } else { 0 };
    payload.extend_from_slice(&in_base.to_ne_bytes());
    payload.extend_from_slice(&(in_size as u64).to_ne_bytes());
    let out_base = if out_size > 0 { arg } else { 0 };
    payload.extend_from_slice(&out_base.to_ne_bytes());
    payload.extend_from_slice(&(out_size as u64).to_ne_bytes());
    payload
}

/// Unsolicited poll wake-up: notify header (unique 0) + the kernel handle.
fn build_poll_notify(kh: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(24);
    msg.extend_from_slice(&24u32.to_ne_bytes());
    msg.extend_from_slice(&FUSE_NOTIFY_POLL.to_ne_bytes());
    msg.extend_from_slice(&0u64.to_ne_bytes());
    msg.extend_from_slice(&kh.to_ne_bytes());
    msg
}

// ── Session ──

struct Shared<T: AudioTransport> {
    dev: Arc<File>,
    engine: Arc<DspEngine<T>>,
}

impl<T: AudioTransport> Shared<T> {
    fn send(&self, msg: &[u8]) {
        if let Err(e) = (&*self.dev).write_all(msg) {
            warn!("reply write failed: {e}");
        }
    }

    fn reply_err(&self, unique: u64, errno: i32) {
        self.send(&build_reply(unique, -errno, &[]));
    }

    fn reply_ok(&self, unique: u64, payload: &[u8]) {
        self.send(&build_reply(unique, 0, payload));
    }
}

/// Poll interest registered with the kernel: completing it writes the
/// wake-up notification for the stored kernel handle.
struct KernelPollHandle {
    dev: Arc<File>,
    kh: u64,
}

impl PollHandle for KernelPollHandle {
    fn complete(self: Box<Self>) {
        if let Err(e) = (&*self.dev).write_all(&build_poll_notify(self.kh)) {
            warn!("poll notify write failed: {e}");
        }
    }
}

pub struct CuseSession<T: AudioTransport> {
    shared: Arc<Shared<T>>,
    devname: String,
    dev_major: u32,
    dev_minor: u32,
}

impl<T: AudioTransport + 'static> CuseSession<T> {
    /// Open `/dev/cuse` and prepare a session. The device node appears once
    /// the kernel's INIT request has been answered inside [`run`].
    pub fn create(config: &Config, engine: Arc<DspEngine<T>>) -> std::io::Result<Self> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/cuse")?;
        Ok(CuseSession {
            shared: Arc::new(Shared {
                dev: Arc::new(dev),
                engine,
            }),
            devname: config.device_name.clone(),
            dev_major: config.major,
            dev_minor: config.minor,
        })
    }

    /// Serve requests until the device is destroyed or `running` clears.
    pub fn run(self, running: &AtomicBool) -> std::io::Result<()> {
        let mut buf = vec![0u8; BUFFER_SIZE];

        while running.load(Ordering::SeqCst) {
            let n = match (&*self.shared.dev).read(&mut buf) {
                Ok(n) => n,
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    // The connection is gone once the device is destroyed.
                    Some(libc::ENODEV) => break,
                    _ => return Err(e),
                },
            };

            let Some(header) = InHeader::parse(&buf[..n]) else {
                warn!("runt request ({n} bytes), dropped");
                continue;
            };

            match header.opcode {
                CUSE_INIT => self.handle_init(&header, &buf[..n]),
                // Interrupt carries no reply; in-flight operations finish
                // on their own.
                FUSE_INTERRUPT => {}
                FUSE_DESTROY => {
                    self.shared.reply_ok(header.unique, &[]);
                    break;
                }
                _ => {
                    let shared = self.shared.clone();
                    let request = buf[..n].to_vec();
                    thread::spawn(move || handle_request(shared, request));
                }
            }
        }
        Ok(())
    }

    fn handle_init(&self, header: &InHeader, request: &[u8]) {
        let body = &request[IN_HEADER_LEN..];
        let (major, minor) = (
            get_u32(body, 0).unwrap_or(0),
            get_u32(body, 4).unwrap_or(0),
        );
        debug!("CUSE init: kernel protocol {major}.{minor}");
        if major < FUSE_KERNEL_VERSION {
            error!("kernel protocol {major}.{minor} is too old");
            self.shared.reply_err(header.unique, libc::EPROTO);
            return;
        }
        let payload = build_init_payload(&self.devname, self.dev_major, self.dev_minor);
        self.shared.reply_ok(header.unique, &payload);
    }
}

// ── Request dispatch (one thread per request) ──

fn handle_request<T: AudioTransport>(shared: Arc<Shared<T>>, request: Vec<u8>) {
    let Some(header) = InHeader::parse(&request) else {
        return;
    };
    let body = &request[IN_HEADER_LEN..];

    match header.opcode {
        FUSE_OPEN => handle_open(&shared, &header, body),
        FUSE_WRITE => handle_write(&shared, &header, body),
        FUSE_IOCTL => handle_ioctl(&shared, &header, body),
        FUSE_POLL => handle_poll(&shared, &header, body),
        FUSE_RELEASE => {
            let slot = get_u64(body, 0).unwrap_or(0) as SlotId;
            shared.engine.release(slot);
            shared.reply_ok(header.unique, &[]);
        }
        FUSE_FLUSH => shared.reply_ok(header.unique, &[]),
        opcode => {
            debug!("unsupported opcode {opcode}");
            shared.reply_err(header.unique, libc::ENOSYS);
        }
    }
}

fn handle_open<T: AudioTransport>(shared: &Shared<T>, header: &InHeader, body: &[u8]) {
    let Some(flags) = get_u32(body, 0) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };
    let mode = match flags as i32 & libc::O_ACCMODE {
        libc::O_WRONLY => AccessMode::WriteOnly,
        libc::O_RDONLY => AccessMode::ReadOnly,
        _ => AccessMode::ReadWrite,
    };
    let client = ClientInfo {
        pid: header.pid,
        name: process_name(header.pid),
    };
    match shared.engine.open(mode, client) {
        Ok(slot) => shared.reply_ok(header.unique, &build_open_payload(slot)),
        Err(e) => shared.reply_err(header.unique, e.errno()),
    }
}

fn handle_write<T: AudioTransport>(shared: &Shared<T>, header: &InHeader, body: &[u8]) {
    // fuse_write_in: fh, offset, size, write_flags, lock_owner, flags, pad
    let (Some(fh), Some(size), Some(flags)) = (
        get_u64(body, 0),
        get_u32(body, 16),
        get_u32(body, 32),
    ) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };
    let data_start = 40;
    let data_end = data_start + size as usize;
    let Some(data) = body.get(data_start..data_end) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };

    let nonblock = flags as i32 & libc::O_NONBLOCK != 0;
    match shared.engine.write(fh as SlotId, data, nonblock) {
        Ok(accepted) => {
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&(accepted as u32).to_ne_bytes());
            payload.extend_from_slice(&0u32.to_ne_bytes());
            shared.reply_ok(header.unique, &payload);
        }
        Err(e) => shared.reply_err(header.unique, e.errno()),
    }
}

fn handle_ioctl<T: AudioTransport>(shared: &Shared<T>, header: &InHeader, body: &[u8]) {
    // fuse_ioctl_in: fh, flags, cmd, arg, in_size, out_size
    let (Some(fh), Some(cmd), Some(arg), Some(in_size), Some(out_size)) = (
        get_u64(body, 0),
        get_u32(body, 12),
        get_u64(body, 16),
        get_u32(body, 24),
        get_u32(body, 28),
    ) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };
    let Some(input) = body.get(32..32 + in_size as usize) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };

    let args = IoctlArgs {
        input,
        output_capacity: out_size as usize,
    };
    match shared.engine.ioctl(fh as SlotId, cmd, &args) {
        Ok(IoctlReply::Done(data)) => {
            shared.reply_ok(header.unique, &build_ioctl_done_payload(&data));
        }
        Ok(IoctlReply::Retry { in_size, out_size }) => {
            shared.reply_ok(
                header.unique,
                &build_ioctl_retry_payload(arg, in_size, out_size),
            );
        }
        Err(e) => shared.reply_err(header.unique, e.errno()),
    }
}

fn handle_poll<T: AudioTransport>(shared: &Shared<T>, header: &InHeader, body: &[u8]) {
    // fuse_poll_in: fh, kh, flags, events
    let (Some(fh), Some(kh), Some(flags)) = (
        get_u64(body, 0),
        get_u64(body, 8),
        get_u32(body, 16),
    ) else {
        shared.reply_err(header.unique, libc::EINVAL);
        return;
    };

    let handle: Option<Box<dyn PollHandle>> = if flags & FUSE_POLL_SCHEDULE_NOTIFY != 0 {
        Some(Box::new(KernelPollHandle {
            dev: shared.dev.clone(),
            kh,
        }))
    } else {
        None
    };

    let revents = shared.engine.poll(fh as SlotId, handle);
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&revents.to_ne_bytes());
    payload.extend_from_slice(&0u32.to_ne_bytes());
    shared.reply_ok(header.unique, &payload);
}

/// Resolve a client pid to its process name, for slot diagnostics.
fn process_name(pid: u32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "unknown".into())
}

// ── Daemonization ──

/// Fork into the background: the parent exits once the child owns its own
/// session, and the child's stdio is pointed at /dev/null.
pub fn daemonize() -> std::io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}
