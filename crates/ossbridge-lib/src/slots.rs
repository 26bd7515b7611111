//! Stream slot table — per-open-file-handle state and its locking.
//!
//! Every open of the emulated device claims one slot; the table holds a
//! fixed number of them. Allocation and release are serialized by one
//! global lock, while each slot carries its own mutex for the state the
//! asynchronous notification path touches. The slot cell is `Arc`-shared
//! so the transport's write-space callback can reach it without going
//! through the table.

use std::sync::{Arc, Mutex};

use crate::transport::StreamId;

/// Compile-time maximum of concurrently open device handles.
pub const MAX_STREAMS: usize = 8;

/// Hardware defaults established at startup; every fresh slot starts from
/// these.
#[derive(Debug, Clone, Copy)]
pub struct HwDefaults {
    pub sample_rate: u32,
    pub fragsize: u32,
    pub frags: u32,
}

/// Identity of the client process that opened the handle. Diagnostic only.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub pid: u32,
    pub name: String,
}

/// Whether the slot has committed to a hardware stream yet.
///
/// A slot binds lazily on its first write, so format ioctls arriving after
/// open still influence the stream parameters. Reset returns a bound slot
/// to `Unbound`; the next write binds again with the then-current geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Bound(StreamId),
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        matches!(self, Binding::Bound(_))
    }

    pub fn stream(&self) -> Option<StreamId> {
        match self {
            Binding::Unbound => None,
            Binding::Bound(id) => Some(*id),
        }
    }
}

/// A caller's registered interest in poll readiness.
///
/// Completing the handle wakes the poller; dropping it un-completed is the
/// destroy path (a newer poll replaced it, or the handle was released).
pub trait PollHandle: Send {
    fn complete(self: Box<Self>);
}

/// Per-slot mutable state. Lives behind the slot's mutex.
pub struct SlotState {
    pub active: bool,
    pub binding: Binding,
    pub sample_rate: u32,
    pub channels: u8,
    pub bits: u8,
    /// Fragment size in bytes; power of two, at least 512.
    pub fragsize: u32,
    /// Fragment count; power of two, at least 2.
    pub frags: u32,
    /// Monotonic count of bytes submitted to hardware.
    pub write_cnt: u64,
    pub nonblock: bool,
    /// Sticky: once set, every further write fails until release.
    pub error: bool,
    /// At most one pending poll handle per slot.
    pub poll_handle: Option<Box<dyn PollHandle>>,
    pub client: ClientInfo,
}

impl SlotState {
    fn idle() -> Self {
        SlotState {
            active: false,
            binding: Binding::Unbound,
            sample_rate: 0,
            channels: 0,
            bits: 0,
            fragsize: 0,
            frags: 0,
            write_cnt: 0,
            nonblock: false,
            error: false,
            poll_handle: None,
            client: ClientInfo::default(),
        }
    }

    fn seed(&mut self, defaults: &HwDefaults, client: ClientInfo) {
        self.active = true;
        self.binding = Binding::Unbound;
        self.sample_rate = defaults.sample_rate;
        self.channels = 2;
        self.bits = 16;
        self.fragsize = defaults.fragsize;
        self.frags = defaults.frags;
        self.write_cnt = 0;
        self.nonblock = false;
        self.error = false;
        self.poll_handle = None;
        self.client = client;
    }

    /// Bytes per sample frame for the negotiated format.
    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits) / 8
    }

    /// Total buffer capacity in bytes (`fragsize * frags`).
    pub fn buffer_size(&self) -> u32 {
        self.fragsize * self.frags
    }
}

/// Index of a claimed slot; doubles as the kernel file-handle value.
pub type SlotId = usize;

/// Fixed-capacity registry of stream slots.
pub struct SlotTable {
    slots: Vec<Arc<Mutex<SlotState>>>,
    /// Serializes allocation/release scans across all slots.
    alloc: Mutex<()>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STREAMS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SlotTable {
            slots: (0..capacity)
                .map(|_| Arc::new(Mutex::new(SlotState::idle())))
                .collect(),
            alloc: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot, seed it from the hardware defaults, and
    /// return its index. `None` when every slot is active (device busy).
    pub fn acquire(&self, defaults: &HwDefaults, client: ClientInfo) -> Option<SlotId> {
        let _guard = self.alloc.lock().expect("slot alloc lock poisoned");
        for (id, slot) in self.slots.iter().enumerate() {
            let mut state = slot.lock().expect("slot lock poisoned");
            if !state.active {
                state.seed(defaults, client);
                return Some(id);
            }
        }
        None
    }

    /// Shared cell for a slot. The engine hands clones of this to the
    /// transport's notification callback.
    pub fn slot(&self, id: SlotId) -> Arc<Mutex<SlotState>> {
        self.slots[id].clone()
    }

    /// Return a slot to the free pool, dropping any pending poll handle.
    ///
    /// The caller is responsible for closing a bound hardware stream first;
    /// the table does not talk to the transport.
    pub fn clear(&self, id: SlotId) {
        let _guard = self.alloc.lock().expect("slot alloc lock poisoned");
        let mut state = self.slots[id].lock().expect("slot lock poisoned");
        *state = SlotState::idle();
    }

    /// Number of currently active slots.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().expect("slot lock poisoned").active)
            .count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DEFAULTS: HwDefaults = HwDefaults {
        sample_rate: 48_000,
        fragsize: 4096,
        frags: 4,
    };

    fn client() -> ClientInfo {
        ClientInfo {
            pid: 1234,
            name: "aplay".into(),
        }
    }

    struct FlagHandle(Arc<AtomicBool>);

    impl PollHandle for FlagHandle {
        fn complete(self: Box<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn acquire_seeds_defaults() {
        let table = SlotTable::new();
        let id = table.acquire(&DEFAULTS, client()).unwrap();
        let cell = table.slot(id);
        let state = cell.lock().unwrap();
        assert!(state.active);
        assert_eq!(state.binding, Binding::Unbound);
        assert_eq!(state.sample_rate, 48_000);
        assert_eq!(state.channels, 2);
        assert_eq!(state.bits, 16);
        assert_eq!(state.fragsize, 4096);
        assert_eq!(state.frags, 4);
        assert_eq!(state.write_cnt, 0);
        assert!(!state.nonblock);
        assert!(!state.error);
        assert_eq!(state.client.name, "aplay");
    }

    #[test]
    fn acquire_beyond_capacity_fails() {
        let table = SlotTable::with_capacity(3);
        for _ in 0..3 {
            assert!(table.acquire(&DEFAULTS, client()).is_some());
        }
        assert!(table.acquire(&DEFAULTS, client()).is_none());
        assert_eq!(table.active_count(), 3);
    }

    #[test]
    fn clear_frees_exactly_one() {
        let table = SlotTable::with_capacity(2);
        let a = table.acquire(&DEFAULTS, client()).unwrap();
        let _b = table.acquire(&DEFAULTS, client()).unwrap();
        assert!(table.acquire(&DEFAULTS, client()).is_none());

        table.clear(a);
        let again = table.acquire(&DEFAULTS, client()).unwrap();
        assert_eq!(again, a, "cleared slot should be reused first");
        assert!(table.acquire(&DEFAULTS, client()).is_none());
    }

    #[test]
    fn clear_drops_pending_poll_handle_without_completing() {
        let completed = Arc::new(AtomicBool::new(false));
        let table = SlotTable::new();
        let id = table.acquire(&DEFAULTS, client()).unwrap();
        {
            let cell = table.slot(id);
            cell.lock().unwrap().poll_handle = Some(Box::new(FlagHandle(completed.clone())));
        }
        table.clear(id);
        assert!(
            !completed.load(Ordering::SeqCst),
            "destroy path must not complete the handle"
        );
        assert!(table.slot(id).lock().unwrap().poll_handle.is_none());
    }

    #[test]
    fn seed_resets_error_and_counters() {
        let table = SlotTable::with_capacity(1);
        let id = table.acquire(&DEFAULTS, client()).unwrap();
        {
            let cell = table.slot(id);
            let mut state = cell.lock().unwrap();
            state.error = true;
            state.write_cnt = 999;
            state.nonblock = true;
        }
        table.clear(id);
        let id2 = table.acquire(&DEFAULTS, client()).unwrap();
        assert_eq!(id2, id);
        let cell = table.slot(id2);
        let state = cell.lock().unwrap();
        assert!(!state.error);
        assert_eq!(state.write_cnt, 0);
        assert!(!state.nonblock);
    }

    #[test]
    fn frame_and_buffer_size() {
        let table = SlotTable::new();
        let id = table.acquire(&DEFAULTS, client()).unwrap();
        let cell = table.slot(id);
        let state = cell.lock().unwrap();
        assert_eq!(state.frame_size(), 4); // stereo 16-bit
        assert_eq!(state.buffer_size(), 16384);
    }

    #[test]
    fn binding_accessors() {
        assert!(!Binding::Unbound.is_bound());
        assert_eq!(Binding::Unbound.stream(), None);
        assert!(Binding::Bound(3).is_bound());
        assert_eq!(Binding::Bound(3).stream(), Some(3));
    }
}
