//! Protocol definitions for client-server communication via shared memory.
//!
//! This module defines the data structures both processes map at fixed
//! offsets: the region header, the ring header with its cache-line-isolated
//! cursors, the request descriptors travelling through the ring, and the
//! completion slots the server writes results into.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number for shared region validation ("SHMKVREQ")
pub const REGION_MAGIC: u64 = 0x53484D4B56524551;

/// Protocol version
pub const REGION_VERSION: u32 = 1;

/// Size of the region header page
pub const PAGE_SIZE: usize = 4096;

/// Serialized size of one request descriptor / completion slot
pub const SLOT_SIZE: usize = 64;

/// Bytes reserved in the ring header for process-shared sync primitives
pub const SYNC_AREA_SIZE: usize = 192;

/// Default ring capacity (number of descriptors, must be a power of 2)
pub const DEFAULT_RING_CAPACITY: u32 = 1024;

/// Default number of client submission threads
pub const DEFAULT_CLIENT_THREADS: u32 = 4;

/// Default per-thread window size (max in-flight requests)
pub const DEFAULT_WINDOW: u32 = 1;

/// Default number of server worker threads
pub const DEFAULT_SERVER_WORKERS: usize = 1;

/// Default key-value table bucket count
pub const DEFAULT_TABLE_BUCKETS: usize = 1000;

/// Maximum number of client submission threads
pub const MAX_CLIENT_THREADS: u32 = 128;

/// Server startup timeout in milliseconds
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// `ready` flag states for completion slots
pub const NOT_READY: u32 = 0;
pub const READY: u32 = 1;

/// Completion status codes
pub const STATUS_OK: u32 = 0;
/// The descriptor carried an operation code the server does not understand.
pub const STATUS_BAD_OP: u32 = 1;

/// Operation types for requests
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Insert or overwrite a key
    Put = 0,
    /// Look up a key (absent keys yield the zero sentinel)
    Get = 1,
}

impl OpKind {
    /// Decode a raw operation code. Unknown codes are kept raw so the server
    /// can answer them with `STATUS_BAD_OP` instead of dropping the request.
    pub fn from_raw(v: u32) -> Option<OpKind> {
        match v {
            0 => Some(OpKind::Put),
            1 => Some(OpKind::Get),
            _ => None,
        }
    }
}

/// Ring synchronization strategy, chosen at region creation and recorded in
/// the region header so both processes drive the ring the same way.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// Lock-free claim-then-publish with CAS on the head cursors
    Spin = 0,
    /// One process-shared mutex plus not-full/not-empty condition variables
    Mutex = 1,
    /// Counting semaphores for free/filled slots, small per-side claim locks
    Semaphore = 2,
}

impl SyncStrategy {
    pub fn from_raw(v: u32) -> Option<SyncStrategy> {
        match v {
            0 => Some(SyncStrategy::Spin),
            1 => Some(SyncStrategy::Mutex),
            2 => Some(SyncStrategy::Semaphore),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<SyncStrategy> {
        match name {
            "spin" => Some(SyncStrategy::Spin),
            "mutex" => Some(SyncStrategy::Mutex),
            "semaphore" => Some(SyncStrategy::Semaphore),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncStrategy::Spin => "spin",
            SyncStrategy::Mutex => "mutex",
            SyncStrategy::Semaphore => "semaphore",
        }
    }
}

/// Region header at the start of shared memory.
/// This structure is placed at offset 0 and occupies the first page.
#[repr(C, align(4096))]
pub struct RegionHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Protocol version
    pub version: u32,
    /// Server process ID (0 until the server attaches)
    pub server_pid: AtomicU32,
    /// Ready flag (0 = server not ready, 1 = ready)
    pub ready_flag: AtomicU32,
    /// Shutdown flag (0 = running, 1 = shutdown requested)
    pub shutdown_flag: AtomicU32,
    /// Ring capacity (number of descriptors)
    pub ring_capacity: u32,
    /// Number of client submission threads (completion windows)
    pub client_threads: u32,
    /// Per-thread window size
    pub window: u32,
    /// Ring synchronization strategy (`SyncStrategy` as u32)
    pub sync_strategy: u32,
    /// Reserved for future use
    _reserved: [u8; 4056], // Pad to 4096 bytes
}

impl RegionHeader {
    /// Initialize a new region header
    pub fn init(
        ring_capacity: u32,
        client_threads: u32,
        window: u32,
        strategy: SyncStrategy,
    ) -> Self {
        Self {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            server_pid: AtomicU32::new(0),
            ready_flag: AtomicU32::new(0),
            shutdown_flag: AtomicU32::new(0),
            ring_capacity,
            client_threads,
            window,
            sync_strategy: strategy as u32,
            _reserved: [0; 4056],
        }
    }

    /// Validate the header of an attached region
    pub fn validate(&self) -> bool {
        self.magic == REGION_MAGIC && self.version == REGION_VERSION
    }
}

/// One ring cursor, isolated on its own cache line so producer and consumer
/// sides never invalidate each other's lines.
#[repr(C, align(64))]
pub struct PaddedCursor {
    pub raw: AtomicU32,
    _pad: [u8; 60],
}

/// Raw storage for the process-shared blocking primitives of the active
/// synchronization strategy. The bytes are interpreted by the strategy
/// modules; the spin strategy leaves them untouched.
#[repr(C, align(64))]
pub struct SyncArea {
    bytes: UnsafeCell<[u8; SYNC_AREA_SIZE]>,
}

impl SyncArea {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.bytes.get() as *mut u8
    }
}

/// Ring header, laid out directly after the region header. The descriptor
/// array of `ring_capacity` slots follows immediately after this structure.
#[repr(C, align(64))]
pub struct RingHeader {
    /// Last slot whose producer write is fully visible
    pub prod_tail: PaddedCursor,
    /// Next slot a producer will claim; slots between prod_tail and
    /// prod_head are still being copied
    pub prod_head: PaddedCursor,
    /// Last slot fully drained by a consumer; producers may not write at or
    /// past this index minus capacity
    pub cons_tail: PaddedCursor,
    /// Next slot a consumer will claim
    pub cons_head: PaddedCursor,
    /// Strategy-owned blocking primitives
    pub sync: SyncArea,
}

/// Request descriptor: one ring entry, written by a client thread and
/// consumed by a server worker. Copied by value through the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct RequestDescriptor {
    /// Operation code (`OpKind` as u32)
    pub op: u32,
    pub key: u32,
    pub value: u32,
    /// Completion status; always 0 in requests, set by the server in results
    pub status: u32,
    /// Byte offset from the region base of the completion slot the server
    /// must write the result into
    pub result_offset: u32,
    /// Handshake flag; meaningful only in completion slots, kept here so the
    /// two layouts stay field-for-field identical
    pub ready: u32,
    _reserved: [u8; 40],
}

impl RequestDescriptor {
    pub fn put(key: u32, value: u32, result_offset: u32) -> Self {
        Self {
            op: OpKind::Put as u32,
            key,
            value,
            status: STATUS_OK,
            result_offset,
            ready: NOT_READY,
            _reserved: [0; 40],
        }
    }

    pub fn get(key: u32, result_offset: u32) -> Self {
        Self {
            op: OpKind::Get as u32,
            key,
            value: 0,
            status: STATUS_OK,
            result_offset,
            ready: NOT_READY,
            _reserved: [0; 40],
        }
    }

    pub fn op(&self) -> Option<OpKind> {
        OpKind::from_raw(self.op)
    }
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self {
            op: OpKind::Put as u32,
            key: 0,
            value: 0,
            status: STATUS_OK,
            result_offset: 0,
            ready: NOT_READY,
            _reserved: [0; 40],
        }
    }
}

/// A completed request as copied out of a completion slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub op: u32,
    pub key: u32,
    pub value: u32,
    pub status: u32,
}

/// Completion slot ("mailbox"): the same 64-byte layout as
/// `RequestDescriptor`, viewed with atomic fields because server and client
/// hand it back and forth through the `ready` flag. The server is the only
/// writer of the result fields, the client the only writer of the reset, so
/// no lock is needed beyond the flag's release/acquire pairing.
#[repr(C, align(64))]
pub struct CompletionSlot {
    pub op: AtomicU32,
    pub key: AtomicU32,
    pub value: AtomicU32,
    pub status: AtomicU32,
    _result_offset: AtomicU32,
    pub ready: AtomicU32,
    _reserved: [u8; 40],
}

impl CompletionSlot {
    /// Write a result into the slot and set the ready flag.
    ///
    /// The flag store uses release ordering so a client that observes
    /// `ready == READY` also observes the result fields. Returns `false`
    /// without touching the slot if the flag is still set from a previous
    /// completion, which means the protocol has desynchronized.
    pub fn publish(&self, op: u32, key: u32, value: u32, status: u32) -> bool {
        if self.ready.load(Ordering::Acquire) == READY {
            return false;
        }
        self.op.store(op, Ordering::Relaxed);
        self.key.store(key, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.status.store(status, Ordering::Relaxed);
        self.ready.store(READY, Ordering::Release);
        true
    }

    /// Copy the result out and reset the ready flag, returning the slot to
    /// the server for reuse. Returns `None` if no completion is pending.
    pub fn take(&self) -> Option<Completion> {
        if self.ready.load(Ordering::Acquire) != READY {
            return None;
        }
        let completion = Completion {
            op: self.op.load(Ordering::Relaxed),
            key: self.key.load(Ordering::Relaxed),
            value: self.value.load(Ordering::Relaxed),
            status: self.status.load(Ordering::Relaxed),
        };
        self.ready.store(NOT_READY, Ordering::Release);
        Some(completion)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == READY
    }
}

// Compile-time layout assertions
const _: () = assert!(std::mem::size_of::<RegionHeader>() == PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<PaddedCursor>() == 64);
const _: () = assert!(std::mem::size_of::<SyncArea>() == SYNC_AREA_SIZE);
const _: () = assert!(std::mem::size_of::<RingHeader>() == 4 * 64 + SYNC_AREA_SIZE);
const _: () = assert!(std::mem::size_of::<RequestDescriptor>() == SLOT_SIZE);
const _: () = assert!(std::mem::size_of::<CompletionSlot>() == SLOT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_header_size() {
        assert_eq!(std::mem::size_of::<RegionHeader>(), PAGE_SIZE);
    }

    #[test]
    fn test_slot_sizes_match() {
        assert_eq!(std::mem::size_of::<RequestDescriptor>(), SLOT_SIZE);
        assert_eq!(std::mem::size_of::<CompletionSlot>(), SLOT_SIZE);
    }

    #[test]
    fn test_op_kind_conversion() {
        assert_eq!(OpKind::from_raw(0), Some(OpKind::Put));
        assert_eq!(OpKind::from_raw(1), Some(OpKind::Get));
        assert_eq!(OpKind::from_raw(2), None);
        assert_eq!(OpKind::from_raw(999), None);
    }

    #[test]
    fn test_strategy_names() {
        for s in [SyncStrategy::Spin, SyncStrategy::Mutex, SyncStrategy::Semaphore] {
            assert_eq!(SyncStrategy::from_name(s.name()), Some(s));
            assert_eq!(SyncStrategy::from_raw(s as u32), Some(s));
        }
        assert_eq!(SyncStrategy::from_name("bogus"), None);
    }

    #[test]
    fn test_completion_slot_handshake() {
        let slot = CompletionSlot {
            op: AtomicU32::new(0),
            key: AtomicU32::new(0),
            value: AtomicU32::new(0),
            status: AtomicU32::new(0),
            _result_offset: AtomicU32::new(0),
            ready: AtomicU32::new(NOT_READY),
            _reserved: [0; 40],
        };

        // Nothing pending
        assert!(slot.take().is_none());

        // Publish then take
        assert!(slot.publish(OpKind::Get as u32, 7, 42, STATUS_OK));
        assert!(slot.is_ready());
        let c = slot.take().unwrap();
        assert_eq!(c.key, 7);
        assert_eq!(c.value, 42);
        assert_eq!(c.status, STATUS_OK);

        // Flag was reset by take
        assert!(!slot.is_ready());
        assert!(slot.take().is_none());

        // Publishing over an unconsumed completion is refused
        assert!(slot.publish(OpKind::Put as u32, 1, 1, STATUS_OK));
        assert!(!slot.publish(OpKind::Put as u32, 2, 2, STATUS_OK));
        let c = slot.take().unwrap();
        assert_eq!(c.key, 1);
    }
}
