//! Shared memory management for client-server communication.
//!
//! This module handles creation, attachment, and layout of the POSIX shared
//! memory region used for IPC between the client process and the key-value
//! server process. The region is organized as:
//!
//! ```text
//! | RegionHeader | RingHeader + descriptors | thread 0 window | ... | thread N-1 window |
//! ```
//!
//! The client creates the region once at startup; the server attaches to it
//! by name. Both sides address completion slots by byte offset from the
//! region base, so every offset that crosses the boundary is validated here.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::protocol::{
    CompletionSlot, RegionHeader, RequestDescriptor, RingHeader, SyncStrategy,
    DEFAULT_CLIENT_THREADS, DEFAULT_RING_CAPACITY, DEFAULT_WINDOW, MAX_CLIENT_THREADS, PAGE_SIZE,
    SLOT_SIZE,
};
use crate::ring::{self, RequestRing};

/// Error type for shared memory operations
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("failed to create shared memory: {0}")]
    CreateFailed(io::Error),
    #[error("failed to open shared memory: {0}")]
    OpenFailed(io::Error),
    #[error("failed to set shared memory size: {0}")]
    TruncateFailed(io::Error),
    #[error("failed to map shared memory: {0}")]
    MmapFailed(io::Error),
    #[error("invalid shared region magic number")]
    InvalidMagic,
    #[error("shared region version mismatch")]
    VersionMismatch,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to initialize synchronization primitives: {0}")]
    SyncInit(io::Error),
    #[error("result offset {offset} outside the completion area (region size {limit})")]
    OutOfRangeOffset { offset: u32, limit: usize },
}

/// Geometry of a shared region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Ring capacity (number of descriptors, must be a power of 2)
    pub ring_capacity: u32,
    /// Number of client submission threads (one completion window each)
    pub client_threads: u32,
    /// Per-thread window size (completion slots per thread)
    pub window: u32,
    /// Ring synchronization strategy
    pub strategy: SyncStrategy,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            client_threads: DEFAULT_CLIENT_THREADS,
            window: DEFAULT_WINDOW,
            strategy: SyncStrategy::Spin,
        }
    }
}

impl RegionConfig {
    /// Validate the configuration. Violations here are construction-time
    /// errors; nothing past this point re-checks capacity shape.
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(ShmError::InvalidConfig(format!(
                "ring_capacity must be a power of 2 (got {})",
                self.ring_capacity
            )));
        }
        if self.client_threads == 0 || self.client_threads > MAX_CLIENT_THREADS {
            return Err(ShmError::InvalidConfig(format!(
                "client_threads must be between 1 and {}",
                MAX_CLIENT_THREADS
            )));
        }
        if self.window == 0 {
            return Err(ShmError::InvalidConfig("window must be > 0".to_string()));
        }
        Ok(())
    }

    /// Bytes occupied by the ring header plus its descriptor array
    pub fn ring_bytes(&self) -> usize {
        std::mem::size_of::<RingHeader>() + SLOT_SIZE * self.ring_capacity as usize
    }

    /// Byte offset of the first completion slot
    pub fn completions_offset(&self) -> usize {
        PAGE_SIZE + self.ring_bytes()
    }

    /// Total number of completion slots
    pub fn completion_slots(&self) -> usize {
        self.client_threads as usize * self.window as usize
    }

    /// Byte offset of the completion slot for `thread`'s request number
    /// `seq` (the slot is reused every `window` requests).
    pub fn completion_offset(&self, thread: u32, seq: u64) -> u32 {
        debug_assert!(thread < self.client_threads);
        let slot = thread as u64 * self.window as u64 + seq % self.window as u64;
        (self.completions_offset() as u64 + slot * SLOT_SIZE as u64) as u32
    }

    /// Total shared region size
    pub fn total_size(&self) -> usize {
        self.completions_offset() + self.completion_slots() * SLOT_SIZE
    }
}

/// Shared memory region handle.
/// Used by both the client (creator) and the server (attacher).
pub struct SharedRegion {
    /// Shared memory object name
    name: String,
    /// Base pointer to the mapped region
    base_ptr: NonNull<u8>,
    /// Total size of the mapping
    total_size: usize,
    /// Whether this instance created (and will unlink) the shared memory
    is_owner: bool,
    /// Geometry
    config: RegionConfig,
}

// SAFETY: the region is process-shared by design; every field reachable
// through the handle is either immutable after creation or accessed through
// atomics / the ring protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new shared region (client side).
    ///
    /// The object is created exclusively, sized, mapped, and initialized:
    /// header first, then the ring's synchronization primitives for the
    /// configured strategy. Cursors and completion slots rely on the fresh
    /// object being zero-filled by the kernel.
    pub fn create(name: &str, config: RegionConfig) -> Result<Self, ShmError> {
        config.validate()?;

        let shm_name = Self::normalize_name(name);
        let c_name = CString::new(shm_name.as_str())
            .map_err(|_| ShmError::InvalidConfig("invalid shared memory name".to_string()))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::CreateFailed(io::Error::last_os_error()));
        }

        let total_size = config.total_size();

        let ret = unsafe { libc::ftruncate(fd, total_size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::TruncateFailed(err));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // mmap keeps its own reference to the object
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(ShmError::MmapFailed(io::Error::last_os_error()));
        }

        let base_ptr =
            NonNull::new(ptr as *mut u8).expect("mmap returned null pointer but not MAP_FAILED");

        let region = Self {
            name: shm_name,
            base_ptr,
            total_size,
            is_owner: true,
            config,
        };

        unsafe {
            std::ptr::write(
                region.base_ptr.as_ptr() as *mut RegionHeader,
                RegionHeader::init(
                    region.config.ring_capacity,
                    region.config.client_threads,
                    region.config.window,
                    region.config.strategy,
                ),
            );
        }

        // The blocking strategies keep pthread/semaphore state inside the
        // ring header; it must be initialized exactly once, by the creator.
        ring::init_sync_area(
            region.ring_header(),
            region.config.strategy,
            region.config.ring_capacity,
        )?;

        Ok(region)
    }

    /// Attach to an existing shared region (server side).
    ///
    /// Maps the header page first to validate the magic number and read the
    /// geometry, then remaps the full region.
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        let shm_name = Self::normalize_name(name);
        let c_name = CString::new(shm_name.as_str())
            .map_err(|_| ShmError::InvalidConfig("invalid shared memory name".to_string()))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::OpenFailed(io::Error::last_os_error()));
        }

        let header_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if header_ptr == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(ShmError::MmapFailed(io::Error::last_os_error()));
        }

        let geometry = unsafe {
            let header = &*(header_ptr as *const RegionHeader);
            if header.magic != crate::protocol::REGION_MAGIC {
                libc::munmap(header_ptr, PAGE_SIZE);
                libc::close(fd);
                return Err(ShmError::InvalidMagic);
            }
            if header.version != crate::protocol::REGION_VERSION {
                libc::munmap(header_ptr, PAGE_SIZE);
                libc::close(fd);
                return Err(ShmError::VersionMismatch);
            }
            (
                header.ring_capacity,
                header.client_threads,
                header.window,
                header.sync_strategy,
            )
        };

        unsafe { libc::munmap(header_ptr, PAGE_SIZE) };

        let (ring_capacity, client_threads, window, strategy_raw) = geometry;
        let strategy = SyncStrategy::from_raw(strategy_raw).ok_or_else(|| {
            ShmError::InvalidConfig(format!("unknown sync strategy tag {}", strategy_raw))
        })?;

        let config = RegionConfig {
            ring_capacity,
            client_threads,
            window,
            strategy,
        };
        config.validate()?;
        let total_size = config.total_size();

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::MmapFailed(io::Error::last_os_error()));
        }

        let base_ptr =
            NonNull::new(ptr as *mut u8).expect("mmap returned null pointer but not MAP_FAILED");

        Ok(Self {
            name: shm_name,
            base_ptr,
            total_size,
            is_owner: false,
            config,
        })
    }

    /// Try to attach to an existing region.
    /// Returns `Ok(None)` if the object does not exist yet.
    pub fn try_attach(name: &str) -> Result<Option<Self>, ShmError> {
        match Self::attach(name) {
            Ok(region) => Ok(Some(region)),
            Err(ShmError::OpenFailed(e)) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Normalize a shared memory name (ensure it starts with '/')
    fn normalize_name(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Reference to the region header
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the header page is mapped for the lifetime of self and was
        // initialized by create() / validated by attach().
        unsafe { &*(self.base_ptr.as_ptr() as *const RegionHeader) }
    }

    /// Reference to the ring header
    pub(crate) fn ring_header(&self) -> &RingHeader {
        // SAFETY: the ring header lives directly after the header page,
        // inside the mapping, and is only mutated through atomics or the
        // strategy primitives stored in its sync area.
        unsafe { &*(self.base_ptr.as_ptr().add(PAGE_SIZE) as *const RingHeader) }
    }

    /// Pointer to the ring's descriptor array
    pub(crate) fn ring_slots(&self) -> *mut RequestDescriptor {
        let offset = PAGE_SIZE + std::mem::size_of::<RingHeader>();
        unsafe { self.base_ptr.as_ptr().add(offset) as *mut RequestDescriptor }
    }

    /// Construct a ring handle over this region
    pub fn ring(&self) -> RequestRing<'_> {
        RequestRing::new(self)
    }

    /// Check if the server has attached and finished initializing
    pub fn is_server_ready(&self) -> bool {
        self.header().ready_flag.load(Ordering::Acquire) == 1
    }

    /// Mark the server as ready (server side)
    pub fn set_server_ready(&self, pid: u32) {
        self.header().server_pid.store(pid, Ordering::Release);
        self.header().ready_flag.store(1, Ordering::Release);
    }

    /// Request shutdown. Waiters blocked inside ring operations are woken by
    /// `RequestRing::wake_all`, which callers should invoke right after this.
    pub fn request_shutdown(&self) {
        self.header().shutdown_flag.store(1, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.header().shutdown_flag.load(Ordering::Acquire) == 1
    }

    /// Look up the completion slot at a descriptor's `result_offset`.
    ///
    /// Offsets that fall outside the completion area, or that are not
    /// aligned to a slot boundary, are protocol violations and rejected.
    pub fn completion_slot(&self, offset: u32) -> Result<&CompletionSlot, ShmError> {
        let off = offset as usize;
        let start = self.config.completions_offset();
        let end = self.total_size;
        if off < start || off + SLOT_SIZE > end || (off - start) % SLOT_SIZE != 0 {
            return Err(ShmError::OutOfRangeOffset {
                offset,
                limit: self.total_size,
            });
        }
        // SAFETY: bounds and alignment were checked above; CompletionSlot is
        // all-atomic, so shared references are sound across processes.
        Ok(unsafe { &*(self.base_ptr.as_ptr().add(off) as *const CompletionSlot) })
    }

    /// Byte offset of the completion slot for `thread`'s request `seq`
    pub fn completion_offset(&self, thread: u32, seq: u64) -> u32 {
        self.config.completion_offset(thread, seq)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base_ptr.as_ptr() as *mut libc::c_void, self.total_size);
        }

        if self.is_owner {
            if let Ok(c_name) = CString::new(self.name.as_str()) {
                unsafe {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}
