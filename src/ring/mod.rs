//! Multi-producer/multi-consumer ring buffer over shared memory.
//!
//! The ring carries `RequestDescriptor`s from client submission threads to
//! server workers. Four free-running u32 cursors live in the shared
//! `RingHeader`, each on its own cache line:
//!
//! - `prod_head`: next slot a producer claims
//! - `prod_tail`: slots below this are fully written and visible
//! - `cons_head`: next slot a consumer claims
//! - `cons_tail`: slots below this are fully drained and reusable
//!
//! In circular order `cons_tail <= cons_head <= prod_tail <= prod_head`
//! always holds. The ring is empty when `cons_head == prod_tail` and full
//! when `prod_head - cons_tail == capacity`; free-running indices keep the
//! two states distinguishable with every slot usable.
//!
//! Blocking `submit`/`consume` share one external contract implemented by
//! three interchangeable strategies (see [`SyncStrategy`]): lock-free
//! claim-then-publish ([`spin`]), a process-shared mutex with condition
//! variables ([`locked`]), and counting semaphores ([`sema`]). The strategy
//! is recorded in the region header at creation time so both processes agree.

mod locked;
mod sema;
mod spin;

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::protocol::{RequestDescriptor, RingHeader, SyncStrategy};
use crate::shm::{SharedRegion, ShmError};

/// Error type for ring operations
#[derive(Debug, Error)]
pub enum RingError {
    /// Shutdown was requested while blocked (or before blocking)
    #[error("ring shut down")]
    Shutdown,
    /// A blocking primitive failed underneath us
    #[error("ring synchronization failure: {0}")]
    Sys(std::io::Error),
}

/// Initialize the strategy-owned primitives inside a freshly created ring
/// header. Must be called exactly once, by the region creator, before any
/// other process attaches.
pub(crate) fn init_sync_area(
    header: &RingHeader,
    strategy: SyncStrategy,
    capacity: u32,
) -> Result<(), ShmError> {
    match strategy {
        SyncStrategy::Spin => Ok(()),
        SyncStrategy::Mutex => locked::init(header.sync.as_mut_ptr()),
        SyncStrategy::Semaphore => sema::init(header.sync.as_mut_ptr(), capacity),
    }
}

/// Handle over the shared ring. Cheap to construct; every submission thread
/// and worker builds its own from the region.
pub struct RequestRing<'a> {
    pub(crate) prod_head: &'a AtomicU32,
    pub(crate) prod_tail: &'a AtomicU32,
    pub(crate) cons_head: &'a AtomicU32,
    pub(crate) cons_tail: &'a AtomicU32,
    /// Strategy-owned blocking primitives in the ring header
    pub(crate) sync: *mut u8,
    /// Descriptor array
    pub(crate) slots: *mut RequestDescriptor,
    pub(crate) capacity: u32,
    pub(crate) mask: u32,
    strategy: SyncStrategy,
    shutdown: &'a AtomicU32,
}

// SAFETY: all shared state behind the raw pointers is either atomic, guarded
// by the strategy's process-shared primitives, or owned by exactly one side
// of the claim/publish protocol at any time.
unsafe impl Send for RequestRing<'_> {}
unsafe impl Sync for RequestRing<'_> {}

impl<'a> RequestRing<'a> {
    /// Build a ring handle over a mapped region.
    pub fn new(region: &'a SharedRegion) -> Self {
        let header = region.ring_header();
        let capacity = region.config().ring_capacity;

        debug_assert!(capacity.is_power_of_two());

        Self {
            prod_head: &header.prod_head.raw,
            prod_tail: &header.prod_tail.raw,
            cons_head: &header.cons_head.raw,
            cons_tail: &header.cons_tail.raw,
            sync: header.sync.as_mut_ptr(),
            slots: region.ring_slots(),
            capacity,
            mask: capacity - 1,
            strategy: region.config().strategy,
            shutdown: &region.header().shutdown_flag,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of published, not yet drained descriptors.
    #[inline]
    pub fn len(&self) -> u32 {
        let tail = self.prod_tail.load(Ordering::Acquire);
        let head = self.cons_tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[inline]
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) == 1
    }

    /// Block until a free slot exists, then make `desc` visible to
    /// consumers. Safe for any number of producer threads in both processes.
    ///
    /// Returns `Err(RingError::Shutdown)` if shutdown is requested before
    /// the descriptor was accepted.
    pub fn submit(&self, desc: &RequestDescriptor) -> Result<(), RingError> {
        match self.strategy {
            SyncStrategy::Spin => spin::submit(self, desc),
            SyncStrategy::Mutex => locked::submit(self, desc),
            SyncStrategy::Semaphore => sema::submit(self, desc),
        }
    }

    /// Block until a published descriptor exists, then remove and return
    /// exactly one. Safe for any number of consumer threads.
    pub fn consume(&self) -> Result<RequestDescriptor, RingError> {
        match self.strategy {
            SyncStrategy::Spin => spin::consume(self),
            SyncStrategy::Mutex => locked::consume(self),
            SyncStrategy::Semaphore => sema::consume(self),
        }
    }

    /// Non-blocking submit. Returns `Ok(false)` if the ring is full.
    pub fn try_submit(&self, desc: &RequestDescriptor) -> Result<bool, RingError> {
        match self.strategy {
            SyncStrategy::Spin => spin::try_submit(self, desc),
            SyncStrategy::Mutex => locked::try_submit(self, desc),
            SyncStrategy::Semaphore => sema::try_submit(self, desc),
        }
    }

    /// Non-blocking consume. Returns `Ok(None)` if the ring is empty.
    pub fn try_consume(&self) -> Result<Option<RequestDescriptor>, RingError> {
        match self.strategy {
            SyncStrategy::Spin => spin::try_consume(self),
            SyncStrategy::Mutex => locked::try_consume(self),
            SyncStrategy::Semaphore => sema::try_consume(self),
        }
    }

    /// Wake every thread blocked inside `submit`/`consume`. Call after
    /// setting the region shutdown flag; blocked waiters re-check it and
    /// return `Err(RingError::Shutdown)`.
    pub fn wake_all(&self) {
        match self.strategy {
            SyncStrategy::Spin => {} // spin waiters poll the flag themselves
            SyncStrategy::Mutex => locked::wake_all(self),
            SyncStrategy::Semaphore => sema::wake_all(self),
        }
    }
}

/// Bounded exponential backoff: doubling busy-spins up to `2^SPIN_LIMIT`
/// iterations, then `yield_now`. Used for claim retries, publish-order
/// waits, and the client's completion poll, so no wait loop can livelock a
/// core under contention.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Busy-spin only; for short CAS retry windows.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..(1u32 << self.step.min(Self::SPIN_LIMIT)) {
            std::hint::spin_loop();
        }
        if self.step < Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Spin while cheap, then hand the core back to the scheduler.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step < Self::SPIN_LIMIT {
            self.spin();
        } else {
            std::thread::yield_now();
        }
    }
}
