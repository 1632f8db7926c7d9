//! Mutex + condition-variable ring strategy.
//!
//! One process-shared pthread mutex protects all four cursors; `submit`
//! waits on `not_full`, `consume` waits on `not_empty`, and each operation
//! signals the complementary condition after mutating state. Head and tail
//! move together under the lock (a descriptor is published the moment it is
//! written), which serializes producers and consumers but keeps the external
//! contract identical to the lock-free strategy.
//!
//! The primitives live inside the shared ring header and are initialized
//! with `PTHREAD_PROCESS_SHARED` by the region creator, so both processes
//! block on the same kernel objects.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::protocol::RequestDescriptor;
use crate::shm::ShmError;

use super::{RequestRing, RingError};

#[repr(C)]
struct LockedSync {
    mutex: libc::pthread_mutex_t,
    not_full: libc::pthread_cond_t,
    not_empty: libc::pthread_cond_t,
}

const _: () =
    assert!(std::mem::size_of::<LockedSync>() <= crate::protocol::SYNC_AREA_SIZE);

fn check_init(rc: libc::c_int) -> Result<(), ShmError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::SyncInit(io::Error::from_raw_os_error(rc)))
    }
}

/// Initialize the mutex and both condition variables (creator side only).
/// Failures here are unrecoverable for the region being built.
pub(super) fn init(area: *mut u8) -> Result<(), ShmError> {
    let sync = area as *mut LockedSync;

    // SAFETY: `area` points at SYNC_AREA_SIZE zeroed, 64-byte-aligned bytes
    // inside the freshly created mapping; no other process can observe the
    // region before create() returns.
    unsafe {
        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check_init(libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
        check_init(libc::pthread_mutexattr_setpshared(
            mattr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check_init(libc::pthread_mutex_init(
            ptr::addr_of_mut!((*sync).mutex),
            mattr.as_ptr(),
        ))?;
        libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());

        let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check_init(libc::pthread_condattr_init(cattr.as_mut_ptr()))?;
        check_init(libc::pthread_condattr_setpshared(
            cattr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check_init(libc::pthread_cond_init(
            ptr::addr_of_mut!((*sync).not_full),
            cattr.as_ptr(),
        ))?;
        check_init(libc::pthread_cond_init(
            ptr::addr_of_mut!((*sync).not_empty),
            cattr.as_ptr(),
        ))?;
        libc::pthread_condattr_destroy(cattr.as_mut_ptr());
    }

    Ok(())
}

#[inline]
fn sync_ptr(ring: &RequestRing) -> *mut LockedSync {
    ring.sync as *mut LockedSync
}

pub(super) fn submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<(), RingError> {
    let sync = sync_ptr(ring);

    // SAFETY: the primitives were initialized at region creation; lock and
    // unlock are balanced on every path out of this block.
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).mutex));
        loop {
            if ring.is_shut_down() {
                libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
                return Err(RingError::Shutdown);
            }

            let head = ring.prod_head.load(Ordering::Relaxed);
            let tail = ring.cons_tail.load(Ordering::Relaxed);
            if head.wrapping_sub(tail) < ring.capacity {
                ptr::write_volatile(ring.slots.add((head & ring.mask) as usize), *desc);
                ring.prod_head.store(head.wrapping_add(1), Ordering::Relaxed);
                ring.prod_tail.store(head.wrapping_add(1), Ordering::Release);
                libc::pthread_cond_signal(ptr::addr_of_mut!((*sync).not_empty));
                libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
                return Ok(());
            }

            libc::pthread_cond_wait(
                ptr::addr_of_mut!((*sync).not_full),
                ptr::addr_of_mut!((*sync).mutex),
            );
        }
    }
}

pub(super) fn consume(ring: &RequestRing) -> Result<RequestDescriptor, RingError> {
    let sync = sync_ptr(ring);

    // SAFETY: as in submit
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).mutex));
        loop {
            if ring.is_shut_down() {
                libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
                return Err(RingError::Shutdown);
            }

            let head = ring.cons_head.load(Ordering::Relaxed);
            let tail = ring.prod_tail.load(Ordering::Relaxed);
            if head != tail {
                let desc = ptr::read_volatile(ring.slots.add((head & ring.mask) as usize));
                ring.cons_head.store(head.wrapping_add(1), Ordering::Relaxed);
                ring.cons_tail.store(head.wrapping_add(1), Ordering::Release);
                libc::pthread_cond_signal(ptr::addr_of_mut!((*sync).not_full));
                libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
                return Ok(desc);
            }

            libc::pthread_cond_wait(
                ptr::addr_of_mut!((*sync).not_empty),
                ptr::addr_of_mut!((*sync).mutex),
            );
        }
    }
}

pub(super) fn try_submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<bool, RingError> {
    let sync = sync_ptr(ring);

    // SAFETY: as in submit
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).mutex));

        let head = ring.prod_head.load(Ordering::Relaxed);
        let tail = ring.cons_tail.load(Ordering::Relaxed);
        let accepted = head.wrapping_sub(tail) < ring.capacity;
        if accepted {
            ptr::write_volatile(ring.slots.add((head & ring.mask) as usize), *desc);
            ring.prod_head.store(head.wrapping_add(1), Ordering::Relaxed);
            ring.prod_tail.store(head.wrapping_add(1), Ordering::Release);
            libc::pthread_cond_signal(ptr::addr_of_mut!((*sync).not_empty));
        }

        libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
        Ok(accepted)
    }
}

pub(super) fn try_consume(ring: &RequestRing) -> Result<Option<RequestDescriptor>, RingError> {
    let sync = sync_ptr(ring);

    // SAFETY: as in submit
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).mutex));

        let head = ring.cons_head.load(Ordering::Relaxed);
        let tail = ring.prod_tail.load(Ordering::Relaxed);
        let desc = if head != tail {
            let desc = ptr::read_volatile(ring.slots.add((head & ring.mask) as usize));
            ring.cons_head.store(head.wrapping_add(1), Ordering::Relaxed);
            ring.cons_tail.store(head.wrapping_add(1), Ordering::Release);
            libc::pthread_cond_signal(ptr::addr_of_mut!((*sync).not_full));
            Some(desc)
        } else {
            None
        };

        libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
        Ok(desc)
    }
}

/// Broadcast both conditions so every waiter re-checks the shutdown flag.
pub(super) fn wake_all(ring: &RequestRing) {
    let sync = sync_ptr(ring);

    // SAFETY: as in submit; taking the mutex orders the broadcast after the
    // caller's shutdown-flag store for threads already inside a wait.
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).mutex));
        libc::pthread_cond_broadcast(ptr::addr_of_mut!((*sync).not_full));
        libc::pthread_cond_broadcast(ptr::addr_of_mut!((*sync).not_empty));
        libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).mutex));
    }
}
