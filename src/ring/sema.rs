//! Counting-semaphore ring strategy.
//!
//! Two process-shared POSIX semaphores count free and filled slots:
//! `submit` waits on `free_slots`, writes, posts `filled_slots`; `consume`
//! mirrors it. The semaphores bound capacity and provide the blocking, but
//! two producers could still claim the same head index, so a small
//! process-shared mutex per side serializes the claim-and-copy step.
//!
//! Shutdown wake-up: `wake_all` posts `capacity` tokens to both semaphores;
//! woken waiters observe the shutdown flag before touching the ring and
//! bail out, so the inflated counts never reach slot accounting.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::protocol::RequestDescriptor;
use crate::shm::ShmError;

use super::{RequestRing, RingError};

#[repr(C)]
struct SemSync {
    free_slots: libc::sem_t,
    filled_slots: libc::sem_t,
    prod_lock: libc::pthread_mutex_t,
    cons_lock: libc::pthread_mutex_t,
}

const _: () = assert!(std::mem::size_of::<SemSync>() <= crate::protocol::SYNC_AREA_SIZE);

fn check_init(rc: libc::c_int) -> Result<(), ShmError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::SyncInit(io::Error::from_raw_os_error(rc)))
    }
}

/// Initialize semaphores and claim locks (creator side only).
pub(super) fn init(area: *mut u8, capacity: u32) -> Result<(), ShmError> {
    let sync = area as *mut SemSync;

    // SAFETY: `area` points at SYNC_AREA_SIZE zeroed, aligned bytes inside
    // the freshly created mapping, before any other process attaches.
    unsafe {
        if libc::sem_init(ptr::addr_of_mut!((*sync).free_slots), 1, capacity) != 0 {
            return Err(ShmError::SyncInit(io::Error::last_os_error()));
        }
        if libc::sem_init(ptr::addr_of_mut!((*sync).filled_slots), 1, 0) != 0 {
            return Err(ShmError::SyncInit(io::Error::last_os_error()));
        }

        let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check_init(libc::pthread_mutexattr_init(mattr.as_mut_ptr()))?;
        check_init(libc::pthread_mutexattr_setpshared(
            mattr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))?;
        check_init(libc::pthread_mutex_init(
            ptr::addr_of_mut!((*sync).prod_lock),
            mattr.as_ptr(),
        ))?;
        check_init(libc::pthread_mutex_init(
            ptr::addr_of_mut!((*sync).cons_lock),
            mattr.as_ptr(),
        ))?;
        libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
    }

    Ok(())
}

#[inline]
fn sync_ptr(ring: &RequestRing) -> *mut SemSync {
    ring.sync as *mut SemSync
}

/// Wait on a semaphore, retrying EINTR.
fn wait(sem: *mut libc::sem_t) -> Result<(), RingError> {
    loop {
        // SAFETY: sem points into the initialized sync area
        let rc = unsafe { libc::sem_wait(sem) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(RingError::Sys(err));
    }
}

/// Try to take one token without blocking.
fn try_wait(sem: *mut libc::sem_t) -> Result<bool, RingError> {
    loop {
        // SAFETY: sem points into the initialized sync area
        let rc = unsafe { libc::sem_trywait(sem) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(RingError::Sys(err)),
        }
    }
}

pub(super) fn submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<(), RingError> {
    let sync = sync_ptr(ring);

    if ring.is_shut_down() {
        return Err(RingError::Shutdown);
    }
    wait(unsafe { ptr::addr_of_mut!((*sync).free_slots) })?;
    if ring.is_shut_down() || !write_claimed(ring, sync, desc) {
        // The token came from a wake_all broadcast, not from a drained slot
        return Err(RingError::Shutdown);
    }
    Ok(())
}

pub(super) fn consume(ring: &RequestRing) -> Result<RequestDescriptor, RingError> {
    let sync = sync_ptr(ring);

    if ring.is_shut_down() {
        return Err(RingError::Shutdown);
    }
    wait(unsafe { ptr::addr_of_mut!((*sync).filled_slots) })?;
    if ring.is_shut_down() {
        return Err(RingError::Shutdown);
    }

    read_claimed(ring, sync).ok_or(RingError::Shutdown)
}

pub(super) fn try_submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<bool, RingError> {
    let sync = sync_ptr(ring);

    if !try_wait(unsafe { ptr::addr_of_mut!((*sync).free_slots) })? {
        return Ok(false);
    }

    Ok(write_claimed(ring, sync, desc))
}

pub(super) fn try_consume(ring: &RequestRing) -> Result<Option<RequestDescriptor>, RingError> {
    let sync = sync_ptr(ring);

    if !try_wait(unsafe { ptr::addr_of_mut!((*sync).filled_slots) })? {
        return Ok(None);
    }

    Ok(read_claimed(ring, sync))
}

/// Copy the descriptor into the next producer slot. The semaphore token
/// normally guarantees the slot below `prod_head` is drained; occupancy is
/// re-checked under the lock anyway so a phantom token from `wake_all` can
/// never overwrite live data. Returns `false` on a phantom token.
fn write_claimed(ring: &RequestRing, sync: *mut SemSync, desc: &RequestDescriptor) -> bool {
    // SAFETY: primitives initialized at creation; lock/unlock balanced
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).prod_lock));
        let head = ring.prod_head.load(Ordering::Relaxed);
        let tail = ring.cons_tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= ring.capacity {
            libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).prod_lock));
            return false;
        }
        ptr::write_volatile(ring.slots.add((head & ring.mask) as usize), *desc);
        ring.prod_head.store(head.wrapping_add(1), Ordering::Relaxed);
        ring.prod_tail.store(head.wrapping_add(1), Ordering::Release);
        libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).prod_lock));
        libc::sem_post(ptr::addr_of_mut!((*sync).filled_slots));
        true
    }
}

/// Drain the next consumer slot; mirror of `write_claimed`. Returns `None`
/// on a phantom token (ring actually empty).
fn read_claimed(ring: &RequestRing, sync: *mut SemSync) -> Option<RequestDescriptor> {
    // SAFETY: primitives initialized at creation; lock/unlock balanced
    unsafe {
        libc::pthread_mutex_lock(ptr::addr_of_mut!((*sync).cons_lock));
        let head = ring.cons_head.load(Ordering::Relaxed);
        let tail = ring.prod_tail.load(Ordering::Acquire);
        if head == tail {
            libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).cons_lock));
            return None;
        }
        let desc = ptr::read_volatile(ring.slots.add((head & ring.mask) as usize));
        ring.cons_head.store(head.wrapping_add(1), Ordering::Relaxed);
        ring.cons_tail.store(head.wrapping_add(1), Ordering::Release);
        libc::pthread_mutex_unlock(ptr::addr_of_mut!((*sync).cons_lock));
        libc::sem_post(ptr::addr_of_mut!((*sync).free_slots));
        Some(desc)
    }
}

/// Post enough tokens to both semaphores that every possible waiter wakes
/// and re-checks the shutdown flag.
pub(super) fn wake_all(ring: &RequestRing) {
    let sync = sync_ptr(ring);

    // SAFETY: primitives initialized at creation
    unsafe {
        for _ in 0..ring.capacity {
            libc::sem_post(ptr::addr_of_mut!((*sync).free_slots));
            libc::sem_post(ptr::addr_of_mut!((*sync).filled_slots));
        }
    }
}
