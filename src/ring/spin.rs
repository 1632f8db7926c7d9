//! Lock-free claim-then-publish ring strategy.
//!
//! Producers race on `prod_head` with compare-and-swap; the winner owns the
//! claimed slot, copies its descriptor in, then advances `prod_tail` once
//! every earlier claimant has published. Consumers mirror the same protocol
//! on `cons_head`/`cons_tail`. A slot is never read before the producer-tail
//! advancement made it visible, and never overwritten before the
//! consumer-tail advancement marked it drained.
//!
//! Free-running u32 indices make the wraparound arithmetic ABA-safe: the
//! power-of-two capacity divides 2^32, so `index & mask` stays consistent
//! across index overflow.

use std::ptr;
use std::sync::atomic::Ordering;

use crate::protocol::RequestDescriptor;

use super::{Backoff, RequestRing, RingError};

pub(super) fn submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<(), RingError> {
    let mut backoff = Backoff::new();

    let claimed = loop {
        if ring.is_shut_down() {
            return Err(RingError::Shutdown);
        }

        let head = ring.prod_head.load(Ordering::Relaxed);
        let tail = ring.cons_tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= ring.capacity {
            // Full: the slot we would claim has not been drained yet
            backoff.snooze();
            continue;
        }

        match ring.prod_head.compare_exchange_weak(
            head,
            head.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break head,
            Err(_) => backoff.spin(),
        }
    };

    // The claimed slot is exclusively ours until prod_tail passes it
    unsafe {
        ptr::write_volatile(ring.slots.add((claimed & ring.mask) as usize), *desc);
    }

    publish(ring.prod_tail, claimed);
    Ok(())
}

pub(super) fn consume(ring: &RequestRing) -> Result<RequestDescriptor, RingError> {
    let mut backoff = Backoff::new();

    let claimed = loop {
        if ring.is_shut_down() {
            return Err(RingError::Shutdown);
        }

        let head = ring.cons_head.load(Ordering::Relaxed);
        let tail = ring.prod_tail.load(Ordering::Acquire);

        if head == tail {
            // Empty: nothing published past our claim point
            backoff.snooze();
            continue;
        }

        match ring.cons_head.compare_exchange_weak(
            head,
            head.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break head,
            Err(_) => backoff.spin(),
        }
    };

    let desc = unsafe { ptr::read_volatile(ring.slots.add((claimed & ring.mask) as usize)) };

    publish(ring.cons_tail, claimed);
    Ok(desc)
}

pub(super) fn try_submit(ring: &RequestRing, desc: &RequestDescriptor) -> Result<bool, RingError> {
    let mut backoff = Backoff::new();

    let claimed = loop {
        let head = ring.prod_head.load(Ordering::Relaxed);
        let tail = ring.cons_tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= ring.capacity {
            return Ok(false);
        }

        match ring.prod_head.compare_exchange_weak(
            head,
            head.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break head,
            Err(_) => backoff.spin(),
        }
    };

    unsafe {
        ptr::write_volatile(ring.slots.add((claimed & ring.mask) as usize), *desc);
    }

    publish(ring.prod_tail, claimed);
    Ok(true)
}

pub(super) fn try_consume(ring: &RequestRing) -> Result<Option<RequestDescriptor>, RingError> {
    let mut backoff = Backoff::new();

    let claimed = loop {
        let head = ring.cons_head.load(Ordering::Relaxed);
        let tail = ring.prod_tail.load(Ordering::Acquire);

        if head == tail {
            return Ok(None);
        }

        match ring.cons_head.compare_exchange_weak(
            head,
            head.wrapping_add(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break head,
            Err(_) => backoff.spin(),
        }
    };

    let desc = unsafe { ptr::read_volatile(ring.slots.add((claimed & ring.mask) as usize)) };

    publish(ring.cons_tail, claimed);
    Ok(Some(desc))
}

/// Advance a tail cursor past our claimed index, in claim order.
///
/// Only the claimant of `claimed` may store `claimed + 1`, so a plain store
/// suffices once the cursor reaches our claim; the release store is what
/// makes the slot copy visible to the other side. Claimants of later
/// indices wait here for slower peers. This wait must run to completion
/// even under shutdown, otherwise the cursor would stall forever below an
/// already-claimed index.
#[inline]
fn publish(tail: &std::sync::atomic::AtomicU32, claimed: u32) {
    let mut backoff = Backoff::new();
    while tail.load(Ordering::Relaxed) != claimed {
        backoff.snooze();
    }
    tail.store(claimed.wrapping_add(1), Ordering::Release);
}
