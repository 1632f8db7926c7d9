//! Client-side windowed submission and in-order completion protocol.
//!
//! The request log is split into contiguous, non-overlapping slices, one
//! per submission thread; the last thread absorbs the remainder. Each
//! thread keeps at most `window` requests in flight: request `seq` targets
//! the completion slot `seq % window` inside the thread's window, and
//! completions are consumed strictly in submission order: the thread
//! always waits for the completion at its next-expected cursor even if a
//! later slot's ready flag is set first. In-order acknowledgement keeps
//! every slot address predictable, which is what makes slot reuse safe.
//!
//! Polling the ready flag spins briefly and then yields (see
//! [`crate::ring::Backoff`]) instead of pegging a core.

use std::thread;

use thiserror::Error;
use tracing::{debug, trace};

use crate::protocol::{Completion, OpKind, RequestDescriptor};
use crate::ring::{Backoff, RequestRing, RingError};
use crate::shm::{SharedRegion, ShmError};
use crate::workload::Request;

/// Error type for the submission protocol
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("ring error: {0}")]
    Ring(#[from] RingError),
    #[error("submission thread panicked")]
    ThreadPanicked,
}

/// Per-thread submission state. Owned and mutated by exactly one thread.
struct SubmissionContext<'a> {
    /// Thread index; selects this thread's completion window
    tid: u32,
    region: &'a SharedRegion,
    ring: RequestRing<'a>,
    /// This thread's contiguous slice of the request log
    requests: &'a [Request],
    /// Completion for each request in `requests`, same indexing
    results: &'a mut [Completion],
    /// Max in-flight requests
    window: u64,
    /// Window position of the next expected completion
    next_comp: u64,
    submitted: u64,
    completed: u64,
}

impl SubmissionContext<'_> {
    /// Keep submitting and draining until every assigned request has
    /// completed.
    fn run(&mut self) -> Result<(), ClientError> {
        let total = self.requests.len() as u64;
        debug!(tid = self.tid, requests = total, "submission thread started");

        let mut backoff = Backoff::new();
        while self.submitted < total {
            let submitted = self.submit_window()?;
            let drained = self.process_completions()?;
            if submitted || drained {
                backoff = Backoff::new();
            } else {
                backoff.snooze();
            }
        }

        // Everything is submitted; drain the completions still in flight
        while self.completed < total {
            if self.process_completions()? {
                backoff = Backoff::new();
            } else {
                backoff.snooze();
            }
        }

        debug!(tid = self.tid, completed = self.completed, "submission thread done");
        Ok(())
    }

    /// Submit as many requests as the window allows.
    fn submit_window(&mut self) -> Result<bool, ClientError> {
        let total = self.requests.len() as u64;
        let mut progressed = false;

        while self.submitted < total && self.submitted - self.completed < self.window {
            let req = &self.requests[self.submitted as usize];
            let offset = self.region.completion_offset(self.tid, self.submitted);

            // This window slot was drained `window` requests ago; a ready
            // flag still set here means the handshake desynchronized.
            let slot = self.region.completion_slot(offset)?;
            assert!(
                !slot.is_ready(),
                "completion slot {} reused while still marked ready",
                offset
            );

            let desc = match req.op {
                OpKind::Put => RequestDescriptor::put(req.key, req.value, offset),
                OpKind::Get => RequestDescriptor::get(req.key, offset),
            };
            self.ring.submit(&desc)?;
            self.submitted += 1;
            progressed = true;

            trace!(tid = self.tid, key = req.key, seq = self.submitted, "submitted");
        }

        Ok(progressed)
    }

    /// Drain completions, in submission order only. Stops at the first slot
    /// whose ready flag is not set, even if later slots completed already.
    fn process_completions(&mut self) -> Result<bool, ClientError> {
        let mut progressed = false;

        while self.completed < self.submitted {
            debug_assert_eq!(self.next_comp, self.completed % self.window);
            let offset = self.region.completion_offset(self.tid, self.completed);
            let slot = self.region.completion_slot(offset)?;

            match slot.take() {
                Some(completion) => {
                    trace!(
                        tid = self.tid,
                        key = completion.key,
                        value = completion.value,
                        "completed"
                    );
                    self.results[self.completed as usize] = completion;
                    self.completed += 1;
                    self.next_comp = self.completed % self.window;
                    progressed = true;
                }
                None => break,
            }
        }

        Ok(progressed)
    }
}

/// Run a request log against the region's ring with the configured number
/// of submission threads and window size. Returns one completion per
/// request, in request-log order.
pub fn run_workload(
    region: &SharedRegion,
    requests: &[Request],
) -> Result<Vec<Completion>, ClientError> {
    let threads = region.config().client_threads;
    let window = region.config().window as u64;
    let mut results = vec![Completion::default(); requests.len()];

    // Contiguous static partitioning; the last thread absorbs the remainder
    let per_thread = requests.len() / threads as usize;

    thread::scope(|s| -> Result<(), ClientError> {
        let mut handles = Vec::new();
        let mut request_rest = requests;
        let mut result_rest = results.as_mut_slice();

        for tid in 0..threads {
            let take = if tid == threads - 1 {
                request_rest.len()
            } else {
                per_thread
            };
            let (request_chunk, next_requests) = request_rest.split_at(take);
            let (result_chunk, next_results) = result_rest.split_at_mut(take);
            request_rest = next_requests;
            result_rest = next_results;

            handles.push(s.spawn(move || {
                let mut ctx = SubmissionContext {
                    tid,
                    region,
                    ring: region.ring(),
                    requests: request_chunk,
                    results: result_chunk,
                    window,
                    next_comp: 0,
                    submitted: 0,
                    completed: 0,
                };
                ctx.run()
            }));
        }

        for handle in handles {
            handle.join().map_err(|_| ClientError::ThreadPanicked)??;
        }
        Ok(())
    })?;

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: u32, value: u32) -> Request {
        Request {
            op: OpKind::Put,
            key,
            value,
        }
    }

    #[test]
    fn test_partitioning_math() {
        // 10 requests over 4 threads: 2/2/2/4, last thread absorbs the rest
        let requests: Vec<Request> = (0..10).map(|i| put(i, i)).collect();
        let threads = 4usize;
        let per_thread = requests.len() / threads;

        let mut sizes = Vec::new();
        let mut rest = requests.as_slice();
        for tid in 0..threads {
            let take = if tid == threads - 1 { rest.len() } else { per_thread };
            let (chunk, r) = rest.split_at(take);
            sizes.push(chunk.len());
            rest = r;
        }
        assert_eq!(sizes, vec![2, 2, 2, 4]);
        assert!(rest.is_empty());
    }
}
