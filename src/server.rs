//! Key-value server: worker threads draining the shared ring.
//!
//! Each worker runs an unbounded loop: consume one descriptor from the
//! ring, apply it to the table, then write the result into the completion
//! slot named by the descriptor's `result_offset`. The slot's `ready` flag
//! is set last with release ordering, so a client that observes the flag
//! also observes the result fields. Workers exit when the region's shutdown
//! flag is raised and the ring broadcast wakes them.

use std::thread;

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::protocol::{OpKind, RequestDescriptor, DEFAULT_SERVER_WORKERS, DEFAULT_TABLE_BUCKETS, STATUS_BAD_OP, STATUS_OK};
use crate::ring::RingError;
use crate::shm::{SharedRegion, ShmError};
use crate::table::KvTable;

/// Error type for server operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("ring error: {0}")]
    Ring(#[from] RingError),
    /// A completion slot still had its ready flag set when a new result was
    /// about to be written: the client-server handshake has desynchronized.
    #[error("completion slot at offset {offset} still marked ready")]
    StaleCompletion { offset: u32 },
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Server-side configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of dispatch worker threads
    pub workers: usize,
    /// Key-value table bucket count
    pub table_buckets: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SERVER_WORKERS,
            table_buckets: DEFAULT_TABLE_BUCKETS,
        }
    }
}

/// Key-value server over an attached shared region.
pub struct KvServer {
    region: SharedRegion,
    table: KvTable,
    workers: usize,
}

impl KvServer {
    pub fn new(region: SharedRegion, config: ServerConfig) -> Self {
        Self {
            region,
            table: KvTable::with_buckets(config.table_buckets),
            workers: config.workers.max(1),
        }
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn table(&self) -> &KvTable {
        &self.table
    }

    /// Mark the server as ready so the client starts submitting.
    pub fn set_ready(&self) {
        let pid = std::process::id();
        self.region.set_server_ready(pid);
        info!(pid, "server ready");
    }

    /// Raise the shutdown flag and wake every blocked ring waiter.
    pub fn request_shutdown(&self) {
        self.region.request_shutdown();
        self.region.ring().wake_all();
    }

    /// Run the dispatch loop with the configured number of workers.
    /// Blocks until shutdown is requested.
    pub fn run(&self) -> Result<(), ServerError> {
        info!(
            workers = self.workers,
            buckets = self.table.bucket_count(),
            "starting dispatch workers"
        );

        thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers)
                .map(|worker| {
                    s.spawn(move || worker_loop(worker, &self.region, &self.table))
                })
                .collect();

            let mut result = Ok(());
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => result = Err(e),
                    Err(_) => result = Err(ServerError::WorkerPanicked),
                }
            }
            result
        })?;

        info!("dispatch workers exited");
        Ok(())
    }
}

fn worker_loop(worker: usize, region: &SharedRegion, table: &KvTable) -> Result<(), ServerError> {
    let ring = region.ring();
    debug!(worker, "worker started");

    loop {
        let desc = match ring.consume() {
            Ok(desc) => desc,
            Err(RingError::Shutdown) => {
                debug!(worker, "worker shutting down");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = handle_request(region, table, &desc) {
            // Per-request protocol violations are local to that request
            error!(worker, error = %e, key = desc.key, "dropping request");
        }
    }
}

/// Apply one request to the table and publish its completion.
fn handle_request(
    region: &SharedRegion,
    table: &KvTable,
    desc: &RequestDescriptor,
) -> Result<(), ServerError> {
    let (value, status) = match desc.op() {
        Some(OpKind::Put) => {
            table.put(desc.key, desc.value);
            (desc.value, STATUS_OK)
        }
        Some(OpKind::Get) => (table.get(desc.key), STATUS_OK),
        None => {
            debug!(op = desc.op, key = desc.key, "unknown operation code");
            (0, STATUS_BAD_OP)
        }
    };

    let slot = region.completion_slot(desc.result_offset)?;
    if !slot.publish(desc.op, desc.key, value, status) {
        return Err(ServerError::StaleCompletion {
            offset: desc.result_offset,
        });
    }

    trace!(key = desc.key, value, status, "request completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncStrategy;
    use crate::shm::RegionConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_test_region(test: &str) -> SharedRegion {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("shmkv_srv_{}_{}_{}", std::process::id(), test, id);
        let config = RegionConfig {
            ring_capacity: 8,
            client_threads: 1,
            window: 2,
            strategy: SyncStrategy::Spin,
        };
        SharedRegion::create(&name, config).unwrap()
    }

    fn await_ready(region: &SharedRegion, offset: u32) -> crate::protocol::Completion {
        let slot = region.completion_slot(offset).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(c) = slot.take() {
                return c;
            }
            assert!(std::time::Instant::now() < deadline, "completion timed out");
            thread::yield_now();
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let region = create_test_region("roundtrip");
        let server = KvServer::new(
            SharedRegion::attach(region.name()).unwrap(),
            ServerConfig {
                workers: 2,
                table_buckets: 4,
            },
        );

        thread::scope(|s| {
            let handle = s.spawn(|| server.run());

            let ring = region.ring();
            let off = region.completion_offset(0, 0);

            ring.submit(&RequestDescriptor::put(5, 55, off)).unwrap();
            let c = await_ready(&region, off);
            assert_eq!(c.status, STATUS_OK);
            assert_eq!(c.key, 5);

            ring.submit(&RequestDescriptor::get(5, off)).unwrap();
            let c = await_ready(&region, off);
            assert_eq!(c.value, 55);

            // A key that was never put completes with the zero sentinel
            ring.submit(&RequestDescriptor::get(999, off)).unwrap();
            let c = await_ready(&region, off);
            assert_eq!(c.value, 0);

            region.request_shutdown();
            region.ring().wake_all();
            handle.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_unknown_op_gets_error_status() {
        let region = create_test_region("bad_op");
        let server = KvServer::new(
            SharedRegion::attach(region.name()).unwrap(),
            ServerConfig::default(),
        );

        thread::scope(|s| {
            let handle = s.spawn(|| server.run());

            let ring = region.ring();
            let off = region.completion_offset(0, 0);

            let mut desc = RequestDescriptor::put(1, 2, off);
            desc.op = 77;
            ring.submit(&desc).unwrap();

            let c = await_ready(&region, off);
            assert_eq!(c.status, STATUS_BAD_OP);
            assert_eq!(c.value, 0);

            // The server keeps serving well-formed requests afterwards
            ring.submit(&RequestDescriptor::put(1, 2, off)).unwrap();
            let c = await_ready(&region, off);
            assert_eq!(c.status, STATUS_OK);

            region.request_shutdown();
            region.ring().wake_all();
            handle.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_out_of_range_offset_is_rejected() {
        let region = create_test_region("bad_offset");
        let server = KvServer::new(
            SharedRegion::attach(region.name()).unwrap(),
            ServerConfig::default(),
        );

        thread::scope(|s| {
            let handle = s.spawn(|| server.run());

            let ring = region.ring();

            // Offset outside the mapped region: dropped without corrupting
            // anything, and the server stays up
            let bad = RequestDescriptor::put(1, 2, region.total_size() as u32 + 64);
            ring.submit(&bad).unwrap();

            let off = region.completion_offset(0, 0);
            ring.submit(&RequestDescriptor::put(3, 30, off)).unwrap();
            let c = await_ready(&region, off);
            assert_eq!(c.key, 3);

            region.request_shutdown();
            region.ring().wake_all();
            handle.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_stale_completion_is_dropped() {
        let region = create_test_region("stale");
        let server = KvServer::new(
            SharedRegion::attach(region.name()).unwrap(),
            ServerConfig::default(),
        );

        thread::scope(|s| {
            let handle = s.spawn(|| server.run());

            let ring = region.ring();
            let off = region.completion_offset(0, 0);

            ring.submit(&RequestDescriptor::put(1, 10, off)).unwrap();
            let slot = region.completion_slot(off).unwrap();
            while !slot.is_ready() {
                thread::yield_now();
            }

            // Second result aimed at the un-drained slot desynchronizes the
            // handshake; the server must refuse to overwrite it
            ring.submit(&RequestDescriptor::put(2, 20, off)).unwrap();
            thread::sleep(Duration::from_millis(50));

            let c = slot.take().unwrap();
            assert_eq!(c.key, 1);
            assert_eq!(c.value, 10);

            region.request_shutdown();
            region.ring().wake_all();
            handle.join().unwrap().unwrap();
        });
    }
}
