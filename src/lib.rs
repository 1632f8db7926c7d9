//! shmkv - a shared-memory key-value request channel.
//!
//! A client process submits PUT/GET requests into a fixed-capacity ring
//! buffer living in a memory region shared with a separate server process.
//! Server workers drain the ring, apply the operations to an in-memory
//! key-value table, and answer through per-request completion slots the
//! client polls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//! │client thr 0 │  │client thr 1 │  │client thr N │
//! └──────┬──────┘  └──────┬──────┘  └──────┬──────┘
//!        │ submit         │                │         ▲ poll own window
//!        └────────────────┼────────────────┘         │
//!                         ▼                          │
//! ┌──────────────────────────────────────────────────┴───────────────────┐
//! │ shared region:  [header][MPMC ring][completion windows, one/thread]  │
//! └────────────────────────┬─────────────────────────▲───────────────────┘
//!                  consume │                         │ publish result
//!                          ▼                         │
//! ┌──────────────────────────────────────────────────┴───┐
//! │        server workers → key-value table (buckets)    │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Communication
//!
//! - The client creates the region; the server attaches by name and flips
//!   the ready flag once its workers run.
//! - The ring is multi-producer/multi-consumer across both processes, with
//!   a synchronization strategy (lock-free CAS, mutex + condvar, or
//!   semaphore pair) fixed at creation time.
//! - Each client thread owns a window of completion slots; request `seq`
//!   answers into slot `seq % window`, and completions are consumed
//!   strictly in submission order.
//! - Shutdown is a flag in the region header plus a wake-all broadcast, so
//!   no thread stays blocked in the ring.

pub mod client;
pub mod launcher;
pub mod logging;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod shm;
pub mod table;
pub mod workload;

pub use client::{run_workload, ClientError};
pub use launcher::{LaunchConfig, LaunchError};
pub use protocol::{Completion, OpKind, RequestDescriptor, SyncStrategy};
pub use ring::{RequestRing, RingError};
pub use server::{KvServer, ServerConfig, ServerError};
pub use shm::{RegionConfig, SharedRegion, ShmError};
pub use table::KvTable;
pub use workload::{Request, WorkloadError};

/// Default shared region name prefix
pub const DEFAULT_REGION_NAME_PREFIX: &str = "shmkv";

/// Generate the default shared region name based on hostname
pub fn default_region_name() -> String {
    let hostname = gethostname::gethostname()
        .to_string_lossy()
        .into_owned()
        .replace('.', "_");
    format!("{}_{}", DEFAULT_REGION_NAME_PREFIX, hostname)
}
