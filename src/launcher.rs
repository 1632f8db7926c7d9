//! Server process launcher.
//!
//! The client creates the shared region, spawns the server binary against
//! it, and waits for the ready handshake before submitting anything.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::info;

use crate::protocol::DEFAULT_STARTUP_TIMEOUT_MS;
use crate::shm::SharedRegion;

/// Error type for server process management
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn server: {0}")]
    Spawn(io::Error),
    #[error("failed to wait for server: {0}")]
    Wait(io::Error),
    #[error("server did not become ready within {0:?}")]
    StartupTimeout(Duration),
}

/// Configuration for spawning the server binary.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the server executable
    pub server_binary: PathBuf,
    /// Shared region name passed through to the server
    pub region_name: String,
    /// Server worker thread count
    pub workers: usize,
    /// Key-value table bucket count
    pub table_buckets: usize,
    /// How long to wait for the ready flag
    pub startup_timeout: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            server_binary: PathBuf::from("shmkv_server"),
            region_name: crate::default_region_name(),
            workers: crate::protocol::DEFAULT_SERVER_WORKERS,
            table_buckets: crate::protocol::DEFAULT_TABLE_BUCKETS,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
        }
    }
}

/// Spawn the server process. The region must already exist; the child
/// attaches to it by name and flips the ready flag once its workers run.
pub fn spawn_server(config: &LaunchConfig) -> Result<Child, LaunchError> {
    info!(binary = ?config.server_binary, "spawning server");

    let child = Command::new(&config.server_binary)
        .arg("--region-name")
        .arg(&config.region_name)
        .arg("--workers")
        .arg(config.workers.to_string())
        .arg("--table-size")
        .arg(config.table_buckets.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(LaunchError::Spawn)?;

    info!(pid = child.id(), "server spawned");
    Ok(child)
}

/// Poll the region's ready flag until the server flips it or the timeout
/// elapses.
pub fn wait_for_server_ready(
    region: &SharedRegion,
    timeout: Duration,
) -> Result<(), LaunchError> {
    let start = Instant::now();

    while !region.is_server_ready() {
        if start.elapsed() >= timeout {
            return Err(LaunchError::StartupTimeout(timeout));
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    info!("server is ready");
    Ok(())
}

/// Request shutdown, wake blocked waiters, and reap the child process.
pub fn shutdown_and_wait(region: &SharedRegion, mut child: Child) -> Result<(), LaunchError> {
    region.request_shutdown();
    region.ring().wake_all();

    let status = child.wait().map_err(LaunchError::Wait)?;
    info!(%status, "server exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::RegionConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_test_region(test: &str) -> SharedRegion {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("shmkv_launch_{}_{}_{}", std::process::id(), test, id);
        SharedRegion::create(&name, RegionConfig::default()).unwrap()
    }

    #[test]
    fn test_wait_times_out_without_server() {
        let region = create_test_region("timeout");
        let result = wait_for_server_ready(&region, Duration::from_millis(20));
        assert!(matches!(result, Err(LaunchError::StartupTimeout(_))));
    }

    #[test]
    fn test_wait_observes_ready_flag() {
        let region = create_test_region("ready");

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                region.set_server_ready(42);
            });

            wait_for_server_ready(&region, Duration::from_secs(5)).unwrap();
        });

        assert!(region.is_server_ready());
    }
}
