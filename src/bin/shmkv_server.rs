//! shmkv server binary.
//!
//! Attaches to the shared region created by the client, builds the
//! key-value table, and runs the dispatch workers until the client (or a
//! signal) requests shutdown.
//!
//! # Usage
//!
//! ```bash
//! shmkv_server --region-name shmkv_hostname -n 4 -s 1000
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::info;

use shmkv::protocol::{DEFAULT_SERVER_WORKERS, DEFAULT_STARTUP_TIMEOUT_MS, DEFAULT_TABLE_BUCKETS};
use shmkv::{default_region_name, logging, KvServer, ServerConfig, SharedRegion};

/// shmkv key-value server
#[derive(Parser, Debug)]
#[command(name = "shmkv_server")]
#[command(about = "Key-value server draining a shared-memory request ring")]
struct Args {
    /// Shared region name
    #[arg(long, default_value_t = default_region_name())]
    region_name: String,

    /// Number of dispatch worker threads
    #[arg(short = 'n', long, default_value_t = DEFAULT_SERVER_WORKERS)]
    workers: usize,

    /// Key-value table bucket count
    #[arg(short = 's', long = "table-size", default_value_t = DEFAULT_TABLE_BUCKETS)]
    table_size: usize,

    /// How long to wait for the region to appear, in milliseconds
    #[arg(long, default_value_t = DEFAULT_STARTUP_TIMEOUT_MS)]
    attach_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

/// Attach to the region, waiting for the client to create it if needed.
fn attach_region(
    name: &str,
    timeout: Duration,
) -> Result<SharedRegion, Box<dyn std::error::Error>> {
    let start = Instant::now();
    loop {
        if let Some(region) = SharedRegion::try_attach(name)? {
            return Ok(region);
        }
        if start.elapsed() >= timeout {
            return Err(format!("shared region {} did not appear", name).into());
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn run_server(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let region = attach_region(
        &args.region_name,
        Duration::from_millis(args.attach_timeout_ms),
    )?;
    info!(
        region = region.name(),
        size = region.total_size(),
        ring = region.config().ring_capacity,
        "attached to shared region"
    );

    let server = KvServer::new(
        region,
        ServerConfig {
            workers: args.workers,
            table_buckets: args.table_size,
        },
    );

    setup_signal_handlers();
    server.set_ready();

    thread::scope(|s| {
        // Turn SIGINT/SIGTERM into the same shutdown path the client uses
        s.spawn(|| loop {
            if server.region().is_shutdown_requested() {
                return;
            }
            if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
                info!("shutdown signal received");
                server.request_shutdown();
                return;
            }
            thread::sleep(Duration::from_millis(10));
        });

        let result = server.run();
        // Raise the flag on error exits too, so the signal watcher returns
        server.request_shutdown();
        result
    })?;

    info!("server shutdown complete");
    Ok(())
}

fn main() {
    let args = Args::parse();

    logging::init(&args.log_level);

    info!("shmkv server starting");
    info!("  region: {}", args.region_name);
    info!("  workers: {}", args.workers);
    info!("  table buckets: {}", args.table_size);

    if let Err(e) = run_server(&args) {
        tracing::error!("server failed: {}", e);
        std::process::exit(1);
    }
}
