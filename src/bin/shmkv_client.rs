//! shmkv client binary.
//!
//! Creates the shared region, loads a workload file, optionally spawns the
//! server process, drives the submission threads, and prints throughput.
//! With `--check`, GET results are compared against a solution file after
//! the run.
//!
//! # Usage
//!
//! ```bash
//! shmkv_client -n 4 -w 8 -i workload.txt -f -x ./shmkv_server -t 2 -s 1000 -c
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{error, info};

use shmkv::protocol::{
    DEFAULT_CLIENT_THREADS, DEFAULT_RING_CAPACITY, DEFAULT_SERVER_WORKERS,
    DEFAULT_STARTUP_TIMEOUT_MS, DEFAULT_TABLE_BUCKETS, DEFAULT_WINDOW,
};
use shmkv::{
    client, default_region_name, launcher, logging, workload, LaunchConfig, RegionConfig,
    SharedRegion, SyncStrategy,
};

/// shmkv workload client
#[derive(Parser, Debug)]
#[command(name = "shmkv_client")]
#[command(about = "Submits a key-value workload through the shared-memory ring")]
struct Args {
    /// Number of submission threads
    #[arg(short = 'n', long, default_value_t = DEFAULT_CLIENT_THREADS)]
    threads: u32,

    /// Window size (max in-flight requests per thread)
    #[arg(short = 'w', long, default_value_t = DEFAULT_WINDOW)]
    window: u32,

    /// Workload file (one `put k v` or `get k` per line)
    #[arg(short = 'i', long, default_value = "workload.txt")]
    workload: PathBuf,

    /// Solution file with expected GET results
    #[arg(short = 'e', long, default_value = "solution.txt")]
    expected: PathBuf,

    /// Check GET results against the solution file after the run
    #[arg(short = 'c', long)]
    check: bool,

    /// Spawn the server as a child process
    #[arg(short = 'f', long)]
    spawn_server: bool,

    /// Server executable path (only used with --spawn-server)
    #[arg(short = 'x', long, default_value = "./shmkv_server")]
    server_binary: PathBuf,

    /// Server worker threads (only used with --spawn-server)
    #[arg(short = 't', long, default_value_t = DEFAULT_SERVER_WORKERS)]
    server_workers: usize,

    /// Server table bucket count (only used with --spawn-server)
    #[arg(short = 's', long = "table-size", default_value_t = DEFAULT_TABLE_BUCKETS)]
    table_size: usize,

    /// Ring capacity (must be a power of 2)
    #[arg(long, default_value_t = DEFAULT_RING_CAPACITY)]
    ring_capacity: u32,

    /// Ring synchronization strategy: spin, mutex, or semaphore
    #[arg(long, default_value = "spin")]
    strategy: String,

    /// Shared region name
    #[arg(long, default_value_t = default_region_name())]
    region_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run_client(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    let strategy = SyncStrategy::from_name(&args.strategy)
        .ok_or_else(|| format!("unknown strategy {:?}", args.strategy))?;

    let requests = workload::load_workload(&args.workload)?;
    info!(requests = requests.len(), "workload loaded");

    let config = RegionConfig {
        ring_capacity: args.ring_capacity,
        client_threads: args.threads,
        window: args.window,
        strategy,
    };
    let region = SharedRegion::create(&args.region_name, config)?;
    info!(
        region = region.name(),
        size = region.total_size(),
        strategy = strategy.name(),
        "shared region created"
    );

    let startup_timeout = Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS);
    let child = if args.spawn_server {
        Some(launcher::spawn_server(&LaunchConfig {
            server_binary: args.server_binary.clone(),
            region_name: args.region_name.clone(),
            workers: args.server_workers,
            table_buckets: args.table_size,
            startup_timeout,
        })?)
    } else {
        None
    };

    launcher::wait_for_server_ready(&region, startup_timeout)?;

    let start = Instant::now();
    let completions = client::run_workload(&region, &requests)?;
    let elapsed = start.elapsed();

    let total_ms = elapsed.as_secs_f64() * 1e3;
    let throughput_k = requests.len() as f64 / elapsed.as_secs_f64() / 1e3;
    println!("Total time: {:.3} ms", total_ms);
    println!("Throughput: {:.3} K/s", throughput_k);

    match child {
        Some(child) => launcher::shutdown_and_wait(&region, child)?,
        None => {
            region.request_shutdown();
            region.ring().wake_all();
        }
    }

    if args.check {
        let expected = workload::load_expected(&args.expected)?;
        if let Some(m) = workload::check_results(&requests, &completions, &expected) {
            eprintln!(
                "Get({}) should return {}, but got {} (request index {})",
                m.key, m.expected, m.actual, m.request_index
            );
            return Ok(false);
        }
        info!("all GET results match the solution file");
    }

    Ok(true)
}

fn main() {
    let args = Args::parse();

    logging::init(&args.log_level);

    match run_client(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("client failed: {}", e);
            std::process::exit(1);
        }
    }
}
