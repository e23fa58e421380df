//! Log-structured block store daemon.
//!
//! Serves the block log protocol over TCP, one client connection at a
//! time, backed by a directory of append-only segment files.

use anyhow::Context;
use blockstore::Store;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

mod dispatch;
mod proto;
mod worker;

#[derive(Debug, Parser)]
#[command(about = "Log-structured block store daemon")]
struct Opt {
    /// Address to listen on, e.g. 127.0.0.1:8085.
    #[arg(long, short = 's')]
    socket: String,

    /// Directory holding the block storage files.
    #[arg(long, short = 'd')]
    storage_dir: PathBuf,

    /// Block size in bytes.
    #[arg(long, short = 'b')]
    block_size: usize,

    /// Number of read worker threads.
    #[arg(long, short = 'n', default_value = "16")]
    readers: usize,

    /// Exit after serving a single connection.
    #[arg(long, short = '1')]
    once: bool,

    /// Skip fsync after writes. Unsafe, for benchmarking only.
    #[arg(long, short = 'L')]
    no_sync: bool,

    /// Artificial per-read latency in nanoseconds (testing hook).
    #[arg(long, short = 'l', default_value = "0")]
    latency_ns: u64,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BLOCKLOGD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("blocklogd=info")),
        )
        .init();

    anyhow::ensure!(
        (512..=128 * 1024).contains(&opts.block_size),
        "block size must be in [2^9, 2^17]"
    );
    anyhow::ensure!(
        (1..=1000).contains(&opts.readers),
        "number of readers must be in [1, 1000]"
    );
    anyhow::ensure!(
        opts.latency_ns < 1_000_000_000,
        "read latency must be in [0, 10^9) ns"
    );

    let store = Store::open(
        &opts.storage_dir,
        opts.block_size,
        opts.latency_ns,
        opts.no_sync,
    )
    .with_context(|| {
        format!(
            "error initializing storage directory: {}",
            opts.storage_dir.display()
        )
    })?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(opts, Arc::new(store)))
}

async fn run(opts: Opt, store: Arc<Store>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&opts.socket)
        .await
        .with_context(|| format!("failed to bind to {}", opts.socket))?;
    tracing::info!(
        "serving {} ({}-byte blocks, next block {:#018x})",
        opts.socket,
        store.block_len(),
        store.next_block()
    );

    let mut dispatcher = dispatch::Dispatcher::new(store, opts.readers);
    dispatcher.serve(listener, opts.once).await
}
