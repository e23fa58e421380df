//! DynamoDB request queue + KV dispatcher daemon.
//!
//! Fronts a DynamoDB table with a compact binary KV protocol, scheduling
//! the underlying HTTP requests through rate-limited retry queues.

use anyhow::Context;
use clap::Parser;
use ddb_queue::{AwsCredentials, AwsHttpClient, RequestQueue};
use request_log::RequestLog;
use server_pool::{HickoryResolver, ServerPool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

mod capacity;
mod dispatch;
mod kv;
mod proto;

#[derive(Debug, Parser)]
#[command(about = "DynamoDB KV dispatcher daemon")]
struct Opt {
    /// Address to listen on, e.g. 127.0.0.1:8086.
    #[arg(long, short = 's')]
    socket: String,

    /// AWS region hosting the table, e.g. us-east-1.
    #[arg(long, short = 'r')]
    region: String,

    /// DynamoDB table name.
    #[arg(long, short = 't')]
    table: String,

    /// File containing ACCESS_KEY_ID= and ACCESS_KEY_SECRET= lines.
    #[arg(long, short = 'k')]
    keyfile: PathBuf,

    /// Exit after serving a single connection.
    #[arg(long, short = '1')]
    once: bool,

    /// Append one line per DynamoDB request attempt to this file.
    #[arg(long, short = 'l')]
    logfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DDBKVD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ddbkvd=info")),
        )
        .init();

    let creds = AwsCredentials::from_keyfile(&opts.keyfile)?;

    // Keep resolving the endpoint for the life of the daemon; AWS
    // rotates the addresses behind the name.
    let endpoint = format!("dynamodb.{}.amazonaws.com:443", opts.region);
    let resolver = Arc::new(HickoryResolver::new()?);
    let pool = ServerPool::spawn(
        resolver,
        &endpoint,
        Duration::from_secs(15),
        Duration::from_secs(120),
    )
    .await
    .with_context(|| format!("error starting DNS lookups for {endpoint}"))?;

    let client = Arc::new(AwsHttpClient::new(creds, &opts.region));
    let write_queue = RequestQueue::new(pool.clone(), client.clone());
    let read_queue = RequestQueue::new(pool.clone(), client.clone());

    if let Some(path) = &opts.logfile {
        let log = RequestLog::open(path)?;
        write_queue.set_log(log.clone());
        read_queue.set_log(log);
    }

    // Block until the table's throughput parameters are known, so the
    // first client request is already rate-limited correctly.
    let _poller = capacity::CapacityPoller::new(
        pool,
        client,
        &opts.table,
        write_queue.clone(),
        read_queue.clone(),
    )
    .start()
    .await;

    let listener = TcpListener::bind(&opts.socket)
        .await
        .with_context(|| format!("failed to bind to {}", opts.socket))?;
    tracing::info!("serving {} for table {}", opts.socket, opts.table);

    let dispatcher = dispatch::KvDispatcher::new(write_queue, read_queue, &opts.table);
    dispatcher.serve(listener, opts.once).await
}
