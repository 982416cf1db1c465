//! echo-load: a line echo server and a concurrent connection load tester
//!
//! Two modes share one binary:
//! - `server`: echoes every received line until the client sends `quit`
//! - `client`: opens many connections with a staggered ramp-up and bounded
//!   retries, checks every echo, and prints a summary at the end
//!
//! Features:
//! - Live status line with open connection and error counts
//! - Jittered, non-exponential retry on connect failures
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod connection;
mod error;
mod monitor;
mod orchestrator;
mod protocol;
mod server;
mod stats;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use client::{AttemptContext, RetryPolicy, TcpConnector};
use config::{Config, Mode};
use connection::ConnectionSettings;
use orchestrator::LoadOrchestrator;
use server::EchoServer;
use stats::Counters;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        address = %config.address(),
        io_timeout = ?config.io_timeout,
        workers = ?config.workers,
        "Starting echo-load"
    );

    let runtime = build_runtime(config.workers)?;
    match config.mode {
        Mode::Server => runtime.block_on(run_server(config)),
        Mode::Client { connections } => runtime.block_on(run_client(config, connections)),
    }
}

/// Single-threaded runtime for `workers == 1`, multi-threaded otherwise.
fn build_runtime(workers: Option<usize>) -> io::Result<tokio::runtime::Runtime> {
    match workers {
        Some(1) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
        Some(n) => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(n.max(1))
            .enable_all()
            .build(),
        None => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build(),
    }
}

/// Serve until interrupted, then drain and exit.
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = resolve(&config.address()).await?;
    let settings = ConnectionSettings {
        io_timeout: config.io_timeout,
        counters: Counters::new(),
    };

    let handle =
        EchoServer::bind(addr, config.backlog, config.max_connections, settings)?.serve()?;
    println!(
        "PID({}) serving on {}",
        std::process::id(),
        handle.local_addr()
    );

    let status = tokio::spawn(monitor::monitor(
        Arc::clone(handle.counters()),
        handle.closed(),
        config.monitor_interval,
        io::stdout(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    let counters = Arc::clone(handle.counters());
    handle.shutdown(config.shutdown_grace).await;

    if let Ok(Err(e)) = status.await {
        warn!(error = %e, "Status monitor failed");
    }

    let snapshot = counters.snapshot();
    println!(
        "{} connections open, {} errors",
        snapshot.connections, snapshot.errors
    );
    Ok(())
}

/// Run the load test to completion (or interrupt) and print the summary.
async fn run_client(
    config: Config,
    connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = resolve(&config.address()).await?;
    println!(
        "PID({}) attempting {} connections",
        std::process::id(),
        connections
    );

    let fd_limit = match config.fd_limit {
        Some(limit) => limit,
        None => orchestrator::fd_limit().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read file descriptor limit");
            u64::MAX
        }),
    };

    let counters = Counters::new();
    let ctx = AttemptContext {
        connector: TcpConnector,
        target,
        policy: RetryPolicy {
            retries: config.retries,
            interval: config.retry_interval,
            jitter: config.retry_jitter,
        },
        payload: config.payload.into(),
        settings: ConnectionSettings {
            io_timeout: config.io_timeout,
            counters: Arc::clone(&counters),
        },
    };
    let orchestrator = LoadOrchestrator::new(ctx, config.rate_divisor, fd_limit);

    let (done_tx, done_rx) = watch::channel(false);
    let status = tokio::spawn(monitor::monitor(
        counters,
        done_rx,
        config.monitor_interval,
        io::stdout(),
    ));

    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler: never interrupt
            std::future::pending::<()>().await;
        }
    };
    let summary = orchestrator.run(connections, interrupt).await;

    let _ = done_tx.send(true);
    if let Ok(Err(e)) = status.await {
        warn!(error = %e, "Status monitor failed");
    }

    println!("{}", summary);
    Ok(())
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {address}"),
        )
    })
}
