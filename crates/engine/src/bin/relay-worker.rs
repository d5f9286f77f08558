//! relay-worker: runs the relay's background loops against one store.
//!
//! Loops:
//! - dispatch producer and consumer (queued tasks → workers)
//! - deadline sweep (tasks whose watcher was lost)
//! - stake normalizer refresh
//! - network stats rollup
//!
//! Chain sync and settlement anchoring need a concrete [`relay_engine::ChainClient`]
//! and are wired by the deployment that provides one.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use relay_core::config::{load_dotenv, RelayConfig};
use relay_engine::{DispatchQueue, Dispatcher, Relay, Shutdown, StatsRollup};
use relay_store::{MemoryStore, PgStore, Store};

// ── CLI ─────────────────────────────────────────────────────────────

/// Relay coordination worker.
#[derive(Parser, Debug)]
#[command(name = "relay-worker", version, about)]
struct Cli {
    /// Use the in-memory store instead of PostgreSQL.
    #[arg(long, env = "RELAY_MEMORY_STORE", default_value_t = false)]
    memory: bool,

    /// Number of dispatch consumers.
    #[arg(long, env = "RELAY_DISPATCH_CONSUMERS", default_value_t = 1)]
    consumers: usize,

    /// Grace period for loops to stop after Ctrl-C, in seconds.
    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

// ── Periodic drivers ────────────────────────────────────────────────

async fn run_sweeper(relay: Relay, shutdown: Shutdown) {
    let interval = relay.config().timeouts.sweep_interval();
    while shutdown.sleep(interval).await {
        if let Err(e) = relay.sweep_expired().await {
            warn!(error = %e, "deadline sweep failed");
        }
    }
}

async fn run_stake_refresh(relay: Relay, shutdown: Shutdown) {
    let interval = relay.config().stake.refresh_interval();
    loop {
        if let Err(e) = relay.stakes().refresh(relay.store().as_ref()).await {
            warn!(error = %e, "stake refresh failed");
        }
        if !shutdown.sleep(interval).await {
            break;
        }
    }
}

async fn run_stats(relay: Relay, stats: Arc<StatsRollup>, shutdown: Shutdown) {
    let interval = relay.config().relay.stats_interval();
    while shutdown.sleep(interval).await {
        match stats.rollup(relay.store().as_ref()).await {
            Ok(snapshot) => info!(
                total_fees_paid = %snapshot.total_fees_paid,
                workers = ?snapshot.workers_by_status,
                jobs = ?snapshot.jobs_by_status,
                "network stats"
            ),
            Err(e) => warn!(error = %e, "stats rollup failed"),
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::from_env();
    config.log_summary();

    let store: Arc<dyn Store> = if cli.memory {
        warn!("using the in-memory store; state is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&config.postgres).await?)
    };

    let queue = Arc::new(DispatchQueue::new(config.dispatch.queue_capacity));
    let relay = Relay::new(store, config);
    let shutdown = Shutdown::new();
    let stats = Arc::new(StatsRollup::new());

    let dispatcher = Dispatcher::new(relay.clone(), queue.clone(), shutdown.clone());
    let mut handles = vec![tokio::spawn(dispatcher.clone().run_producer())];
    for _ in 0..cli.consumers.max(1) {
        handles.push(tokio::spawn(dispatcher.clone().run_consumer()));
    }
    handles.push(tokio::spawn(run_sweeper(relay.clone(), shutdown.clone())));
    handles.push(tokio::spawn(run_stake_refresh(relay.clone(), shutdown.clone())));
    handles.push(tokio::spawn(run_stats(relay.clone(), stats, shutdown.clone())));

    info!("relay-worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.trigger();
    queue.close();

    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), drain)
        .await
        .is_err()
    {
        warn!("background loops did not stop in time");
    }

    info!("relay-worker exited cleanly");
    Ok(())
}
