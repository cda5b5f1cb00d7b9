//! # botwatch
//!
//! Headless consumer of the dashboard data layer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  botwatch ──► DashboardClient ──► REST API (primary)                    │
//! │                     │                                                   │
//! │                     └──────────► live-query store (secondary, optional) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Configuration comes from `botwatch.toml` and the `BOTWATCH_*` environment
//! variables. Log level via `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use botwatch_core::{
    CorrelationFilter, EventFilter, PerformanceFilter, SnapshotDiff, Trade, TradeFilter,
};
use botwatch_sync::{DashboardClient, DashboardConfig};

#[derive(Parser)]
#[command(name = "botwatch", version, about = "Trading bot dashboard, headless")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Preferences file (defaults to the platform config dir)
    #[arg(long, global = true)]
    preferences: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every entity once
    Snapshot {
        /// Only actively traded correlation pairs
        #[arg(long)]
        active_pairs: bool,

        /// Performance lookback in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Follow trades and events until interrupted
    Watch {
        /// Override the refresh cadence, in seconds
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Ask the bot to reconcile positions with the exchange
    Sync,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = DashboardConfig::load(cli.config).context("loading dashboard config")?;
    let mut builder = DashboardClient::builder(config);
    if let Some(path) = cli.preferences {
        builder = builder.with_preferences_path(path);
    }
    let client = builder.build().map_err(|e| {
        if e.is_config_error() {
            anyhow::anyhow!("{e} (check botwatch.toml and the BOTWATCH_* variables)")
        } else {
            anyhow::Error::new(e).context("building dashboard client")
        }
    })?;

    match cli.command {
        Command::Snapshot { active_pairs, days } => snapshot(&client, active_pairs, days).await,
        Command::Watch { interval } => watch(&client, interval).await,
        Command::Sync => sync(&client).await,
    }
}

fn print_json(label: &str, value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}: {}", label, serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn snapshot(client: &DashboardClient, active_pairs: bool, days: u32) -> anyhow::Result<()> {
    print_json("account", &client.fetch_account().await?)?;
    print_json("trades", &client.fetch_trades(&TradeFilter::default()).await?)?;
    print_json(
        "correlation_pairs",
        &client
            .fetch_correlation_pairs(&CorrelationFilter { active_only: active_pairs })
            .await?,
    )?;
    print_json("events", &client.fetch_events(&EventFilter::default()).await?)?;
    print_json(
        "performance",
        &client
            .fetch_performance(&PerformanceFilter { lookback_days: days })
            .await?,
    )?;
    Ok(())
}

async fn watch(client: &DashboardClient, interval: Option<u64>) -> anyhow::Result<()> {
    if let Some(secs) = interval {
        client.set_refresh_interval(secs)?;
    }

    // Live feeds need the store; without one the refresh loop below still
    // polls the primary.
    let previous: Mutex<Vec<Trade>> = Mutex::default();
    let _trades = client
        .subscribe_trades(
            TradeFilter::open(),
            move |trades| {
                let mut previous = previous.lock().unwrap_or_else(|p| p.into_inner());
                let diff = SnapshotDiff::between(&previous, &trades);
                if !diff.is_empty() {
                    println!(
                        "open trades: {} (+{} ~{} -{})",
                        trades.len(),
                        diff.added.len(),
                        diff.changed.len(),
                        diff.removed.len()
                    );
                }
                *previous = trades;
            },
            |e| warn!(error = %e, "Trade feed lost"),
        )
        .map_err(|e| warn!(error = %e, "Live trades unavailable"))
        .ok();
    let _events = client
        .subscribe_events(
            EventFilter::default(),
            |events| {
                if let Some(latest) = events.first() {
                    println!("[{}] {} {}", latest.timestamp, latest.event_type, latest.message);
                }
            },
            |e| warn!(error = %e, "Event feed lost"),
        )
        .map_err(|e| warn!(error = %e, "Live events unavailable"))
        .ok();
    if let Err(e) = client.start_sync_feed() {
        warn!(error = %e, "Reconciliation feed unavailable");
    }

    let mut status = client.watch_sync_status();
    let mut prefs = client.watch_preferences();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!(every = ?client.preferences().refresh_interval(), "Watching dashboard");
    loop {
        let cadence = client.preferences().refresh_interval();
        tokio::select! {
            _ = &mut shutdown => break,

            _ = tokio::time::sleep(cadence) => {
                match client.fetch_account().await {
                    Ok(account) => println!(
                        "equity {} balance {} positions {}",
                        account.equity, account.balance, account.open_positions
                    ),
                    Err(e) => warn!(error = %e, "Account refresh failed"),
                }
            }

            Ok(()) = status.changed() => {
                let s = status.borrow_and_update().clone();
                println!(
                    "sync: in_sync={} actions={} last={:?}",
                    s.is_in_sync, s.sync_actions, s.last_synced
                );
            }

            // Restarts the sleep above with the new cadence.
            Ok(()) = prefs.changed() => {
                let every = prefs.borrow_and_update().refresh_interval();
                info!(?every, "Refresh cadence changed");
            }
        }
    }

    info!("Watch stopped");
    Ok(())
}

async fn sync(client: &DashboardClient) -> anyhow::Result<()> {
    let outcome = client.trigger_sync().await;
    print_json("outcome", &outcome)?;
    print_json("status", &client.sync_status())?;
    if !outcome.success {
        anyhow::bail!("reconciliation failed: {}", outcome.failure_reason());
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
