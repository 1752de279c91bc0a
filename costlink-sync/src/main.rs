//! costlink-sync - command-line sync client
//!
//! Attaches to the backend over the shared connection and either watches
//! pushed quantity updates or runs one correlated request and prints the
//! result as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use costlink_common::config::{SyncConfig, ENDPOINT_ENV_VAR};
use costlink_common::events::StatusEvent;
use costlink_common::protocol::{InboundFrame, QUANTITY_UPDATE_TYPE};
use costlink_sync::matching::unmatched_codes;
use costlink_sync::SyncHub;
use serde_json::json;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for costlink-sync
#[derive(Parser, Debug)]
#[command(name = "costlink-sync")]
#[command(about = "Real-time quantity sync client for costlink")]
#[command(version)]
struct Args {
    /// Backend WebSocket endpoint (ws:// or wss://)
    #[arg(short, long, env = ENDPOINT_ENV_VAR)]
    endpoint: Option<String>,

    /// Configuration file (defaults to ~/.config/costlink/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay attached and log quantity updates and connection status
    Watch,

    /// Match spreadsheet codes against model codes, with backend confirmation
    Match {
        /// Spreadsheet classification codes
        #[arg(required = true)]
        codes: Vec<String>,

        /// Time to collect pushed quantities before matching
        #[arg(long, default_value = "2000")]
        settle_ms: u64,
    },

    /// Print the model codes the backend knows about
    Codes,

    /// Re-apply costs against the latest model quantities
    Reapply,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "costlink_sync=debug,costlink_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = SyncConfig::load(args.endpoint.as_deref(), args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(endpoint = %config.endpoint_url, "Starting costlink-sync");

    let hub = SyncHub::new(config);
    let _consumer = hub.consumer();

    match args.command {
        Command::Watch => watch(&hub).await,
        Command::Match { codes, settle_ms } => {
            wait_connected(&hub).await?;
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;

            let matches = hub.confirm_matches(&codes).await;
            let output = json!({
                "matches": matches,
                "unmatched": unmatched_codes(&codes, &matches),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Command::Codes => {
            wait_connected(&hub).await?;
            let codes = hub
                .api()
                .available_codes()
                .await
                .context("get_available_codes failed")?;
            println!("{}", serde_json::to_string_pretty(&codes.codes)?);
            Ok(())
        }
        Command::Reapply => {
            wait_connected(&hub).await?;
            let summary = hub
                .api()
                .reapply_costs()
                .await
                .context("reapply_costs failed")?;
            match summary.updated {
                Some(updated) => println!("Costs re-applied ({} items updated)", updated),
                None => println!("Costs re-applied"),
            }
            Ok(())
        }
    }
}

async fn wait_connected(hub: &SyncHub) -> Result<()> {
    let config = hub.connection().config();
    let limit = config.connect_timeout + config.reconnect.max_delay;
    hub.connection()
        .wait_until_connected(limit)
        .await
        .with_context(|| format!("Could not connect to {}", config.endpoint_url))
}

async fn watch(hub: &SyncHub) -> Result<()> {
    let mut status = hub.connection().subscribe_status();

    let subscription = hub
        .dispatcher()
        .subscribe(QUANTITY_UPDATE_TYPE, |frame| {
            if let InboundFrame::QuantityUpdate(update) = frame {
                info!(
                    code = %update.classification_code,
                    quantity = update.quantity,
                    count = ?update.count,
                    source = %update.provenance(),
                    "Quantity update"
                );
            }
            Ok(())
        });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = status.recv() => match event {
                Ok(StatusEvent::ReconnectAbandoned { attempts, .. }) => {
                    error!(attempts, "Backend unreachable; reconnection abandoned");
                }
                Ok(event) => {
                    info!(event = %serde_json::to_string(&event)?, "Status");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    subscription.unsubscribe();
    info!(records = hub.store().len(), "Watch stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
