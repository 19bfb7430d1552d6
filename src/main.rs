//! Coin Watchdog - Main Entry Point
//!
//! Reads newline-delimited JSON control commands from stdin and writes
//! newline-delimited JSON display events to stdout. Logs go to stderr.
//!
//! Usage: `coin-watchdog [config.toml]`

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use coin_watchdog::config::WatchConfig;
use coin_watchdog::connectors::ExchangeRegistry;
use coin_watchdog::events::{ControlCommand, DisplayEvent};
use coin_watchdog::provider::WatchProvider;
use coin_watchdog::utils::{init_telemetry, init_telemetry_json};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Note: No .env file found or error loading it: {}", e);
    }

    if std::env::var("COIN_WATCHDOG_LOG_FORMAT").as_deref() == Ok("json") {
        init_telemetry_json();
    } else {
        init_telemetry();
    }

    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            WatchConfig::from_file(&path).with_context(|| format!("loading {}", path))?
        }
        None => {
            info!("No config file given, using defaults");
            WatchConfig::default()
        }
    };
    config.apply_env_overrides();

    if config.session_credentials().is_none() {
        warn!("No complete API credentials configured");
        warn!("Set COIN_WATCHDOG_API_KEY, COIN_WATCHDOG_API_SECRET and COIN_WATCHDOG_API_PASSPHRASE to watch positions");
    }

    let registry = ExchangeRegistry::with_defaults();
    info!("Supported exchanges: {:?}", registry.exchanges());

    let (event_tx, event_rx) = mpsc::unbounded_channel::<DisplayEvent>();
    let printer = tokio::spawn(print_events(event_rx));

    let mut provider = WatchProvider::new(Arc::new(registry), Arc::new(event_tx), config);
    if let Err(e) = provider.start().await {
        // Stay up: a later `configure` command can still fix this.
        error!("Initial reconciliation failed: {}", e);
    }

    info!("Watching {:?}. Reading commands from stdin.", provider.watched_symbols());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut running = true;

    while running {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ControlCommand>(line) {
                        Ok(command) => running = provider.handle_command(command).await,
                        Err(e) => warn!("Ignoring malformed command {:?}: {}", line, e),
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if running {
        provider.shutdown().await;
    }

    // Dropping the provider closes the event channel and ends the printer.
    drop(provider);
    if let Err(e) = printer.await {
        error!("Event printer task failed: {:?}", e);
    }

    info!("Shut down cleanly");
    Ok(())
}

/// Writes every display event to stdout as one JSON line.
async fn print_events(mut event_rx: mpsc::UnboundedReceiver<DisplayEvent>) {
    let mut stdout = tokio::io::stdout();

    while let Some(event) = event_rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize display event: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = stdout.write_all(&line).await {
            error!("Failed to write to stdout: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}
