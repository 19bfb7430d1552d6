//! Coin Watchdog - live crypto ticker and position watching.
//!
//! This crate keeps a set of per-symbol ticker subscriptions and one
//! account-position subscription alive against a single exchange session,
//! and pushes normalized snapshots to a display.
//!
//! # Architecture
//!
//! - **One loop per subscription**: every symbol, and the account's
//!   positions, is watched by its own tokio task
//! - **Cooperative cancellation**: loops stop at their next suspension
//!   point; an in-flight exchange pull is never interrupted
//! - **Reconciliation**: the provider converges running loops onto a
//!   desired configuration and rebuilds the session when the exchange or
//!   credentials change
//! - **Classified retries**: transient failures back off per error class,
//!   authentication failures stop the loop and are reported once
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use coin_watchdog::config::WatchConfig;
//! use coin_watchdog::connectors::ExchangeRegistry;
//! use coin_watchdog::provider::WatchProvider;
//! use coin_watchdog::DisplayEvent;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<DisplayEvent>();
//!     let mut provider = WatchProvider::new(
//!         Arc::new(ExchangeRegistry::with_defaults()),
//!         Arc::new(event_tx),
//!         WatchConfig::default(),
//!     );
//!     provider.start().await?;
//!
//!     while let Some(event) = event_rx.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectors;
pub mod events;
pub mod provider;
pub mod utils;
pub mod watchers;

// Re-export commonly used types
pub use config::{BackoffPolicy, WatchConfig};
pub use connectors::{Credentials, ExchangeError, ExchangeRegistry, ExchangeSession, SessionFactory};
pub use events::{ControlCommand, DisplayEvent, Position, Ticker, UpdateSink};
pub use provider::{ProviderError, ReconcileReport, WatchProvider};
pub use watchers::{LoopState, SubscribeError};
