//! Connectors to exchanges.
//!
//! The watch loops depend only on the `ExchangeSession` and
//! `SessionFactory` traits. Everything exchange-specific (REST metadata,
//! WebSocket framing, login signing) lives behind them.

mod auth;
mod errors;
pub mod okx;
mod registry;
mod session;
pub mod websocket;

pub use auth::{AuthError, Credentials};
pub use errors::{classify, classify_message, ErrorClass, ExchangeError};
pub use okx::{OkxConnector, OkxEndpoints, OkxSession};
pub use registry::ExchangeRegistry;
pub use session::{
    ensure_ticker_capability,
    search_markets,
    Capabilities,
    ExchangeSession,
    MarketInfo,
    SessionFactory,
    SessionIdentity,
};
