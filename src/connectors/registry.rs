//! Exchange registry.
//!
//! Resolves an exchange identifier to the connector that can build it.
//! Unknown identifiers fail at `validate`, before any running session is
//! touched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::auth::Credentials;
use super::errors::ExchangeError;
use super::okx::{self, OkxConnector};
use super::session::{ExchangeSession, SessionFactory};

/// Connectors keyed by exchange identifier.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    connectors: HashMap<String, Arc<dyn SessionFactory>>,
}

impl ExchangeRegistry {
    /// Registry with every built-in connector.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(okx::EXCHANGE_ID, Arc::new(OkxConnector::default()));
        registry
    }

    pub fn register(&mut self, exchange_id: impl Into<String>, connector: Arc<dyn SessionFactory>) {
        self.connectors.insert(exchange_id.into(), connector);
    }

    /// Supported identifiers, sorted.
    pub fn exchanges(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    fn connector(&self, exchange_id: &str) -> Result<&Arc<dyn SessionFactory>, ExchangeError> {
        self.connectors
            .get(exchange_id)
            .ok_or_else(|| ExchangeError::UnsupportedExchange(exchange_id.to_string()))
    }
}

#[async_trait]
impl SessionFactory for ExchangeRegistry {
    fn validate(&self, exchange_id: &str) -> Result<(), ExchangeError> {
        self.connector(exchange_id)?.validate(exchange_id)
    }

    async fn connect(
        &self,
        exchange_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeSession>, ExchangeError> {
        debug!("[{}] Connecting via registry", exchange_id);
        self.connector(exchange_id)?.connect(exchange_id, credentials).await
    }
}

impl std::fmt::Debug for ExchangeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeRegistry")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}
