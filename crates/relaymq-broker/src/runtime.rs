//! Wiring a processor from configuration.

use crate::auth::{AllowAll, Authenticator, StaticAuthenticator};
use crate::config::{BrokerConfig, StoreType};
use crate::processor::ProtocolProcessor;
use anyhow::{Context, Result};
use relaymq_store::{DurableStore, MemoryStore, MemorySubscriptionIndex, SqliteStore};
use std::sync::Arc;

/// Build a processor with the configured store and authenticator.
///
/// # Errors
///
/// Returns error if the SQLite database cannot be opened.
pub fn build_processor(config: BrokerConfig) -> Result<ProtocolProcessor> {
    let store: Arc<dyn DurableStore> = match config.persistence.store_type {
        StoreType::Sqlite => {
            let path = &config.persistence.db_path;
            tracing::info!(path = %path.display(), "Opening SQLite store");
            Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("Failed to open SQLite database {}", path.display()))?,
            )
        }
        StoreType::Memory => {
            tracing::info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let authenticator: Arc<dyn Authenticator> = if config.users.is_empty() {
        Arc::new(AllowAll)
    } else {
        tracing::info!(users = config.users.len(), "Static credentials enabled");
        Arc::new(StaticAuthenticator::new(config.users.clone()))
    };

    Ok(ProtocolProcessor::new(
        config,
        store,
        Arc::new(MemorySubscriptionIndex::new()),
        authenticator,
    ))
}
