//! Registry of named pools, e.g. one per database role.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::adapter::SessionFactory;
use crate::config::PoolConfig;
use crate::error::SqlCoordinatorError;
use crate::pool::ConnectionPool;

#[derive(Debug, Default)]
pub struct ConnectionHandler {
    pools: RwLock<HashMap<String, ConnectionPool>>,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under `name`, replacing (and disconnecting) any previous one.
    ///
    /// # Errors
    /// Returns `ConfigError` for an invalid configuration.
    pub async fn establish(
        &self,
        name: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<ConnectionPool, SqlCoordinatorError> {
        let name = name.into();
        let pool = ConnectionPool::new(config, factory)?;
        let replaced = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), pool.clone());
        if let Some(old) = replaced {
            debug!(pool = %name, "replacing established pool");
            old.disconnect_all().await;
        }
        Ok(pool)
    }

    /// # Errors
    /// Returns `ConnectionNotEstablished` when nothing is registered under `name`.
    pub fn retrieve(&self, name: &str) -> Result<ConnectionPool, SqlCoordinatorError> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SqlCoordinatorError::ConnectionNotEstablished(format!(
                    "no connection pool established for '{name}'"
                ))
            })
    }

    /// Unregister `name`, closing its idle connections. Returns the removed pool's config.
    pub async fn remove(&self, name: &str) -> Option<PoolConfig> {
        let pool = self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)?;
        pool.disconnect_all().await;
        Some(pool.config().clone())
    }

    #[must_use]
    pub fn is_established(&self, name: &str) -> bool {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Whether `name` is registered and holds at least one live connection.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.retrieve(name).is_ok_and(|pool| pool.is_connected())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Disconnect every registered pool. The pools stay registered and reconnect lazily.
    pub async fn clear_all(&self) {
        let pools: Vec<ConnectionPool> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for pool in pools {
            pool.disconnect_all().await;
        }
    }
}
