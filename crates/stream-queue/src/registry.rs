//! Named connection managers shared across a process.

use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::session::Connector;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Process-wide table of [`ConnectionManager`]s keyed by name.
///
/// Producers and consumers that use the same name share one manager and
/// therefore one broker session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    managers: RwLock<HashMap<String, Arc<ConnectionManager>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `manager` under its own name.
    pub fn register(&self, manager: ConnectionManager) -> BrokerResult<Arc<ConnectionManager>> {
        let mut managers = self.managers.write();
        let name = manager.name().to_string();

        if managers.contains_key(&name) {
            return Err(BrokerError::DuplicateConnection(name));
        }

        let manager = Arc::new(manager);
        managers.insert(name.clone(), manager.clone());
        debug!(connection = %name, "Registered connection");
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> BrokerResult<Arc<ConnectionManager>> {
        self.managers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownConnection(name.to_string()))
    }

    /// The Redis-backed manager named `config.name`, created on first use.
    pub fn get_or_create(&self, config: &BrokerConfig) -> BrokerResult<Arc<ConnectionManager>> {
        if let Some(manager) = self.managers.read().get(&config.name) {
            return Ok(manager.clone());
        }

        let options = config.resolve()?;
        Ok(self.insert_if_absent(&config.name, || {
            ConnectionManager::redis(config.name.clone(), options)
        }))
    }

    /// Like [`Self::get_or_create`] but connecting through `connector`.
    pub fn get_or_create_with(
        &self,
        config: &BrokerConfig,
        connector: Arc<dyn Connector>,
    ) -> BrokerResult<Arc<ConnectionManager>> {
        if let Some(manager) = self.managers.read().get(&config.name) {
            return Ok(manager.clone());
        }

        let options = config.resolve()?;
        Ok(self.insert_if_absent(&config.name, || {
            ConnectionManager::new(config.name.clone(), options, connector)
        }))
    }

    fn insert_if_absent(
        &self,
        name: &str,
        build: impl FnOnce() -> ConnectionManager,
    ) -> Arc<ConnectionManager> {
        self.managers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(connection = %name, "Registered connection");
                Arc::new(build())
            })
            .clone()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and forget every registered manager.
    pub async fn close_all(&self) {
        let managers: Vec<Arc<ConnectionManager>> =
            self.managers.write().drain().map(|(_, m)| m).collect();

        for manager in &managers {
            manager.close().await;
        }

        info!(count = managers.len(), "Closed all connections");
    }
}
