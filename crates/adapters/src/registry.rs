//! Adapter registry — name→factory map producing live adapters.
//!
//! Registration happens at startup or during controlled hot-reload;
//! lookups are the hot path. The registry initializes adapters on create
//! and keeps the last observed health per adapter.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use agentmesh_core::adapter::{Adapter, AdapterHealth};
use agentmesh_core::error::{AdapterError, Result};

/// Produces a fresh adapter instance.
pub type AdapterFactory = Arc<dyn Fn() -> Result<Arc<dyn Adapter>> + Send + Sync>;

/// Central registry of adapter factories and live instances.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: RwLock<HashMap<String, AdapterFactory>>,
    live: RwLock<HashMap<String, Arc<dyn Adapter>>>,
    health: RwLock<HashMap<String, AdapterHealth>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name. Replaces any existing factory.
    pub async fn register(&self, name: impl Into<String>, factory: AdapterFactory) {
        let name = name.into();
        info!(adapter = %name, "Registered adapter factory");
        self.factories.write().await.insert(name, factory);
    }

    /// Produce (and initialize) a live adapter, replacing any previous
    /// instance under that name.
    pub async fn create(&self, name: &str) -> Result<Arc<dyn Adapter>> {
        let factory = {
            let factories = self.factories.read().await;
            factories
                .get(name)
                .cloned()
                .ok_or_else(|| AdapterError::NotRegistered(name.to_string()))?
        };

        let adapter = factory()?;
        adapter.init().await?;

        self.live
            .write()
            .await
            .insert(name.to_string(), adapter.clone());
        self.health
            .write()
            .await
            .insert(name.to_string(), AdapterHealth::Healthy);
        info!(adapter = %name, "Adapter initialized");
        Ok(adapter)
    }

    /// A live adapter by name, if one has been created.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.live.read().await.get(name).cloned()
    }

    /// Live adapter, creating it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<dyn Adapter>> {
        if let Some(adapter) = self.get(name).await {
            return Ok(adapter);
        }
        self.create(name).await
    }

    /// All registered factory names.
    pub async fn names(&self) -> Vec<String> {
        self.factories.read().await.keys().cloned().collect()
    }

    /// Probe every live adapter, store and return the results.
    pub async fn health_all(&self) -> HashMap<String, AdapterHealth> {
        let live: Vec<(String, Arc<dyn Adapter>)> = {
            let live = self.live.read().await;
            live.iter().map(|(n, a)| (n.clone(), a.clone())).collect()
        };

        let mut results = HashMap::new();
        for (name, adapter) in live {
            let status = adapter.health().await;
            results.insert(name, status);
        }

        *self.health.write().await = results.clone();
        results
    }

    /// Last observed health for one adapter.
    pub async fn health_of(&self, name: &str) -> Option<AdapterHealth> {
        self.health.read().await.get(name).copied()
    }

    /// Close all live adapters (shutdown or reload).
    pub async fn close_all(&self) {
        let mut live = self.live.write().await;
        for (name, adapter) in live.drain() {
            if let Err(e) = adapter.close().await {
                warn!(adapter = %name, error = %e, "Failed to close adapter");
            }
        }
    }
}
