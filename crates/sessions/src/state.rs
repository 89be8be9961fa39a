//! CRDT-backed shared counters.
//!
//! Grow-only counters keyed per tenant: each agent owns its own count and
//! the value is the sum, so concurrent increments from different agents
//! merge without coordination. Changes fan out over a broadcast channel
//! for `state.subscribe`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};

use agentmesh_core::error::{GatewayError, Result};

/// Emitted on every increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub tenant_id: String,
    pub key: String,
    pub value: u64,
    pub agent_id: String,
}

/// A grow-only counter: per-agent counts, value is the sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GCounter {
    counts: HashMap<String, u64>,
}

impl GCounter {
    pub fn increment(&mut self, agent_id: &str, amount: u64) {
        *self.counts.entry(agent_id.to_string()).or_insert(0) += amount;
    }

    pub fn value(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Merge another replica: per-agent max, the G-counter join.
    pub fn merge(&mut self, other: &GCounter) {
        for (agent, count) in &other.counts {
            let entry = self.counts.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    pub fn counts(&self) -> &HashMap<String, u64> {
        &self.counts
    }
}

/// All shared counters, keyed `(tenant, key)`.
pub struct CrdtState {
    counters: RwLock<HashMap<String, HashMap<String, GCounter>>>,
    changes: broadcast::Sender<StateChange>,
}

impl CrdtState {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            counters: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Create a counter. Creating an existing key is an error.
    pub async fn create(&self, tenant_id: &str, key: &str) -> Result<()> {
        let mut counters = self.counters.write().await;
        let tenant = counters.entry(tenant_id.to_string()).or_default();
        if tenant.contains_key(key) {
            return Err(
                GatewayError::InvalidParams(format!("state key already exists: {key}")).into(),
            );
        }
        tenant.insert(key.to_string(), GCounter::default());
        Ok(())
    }

    /// Increment and broadcast; returns the merged value.
    pub async fn increment(
        &self,
        tenant_id: &str,
        key: &str,
        agent_id: &str,
        amount: u64,
    ) -> Result<u64> {
        let value = {
            let mut counters = self.counters.write().await;
            let counter = counters
                .get_mut(tenant_id)
                .and_then(|tenant| tenant.get_mut(key))
                .ok_or_else(|| {
                    GatewayError::InvalidParams(format!("state key not found: {key}"))
                })?;
            counter.increment(agent_id, amount);
            counter.value()
        };

        // Nobody listening is fine.
        let _ = self.changes.send(StateChange {
            tenant_id: tenant_id.to_string(),
            key: key.to_string(),
            value,
            agent_id: agent_id.to_string(),
        });

        Ok(value)
    }

    /// Current value and per-agent breakdown.
    pub async fn get(&self, tenant_id: &str, key: &str) -> Result<GCounter> {
        self.counters
            .read()
            .await
            .get(tenant_id)
            .and_then(|tenant| tenant.get(key))
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams(format!("state key not found: {key}")).into())
    }

    /// Subscribe to all state changes (filter by tenant at the receiver).
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

impl Default for CrdtState {
    fn default() -> Self {
        Self::new()
    }
}
