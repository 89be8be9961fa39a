//! In-memory context store — the reference `ContextStore` implementation.
//!
//! Updates take the write lock for the whole replace, which is what makes
//! per-context appends linearizable. Production deployments put a real
//! store behind the same trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use agentmesh_core::context::{Context, ContextStore, UpdateOptions};
use agentmesh_core::error::ContextError;

/// Stores contexts in a map guarded by one `RwLock`.
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: Arc<RwLock<HashMap<String, Context>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contexts.
    pub async fn len(&self) -> usize {
        self.contexts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.read().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, id: &str) -> Result<Context, ContextError> {
        self.contexts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(id.to_string()))
    }

    async fn create(&self, ctx: Context) -> Result<Context, ContextError> {
        let mut contexts = self.contexts.write().await;
        if contexts.contains_key(&ctx.id) {
            return Err(ContextError::Storage(format!(
                "context '{}' already exists",
                ctx.id
            )));
        }
        contexts.insert(ctx.id.clone(), ctx.clone());
        Ok(ctx)
    }

    async fn update(
        &self,
        id: &str,
        ctx: Context,
        _options: UpdateOptions,
    ) -> Result<(), ContextError> {
        let mut contexts = self.contexts.write().await;
        if !contexts.contains_key(id) {
            return Err(ContextError::NotFound(id.to_string()));
        }
        contexts.insert(id.to_string(), ctx);
        Ok(())
    }

    async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<Context>, ContextError> {
        let contexts = self.contexts.read().await;
        let mut result: Vec<Context> = contexts
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(result)
    }
}
