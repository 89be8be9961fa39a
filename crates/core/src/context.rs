//! Context domain types — per-agent conversational history.
//!
//! A `Context` is an ordered, append-only sequence of items with a token
//! budget. Appending past the budget evicts the oldest items; the most
//! recent item always survives. `current_tokens` is kept equal to the sum
//! of item tokens at all times.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ContextError;

/// Roles an item in a context can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
    System,
    Tool,
    Event,
    Webhook,
}

/// Estimate the token cost of a piece of text (~4 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

/// A single item in a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    /// Who/what produced this item
    pub role: ItemRole,

    /// The text content
    pub content: String,

    /// String-keyed metadata (adapter, operation, status, ...)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,

    /// When the item was appended
    pub timestamp: DateTime<Utc>,

    /// Approximate token cost of `content`
    pub tokens: u32,
}

impl ContextItem {
    /// Create an item, estimating its token cost from the content.
    pub fn new(role: ItemRole, content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        Self {
            role,
            content,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            tokens,
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A persistent, ordered conversational context for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Immutable context ID
    pub id: String,

    /// Owning agent
    pub agent_id: String,

    /// Model this context targets (or "webhook" for webhook-created ones)
    pub model_id: String,

    /// Ordered items, oldest first
    pub content: Vec<ContextItem>,

    /// Sum of item token costs
    pub current_tokens: u32,

    /// Token budget; appends past this evict oldest items
    pub max_tokens: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(agent_id: impl Into<String>, model_id: impl Into<String>, max_tokens: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            model_id: model_id.into(),
            content: Vec::new(),
            current_tokens: 0,
            max_tokens,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an item, evicting the oldest items until the token budget
    /// fits. The newly appended item is never evicted.
    pub fn push_item(&mut self, item: ContextItem) {
        self.current_tokens += item.tokens;
        self.content.push(item);
        self.updated_at = Utc::now();

        while self.current_tokens > self.max_tokens && self.content.len() > 1 {
            let evicted = self.content.remove(0);
            self.current_tokens -= evicted.tokens;
        }
    }

    /// Invariant check: `current_tokens` equals the sum of item tokens.
    pub fn tokens_consistent(&self) -> bool {
        self.current_tokens == self.content.iter().map(|i| i.tokens).sum::<u32>()
    }
}

/// Options for a context update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Invalidate any read cache for this context after the write.
    pub refresh_cache: bool,
}

/// The persistence interface the core consumes (C7).
///
/// Implementations must make updates to one context linearizable — the
/// bridge relies on a single-writer-per-context guarantee.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Fetch a context by id. `NotFound` if it does not exist.
    async fn get(&self, id: &str) -> std::result::Result<Context, ContextError>;

    /// Persist a new context; returns it with storage-assigned fields set.
    async fn create(&self, ctx: Context) -> std::result::Result<Context, ContextError>;

    /// Replace the stored context under `id`.
    async fn update(
        &self,
        id: &str,
        ctx: Context,
        options: UpdateOptions,
    ) -> std::result::Result<(), ContextError>;

    /// All contexts for an agent, most recently updated first.
    async fn list_for_agent(
        &self,
        agent_id: &str,
    ) -> std::result::Result<Vec<Context>, ContextError>;
}
