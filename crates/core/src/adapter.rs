//! Adapter trait — the contract every external integration implements.
//!
//! An adapter exposes a small set of operations against one external
//! system (source control, CI/CD, LLM provider, artifact scanner, ...).
//! The invocation engine supplies resilience, credentials, and caching;
//! adapter bodies only translate operations into upstream requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::AdapterError;
use crate::event::AdapterEvent;

/// Health of an adapter, as last observed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for AdapterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterHealth::Healthy => "healthy",
            AdapterHealth::Degraded => "degraded",
            AdapterHealth::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Upstream rate-limit metadata surfaced from `X-RateLimit-*` headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Epoch seconds at which the window resets.
    pub reset: Option<i64>,
    pub used: Option<u64>,
}

/// The canonical adapter contract.
///
/// One implementation per external system; no duplicated bodies. Mutating
/// operations (anything `is_safe_operation` returns false for) pass through
/// the engine's safety policy before any upstream request is issued.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The unique adapter name (e.g. "github", "harness").
    fn name(&self) -> &str;

    /// Initialize against the upstream (credential checks, warmup).
    async fn init(&self) -> std::result::Result<(), AdapterError>;

    /// Read-only data fetch.
    async fn get_data(&self, query: Value) -> std::result::Result<Value, AdapterError>;

    /// Execute a named operation. `context_id` links the call to a
    /// conversational context for event recording.
    async fn execute_action(
        &self,
        context_id: Option<&str>,
        operation: &str,
        params: Value,
    ) -> std::result::Result<Value, AdapterError>;

    /// Whether the named operation is read-only. Mutating operations are
    /// gated by the safety policy.
    fn is_safe_operation(&self, operation: &str) -> bool;

    /// Subscribe to this adapter's event stream.
    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    /// Ingest an inbound webhook for this adapter.
    async fn handle_webhook(
        &self,
        event_type: &str,
        payload: Value,
    ) -> std::result::Result<(), AdapterError>;

    /// Current health, probed against the upstream.
    async fn health(&self) -> AdapterHealth;

    /// Release any held resources.
    async fn close(&self) -> std::result::Result<(), AdapterError>;
}
