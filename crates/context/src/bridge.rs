//! The context bridge — records operations, events, and webhooks into
//! per-agent contexts.
//!
//! Every write follows the same protocol: get the context, build one item,
//! append (token accounting + oldest-first eviction happen in
//! `Context::push_item`), update. The whole protocol runs under the retry
//! primitive; `ContextNotFound` is permanent and fails without retrying.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use agentmesh_core::context::{Context, ContextItem, ContextStore, ItemRole, UpdateOptions};
use agentmesh_core::error::Result;
use agentmesh_core::event::{AdapterEvent, meta};
use agentmesh_resilience::{RetryConfig, RetryPolicy};

use crate::marshal;

/// Token budget for contexts the bridge creates on behalf of webhooks.
const DEFAULT_MAX_TOKENS: u32 = 128_000;

/// Stateless writer into the context store (holds only a retry config).
pub struct ContextBridge<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
    default_max_tokens: u32,
}

impl<S: ContextStore + ?Sized> ContextBridge<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryPolicy::new(RetryConfig {
                max_attempts: 3,
                initial_interval_ms: 100,
                multiplier: 2.0,
                max_interval_ms: 30_000,
                max_elapsed_ms: 30_000,
                jitter: true,
            }),
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_default_max_tokens(mut self, max_tokens: u32) -> Self {
        self.default_max_tokens = max_tokens;
        self
    }

    /// Record an adapter operation (role `tool`).
    pub async fn record_operation(
        &self,
        cancel: &CancellationToken,
        context_id: &str,
        adapter: &str,
        operation: &str,
        request: &Value,
        response: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut document = serde_json::Map::new();
        document.insert("operation".into(), Value::String(operation.into()));
        document.insert("request".into(), request.clone());
        if let Some(response) = response {
            document.insert("response".into(), response.clone());
        }
        if let Some(error) = error {
            document.insert("error".into(), Value::String(error.into()));
        }
        let content = marshal::encode(&Value::Object(document))?;

        let status = if error.is_none() { "success" } else { "failure" };
        let mut item = ContextItem::new(ItemRole::Tool, content)
            .with_meta("adapter", adapter)
            .with_meta("operation", operation)
            .with_meta("status", status)
            .with_meta("timestamp", chrono::Utc::now().to_rfc3339());
        if let Some(error) = error {
            item = item.with_meta("error", error);
        }

        self.append(cancel, context_id, item).await
    }

    /// Record an adapter event (role `event`).
    pub async fn record_event(
        &self,
        cancel: &CancellationToken,
        context_id: &str,
        event: &AdapterEvent,
    ) -> Result<()> {
        let content = marshal::encode(&event.payload)?;
        let item = ContextItem::new(ItemRole::Event, content)
            .with_meta("adapter", &event.adapter_type)
            .with_meta("eventType", event.event_type.as_str())
            .with_meta("eventId", &event.id)
            .with_meta("timestamp", event.timestamp.to_rfc3339());

        self.append(cancel, context_id, item).await
    }

    /// Record a webhook (role `webhook`) into the agent's most recent
    /// context, creating one with `model_id = "webhook"` if the agent has
    /// none. Returns the context id written to.
    pub async fn record_webhook(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
        adapter: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<String> {
        let content = marshal::encode(payload)?;
        let item = ContextItem::new(ItemRole::Webhook, content)
            .with_meta("adapter", adapter)
            .with_meta(meta::EVENT_TYPE, event_type)
            .with_meta("timestamp", chrono::Utc::now().to_rfc3339());

        let store = self.store.as_ref();
        let default_max_tokens = self.default_max_tokens;

        self.retry
            .call(cancel, move |_attempt| {
                let item = item.clone();
                async move {
                    let mut ctx = match store.list_for_agent(agent_id).await?.into_iter().next() {
                        Some(ctx) => ctx,
                        None => {
                            debug!(agent_id = %agent_id, "No context for agent — creating webhook context");
                            store
                                .create(Context::new(agent_id, "webhook", default_max_tokens))
                                .await?
                        }
                    };
                    let id = ctx.id.clone();
                    ctx.push_item(item);
                    store
                        .update(&id, ctx, UpdateOptions { refresh_cache: true })
                        .await?;
                    Ok(id)
                }
            })
            .await
    }

    /// The shared get → append → update protocol, retried on transient
    /// store failures only.
    async fn append(
        &self,
        cancel: &CancellationToken,
        context_id: &str,
        item: ContextItem,
    ) -> Result<()> {
        let store = self.store.as_ref();

        self.retry
            .call(cancel, move |_attempt| {
                let item = item.clone();
                async move {
                    let mut ctx = store.get(context_id).await?;
                    ctx.push_item(item);
                    store
                        .update(context_id, ctx, UpdateOptions { refresh_cache: true })
                        .await?;
                    Ok(())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryContextStore;
    use agentmesh_core::error::ContextError;
    use agentmesh_core::event::AdapterEventType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn bridge_with_context() -> (ContextBridge<InMemoryContextStore>, String) {
        let store = Arc::new(InMemoryContextStore::new());
        let ctx = store
            .create(Context::new("agent-1", "model-a", 10_000))
            .await
            .unwrap();
        (ContextBridge::new(store), ctx.id)
    }

    #[tokio::test]
    async fn operation_appends_exactly_one_item() {
        let (bridge, ctx_id) = bridge_with_context().await;
        let cancel = CancellationToken::new();

        let before = bridge.store.get(&ctx_id).await.unwrap().content.len();
        bridge
            .record_operation(
                &cancel,
                &ctx_id,
                "github",
                "get_repo",
                &json!({"owner": "o", "repo": "r"}),
                Some(&json!({"name": "r"})),
                None,
            )
            .await
            .unwrap();

        let ctx = bridge.store.get(&ctx_id).await.unwrap();
        assert_eq!(ctx.content.len(), before + 1);

        let item = ctx.content.last().unwrap();
        assert_eq!(item.role, ItemRole::Tool);
        assert_eq!(item.metadata.get("status").unwrap(), "success");
        assert_eq!(item.metadata.get("adapter").unwrap(), "github");
        assert!(item.content.contains("get_repo"));
        assert!(ctx.tokens_consistent());
    }

    #[tokio::test]
    async fn failed_operation_records_error_metadata() {
        let (bridge, ctx_id) = bridge_with_context().await;
        bridge
            .record_operation(
                &CancellationToken::new(),
                &ctx_id,
                "github",
                "create_issue",
                &json!({"title": "t"}),
                None,
                Some("upstream 503"),
            )
            .await
            .unwrap();

        let ctx = bridge.store.get(&ctx_id).await.unwrap();
        let item = ctx.content.last().unwrap();
        assert_eq!(item.metadata.get("status").unwrap(), "failure");
        assert_eq!(item.metadata.get("error").unwrap(), "upstream 503");
    }

    #[tokio::test]
    async fn event_recorded_with_event_role() {
        let (bridge, ctx_id) = bridge_with_context().await;
        let event = AdapterEvent::new(
            "xray",
            AdapterEventType::Other("scan.completed".into()),
            json!({"issues": 2}),
        );

        bridge
            .record_event(&CancellationToken::new(), &ctx_id, &event)
            .await
            .unwrap();

        let ctx = bridge.store.get(&ctx_id).await.unwrap();
        let item = ctx.content.last().unwrap();
        assert_eq!(item.role, ItemRole::Event);
        assert_eq!(item.metadata.get("eventType").unwrap(), "scan.completed");
        assert_eq!(item.metadata.get("eventId").unwrap(), &event.id);
    }

    #[tokio::test]
    async fn missing_context_fails_without_retry() {
        let store = Arc::new(InMemoryContextStore::new());
        let bridge = ContextBridge::new(store);

        let err = bridge
            .record_operation(
                &CancellationToken::new(),
                "ghost",
                "github",
                "get_repo",
                &json!({}),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4102);
    }

    #[tokio::test]
    async fn cyclic_request_rejected_before_store_access() {
        let (bridge, ctx_id) = bridge_with_context().await;

        let mut deep = json!("leaf");
        for _ in 0..(marshal::MAX_DEPTH + 10) {
            deep = json!({"inner": deep});
        }

        let err = bridge
            .record_operation(
                &CancellationToken::new(),
                &ctx_id,
                "github",
                "get_repo",
                &deep,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4103);

        // Nothing was appended.
        let ctx = bridge.store.get(&ctx_id).await.unwrap();
        assert!(ctx.content.is_empty());
    }

    #[tokio::test]
    async fn webhook_creates_context_when_agent_has_none() {
        let store = Arc::new(InMemoryContextStore::new());
        let bridge = ContextBridge::new(store.clone());

        let ctx_id = bridge
            .record_webhook(
                &CancellationToken::new(),
                "agent-9",
                "github",
                "push",
                &json!({"ref": "refs/heads/main"}),
            )
            .await
            .unwrap();

        let ctx = store.get(&ctx_id).await.unwrap();
        assert_eq!(ctx.model_id, "webhook");
        assert_eq!(ctx.agent_id, "agent-9");
        assert_eq!(ctx.content.len(), 1);
        assert_eq!(ctx.content[0].role, ItemRole::Webhook);
    }

    #[tokio::test]
    async fn webhook_reuses_most_recent_context() {
        let store = Arc::new(InMemoryContextStore::new());
        let existing = store
            .create(Context::new("agent-9", "model-a", 10_000))
            .await
            .unwrap();
        let bridge = ContextBridge::new(store.clone());

        let ctx_id = bridge
            .record_webhook(
                &CancellationToken::new(),
                "agent-9",
                "github",
                "push",
                &json!({}),
            )
            .await
            .unwrap();
        assert_eq!(ctx_id, existing.id);
        assert_eq!(store.len().await, 1);
    }

    /// Store whose `get` fails transiently a fixed number of times.
    struct FlakyStore {
        inner: InMemoryContextStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl ContextStore for FlakyStore {
        async fn get(&self, id: &str) -> std::result::Result<Context, ContextError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ContextError::Storage("transient outage".into()));
            }
            self.inner.get(id).await
        }

        async fn create(&self, ctx: Context) -> std::result::Result<Context, ContextError> {
            self.inner.create(ctx).await
        }

        async fn update(
            &self,
            id: &str,
            ctx: Context,
            options: UpdateOptions,
        ) -> std::result::Result<(), ContextError> {
            self.inner.update(id, ctx, options).await
        }

        async fn list_for_agent(&self, agent_id: &str) -> std::result::Result<Vec<Context>, ContextError> {
            self.inner.list_for_agent(agent_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_store_failures_are_retried() {
        let inner = InMemoryContextStore::new();
        let ctx = inner
            .create(Context::new("agent-1", "model-a", 10_000))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures_left: AtomicU32::new(2),
        });
        let bridge = ContextBridge::new(store.clone());

        bridge
            .record_operation(
                &CancellationToken::new(),
                &ctx.id,
                "github",
                "get_repo",
                &json!({}),
                None,
                None,
            )
            .await
            .unwrap();

        let stored = store.inner.get(&ctx.id).await.unwrap();
        assert_eq!(stored.content.len(), 1);
    }
}
