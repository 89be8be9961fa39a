//! Connection state and the tenant-scoped connection registry.
//!
//! A [`ConnectionHandle`] is everything the dispatcher and broadcaster
//! need to talk to one agent: the bounded send queue feeding the writer
//! loop, the binary-encoding switch, the per-connection token bucket, the
//! pending-request map for cancellation, and the subscription set.
//! Encoding is decided at enqueue time, which is what makes the two-phase
//! binary switch safe: the ack is enqueued as text, then the flag flips,
//! so nothing before the ack can arrive in binary form.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentmesh_core::error::{GatewayError, Result};
use agentmesh_core::message::Message;
use agentmesh_core::tenant::ApiKey;
use agentmesh_resilience::TokenBucket;

use crate::frame::{self, BinaryCodec};

/// A frame ready for the writer loop, already encoded.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Outcome of the per-request rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    Allowed,
    /// Over budget; `disconnect` is set once violations within the window
    /// cross the enforcement threshold.
    Limited { disconnect: bool },
}

/// Live state for one authenticated agent connection.
pub struct ConnectionHandle {
    pub conn_id: String,
    pub tenant_id: String,
    pub key_prefix: String,

    agent_id: RwLock<Option<String>>,
    capabilities: RwLock<Vec<String>>,

    binary_enabled: AtomicBool,
    binary_threshold: AtomicUsize,

    subscriptions: RwLock<HashSet<String>>,

    sender: mpsc::Sender<OutboundFrame>,
    pending: Mutex<HashMap<String, CancellationToken>>,

    rate: TokenBucket,
    violations: Mutex<Vec<Instant>>,
    violation_threshold: u32,
    violation_window: Duration,

    /// Cancelled when the connection is going away; parents every
    /// in-flight request token.
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        tenant_id: impl Into<String>,
        key: &ApiKey,
        sender: mpsc::Sender<OutboundFrame>,
        default_binary_threshold: usize,
        violation_threshold: u32,
        violation_window: Duration,
    ) -> Self {
        Self {
            conn_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            key_prefix: key.key_prefix.clone(),
            agent_id: RwLock::new(None),
            capabilities: RwLock::new(Vec::new()),
            binary_enabled: AtomicBool::new(false),
            binary_threshold: AtomicUsize::new(default_binary_threshold),
            subscriptions: RwLock::new(HashSet::new()),
            sender,
            pending: Mutex::new(HashMap::new()),
            rate: TokenBucket::new(key.rate_per_second(), key.rate_limit_requests.max(1)),
            violations: Mutex::new(Vec::new()),
            violation_threshold,
            violation_window,
            cancel: CancellationToken::new(),
        }
    }

    // --- Identity ---

    pub fn register_agent(&self, agent_id: impl Into<String>, capabilities: Vec<String>) {
        *self.agent_id.write().unwrap_or_else(|e| e.into_inner()) = Some(agent_id.into());
        *self.capabilities.write().unwrap_or_else(|e| e.into_inner()) = capabilities;
    }

    /// The registered agent id, falling back to the connection id.
    pub fn agent_id(&self) -> String {
        self.agent_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.conn_id.clone())
    }

    // --- Binary switch ---

    pub fn binary_enabled(&self) -> bool {
        self.binary_enabled.load(Ordering::Acquire)
    }

    pub fn enable_binary(&self, threshold: Option<usize>) {
        if let Some(threshold) = threshold {
            self.binary_threshold.store(threshold, Ordering::Release);
        }
        self.binary_enabled.store(true, Ordering::Release);
    }

    pub fn disable_binary(&self) {
        self.binary_enabled.store(false, Ordering::Release);
    }

    // --- Sending ---

    /// Encode under the current mode and enqueue. `Backpressure` when the
    /// bounded queue is full — the caller decides whether that kills the
    /// connection.
    pub fn send(&self, message: &Message) -> Result<()> {
        let frame = if self.binary_enabled() {
            let codec = BinaryCodec::new(self.binary_threshold.load(Ordering::Acquire));
            OutboundFrame::Binary(codec.encode(message)?)
        } else {
            OutboundFrame::Text(frame::encode_text(message)?)
        };

        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::Backpressure {
                conn_id: self.conn_id.clone(),
            }
            .into(),
            mpsc::error::TrySendError::Closed(_) => GatewayError::Cancelled.into(),
        })
    }

    // --- Rate limiting ---

    /// Check the inbound request against this connection's token bucket.
    pub fn check_rate(&self) -> RateCheck {
        if self.rate.allow() {
            return RateCheck::Allowed;
        }

        let now = Instant::now();
        let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
        violations.retain(|at| now.duration_since(*at) < self.violation_window);
        violations.push(now);

        RateCheck::Limited {
            disconnect: violations.len() as u32 >= self.violation_threshold,
        }
    }

    // --- Pending requests ---

    /// Register an in-flight request; returns its cancellation token,
    /// parented to the connection token.
    pub fn begin_request(&self, request_id: &str) -> CancellationToken {
        let token = self.cancel.child_token();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), token.clone());
        token
    }

    pub fn finish_request(&self, request_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fail every pending handler; called when the connection closes.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        debug!(conn_id = %self.conn_id, pending = pending.len(), "Cancelling in-flight requests");
        pending.clear();
    }

    // --- Subscriptions ---

    pub fn subscribe(&self, event: impl Into<String>) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event.into());
    }

    /// Broadcast relevance: subscribed to the method, or to "all".
    pub fn wants(&self, method: &str) -> bool {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        subscriptions.contains(method) || subscriptions.contains("all")
    }
}

/// All open connections, with tenant-scoped fan-out.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<ConnectionHandle>) {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.conn_id.clone(), conn);
    }

    pub fn remove(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id)
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(conn_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every connection of `tenant_id` subscribed to the
    /// event's method. A slow consumer whose queue overflows is
    /// disconnected rather than blocking the publisher. Returns the
    /// number of queues the event reached.
    pub fn broadcast(&self, tenant_id: &str, event: &Message) -> usize {
        let targets: Vec<Arc<ConnectionHandle>> = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections
                .values()
                .filter(|c| c.tenant_id == tenant_id)
                .filter(|c| {
                    event
                        .method
                        .as_deref()
                        .is_none_or(|method| c.wants(method))
                })
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for conn in targets {
            match conn.send(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        conn_id = %conn.conn_id,
                        error = %e,
                        "Dropping slow consumer on broadcast overflow"
                    );
                    conn.cancel_all();
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn test_key(rate_limit_requests: u32, window: u64) -> ApiKey {
        ApiKey {
            key_prefix: "testpref".into(),
            secret_hash: vec![0; 32],
            tenant_id: "tenant-1".into(),
            key_type: agentmesh_core::tenant::KeyType::Agent,
            scopes: vec![],
            rate_limit_requests,
            rate_limit_window_seconds: window,
            is_active: true,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn handle(
        tenant: &str,
        queue: usize,
        rate: u32,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = Arc::new(ConnectionHandle::new(
            tenant,
            &test_key(rate, 60),
            tx,
            1024,
            3,
            Duration::from_secs(60),
        ));
        (conn, rx)
    }

    #[tokio::test]
    async fn send_text_by_default_then_binary_after_switch() {
        let (conn, mut rx) = handle("tenant-1", 8, 100);
        let message = Message::request("ping", json!({}));

        conn.send(&message).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), OutboundFrame::Text(_)));

        conn.enable_binary(Some(16));
        conn.send(&message).unwrap();
        assert!(matches!(rx.recv().await.unwrap(), OutboundFrame::Binary(_)));
    }

    #[tokio::test]
    async fn queue_overflow_is_backpressure() {
        let (conn, _rx) = handle("tenant-1", 1, 100);
        let message = Message::notification("tick", json!({}));

        conn.send(&message).unwrap();
        let err = conn.send(&message).unwrap_err();
        assert_eq!(err.code(), 5101);
    }

    #[tokio::test]
    async fn rate_check_counts_violations_to_disconnect() {
        // Bucket of 2 with a tiny refill rate.
        let (conn, _rx) = handle("tenant-1", 8, 2);

        assert_eq!(conn.check_rate(), RateCheck::Allowed);
        assert_eq!(conn.check_rate(), RateCheck::Allowed);
        assert_eq!(
            conn.check_rate(),
            RateCheck::Limited { disconnect: false }
        );
        assert_eq!(
            conn.check_rate(),
            RateCheck::Limited { disconnect: false }
        );
        // Third violation crosses the threshold of 3.
        assert_eq!(conn.check_rate(), RateCheck::Limited { disconnect: true });
    }

    #[tokio::test]
    async fn pending_requests_cancelled_on_close() {
        let (conn, _rx) = handle("tenant-1", 8, 100);
        let token = conn.begin_request("r1");
        assert_eq!(conn.pending_count(), 1);
        assert!(!token.is_cancelled());

        conn.cancel_all();
        assert!(token.is_cancelled());
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_is_tenant_isolated() {
        let registry = ConnectionRegistry::new();
        let (conn_a, mut rx_a) = handle("tenant-1", 8, 100);
        let (conn_b, mut rx_b) = handle("tenant-2", 8, 100);
        conn_a.subscribe("all");
        conn_b.subscribe("all");
        registry.register(conn_a);
        registry.register(conn_b);

        let event = Message::notification("task.created", json!({"id": "t1"}));
        let delivered = registry.broadcast("tenant-1", &event);
        assert_eq!(delivered, 1);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_respects_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (subscribed, mut rx_sub) = handle("tenant-1", 8, 100);
        let (other, mut rx_other) = handle("tenant-1", 8, 100);
        subscribed.subscribe("state.changed");
        other.subscribe("task.created");
        registry.register(subscribed);
        registry.register(other);

        let event = Message::notification("state.changed", json!({"key": "k"}));
        assert_eq!(registry.broadcast("tenant-1", &event), 1);
        assert!(rx_sub.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_disconnected_not_blocking() {
        let registry = ConnectionRegistry::new();
        let (slow, _rx) = handle("tenant-1", 1, 100);
        slow.subscribe("all");
        let slow2 = slow.clone();
        registry.register(slow);

        let event = Message::notification("tick", json!({}));
        assert_eq!(registry.broadcast("tenant-1", &event), 1); // fills the queue
        assert_eq!(registry.broadcast("tenant-1", &event), 0); // overflow

        assert!(slow2.cancel.is_cancelled());
    }
}
