//! WebSocket agent session gateway for AgentMesh.
//!
//! Agents connect at `/ws` with `Authorization: Bearer <prefix>.<secret>`.
//! A failed handshake is refused at the HTTP layer — no application frame
//! is ever exchanged with an unauthenticated peer. Each accepted socket
//! gets one reader loop and one writer loop; request handlers run as
//! separate tasks so a slow handler cannot starve the reader, and every
//! handler is cancelled when the connection goes away.
//!
//! Built on Axum for high performance async WebSocket handling.

pub mod connection;
pub mod dispatch;
pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentmesh_adapters::AdapterRegistry;
use agentmesh_config::{AppConfig, GatewayConfig};
use agentmesh_context::ContextBridge;
use agentmesh_core::context::ContextStore;
use agentmesh_core::error::{Error, GatewayError, ResilienceError, Result};
use agentmesh_core::event::{AdapterEventType, meta};
use agentmesh_core::message::{Message, MessageType};
use agentmesh_core::tenant::{ApiKey, KeyStore};
use agentmesh_events::{AdapterEventBus, SystemEventBridge, SystemEventBus};
use agentmesh_security::KeyAuthenticator;
use agentmesh_sessions::{
    CrdtState, SessionManager, TaskBoard, WorkflowCoordinator, WorkspaceManager,
};

use crate::connection::{ConnectionHandle, ConnectionRegistry, OutboundFrame, RateCheck};
use crate::dispatch::Dispatcher;
use crate::frame::BinaryCodec;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub authenticator: KeyAuthenticator,
    pub dispatcher: Dispatcher,
    pub connections: Arc<ConnectionRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub bridge: Arc<ContextBridge<dyn ContextStore>>,
}

pub type SharedState = Arc<GatewayState>;

/// Wire the gateway together: context bridge onto the adapter bus, the
/// system bridge behind it, and the dispatcher over the coordination
/// state.
pub fn build_state(
    config: &AppConfig,
    key_store: Arc<dyn KeyStore>,
    adapters: Arc<AdapterRegistry>,
    context_store: Arc<dyn ContextStore>,
    adapter_bus: &AdapterEventBus,
    system_bus: Arc<SystemEventBus>,
) -> SharedState {
    let bridge: Arc<ContextBridge<dyn ContextStore>> = Arc::new(
        ContextBridge::new(context_store).with_default_max_tokens(config.context.default_max_tokens),
    );

    // Adapter events flow into conversational contexts. Operation
    // success/failure is recorded at the call site with full
    // request/response detail, so only the other event types go through
    // this path.
    let recorder = bridge.clone();
    adapter_bus.register_async("*", "*", Arc::new(move |event| {
        let bridge = recorder.clone();
        Box::pin(async move {
            if matches!(
                event.event_type,
                AdapterEventType::OperationSuccess | AdapterEventType::OperationFailure
            ) {
                return;
            }
            let Some(context_id) = event.meta(meta::CONTEXT_ID) else {
                return;
            };
            if let Err(e) = bridge
                .record_event(&CancellationToken::new(), context_id, &event)
                .await
            {
                warn!(context_id = %context_id, error = %e, "Failed to record adapter event");
            }
        })
    }));

    // One-way bridge onto the system-wide bus.
    let system_bridge = Arc::new(SystemEventBridge::new(system_bus));
    system_bridge.attach(adapter_bus);

    let connections = Arc::new(ConnectionRegistry::new());

    Arc::new(GatewayState {
        config: config.gateway.clone(),
        authenticator: KeyAuthenticator::new(key_store),
        dispatcher: Dispatcher {
            sessions: SessionManager::new(config.session.ttl_seconds),
            tasks: TaskBoard::new(),
            workflows: WorkflowCoordinator::new(),
            workspaces: WorkspaceManager::new(),
            state: CrdtState::new(),
            adapters: adapters.clone(),
            bridge: bridge.clone(),
            connections: connections.clone(),
        },
        connections,
        adapters,
        bridge,
    })
}

/// Build the Axum router with all gateway routes.
///
/// `/ws` authenticates in middleware so a bad key is refused with an
/// HTTP 401 before the upgrade — no application frame is exchanged.
pub fn build_router(state: SharedState) -> Router {
    let ws = Router::new()
        .route("/ws", any(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ws_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/{adapter}/{agent_id}", post(webhook_handler))
        .merge(ws)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(state: SharedState, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await
}

// --- Handshake ---

impl GatewayState {
    /// Authenticate the upgrade request: bearer key plus the optional
    /// `X-Tenant-ID` override (admin keys only).
    pub async fn authenticate_headers(&self, headers: &HeaderMap) -> Result<(ApiKey, String)> {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                Error::from(GatewayError::Unauthorized("missing bearer token".into()))
            })?;

        let key = self.authenticator.authenticate(presented).await?;

        let tenant_override = headers.get("X-Tenant-ID").and_then(|v| v.to_str().ok());
        let tenant = self.authenticator.resolve_tenant(&key, tenant_override)?;
        Ok((key, tenant))
    }

    /// Fan a server-initiated event out to one tenant's connections.
    pub fn broadcast(&self, tenant_id: &str, event: &Message) -> usize {
        self.connections.broadcast(tenant_id, event)
    }
}

// --- Handlers ---

async fn health_handler(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connections.len(),
    }))
}

/// The authenticated identity the ws middleware hands to the handler.
#[derive(Clone)]
struct AuthedConnection {
    key: ApiKey,
    tenant: String,
}

/// Pre-upgrade authentication. A bad key is an HTTP 401 and the socket
/// never opens.
async fn ws_auth_middleware(
    State(state): State<SharedState>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    match state.authenticate_headers(request.headers()).await {
        Ok((key, tenant)) => {
            request
                .extensions_mut()
                .insert(AuthedConnection { key, tenant });
            next.run(request).await
        }
        Err(e) => {
            warn!(error = %e, "WebSocket handshake refused");
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        }
    }
}

async fn ws_handler(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthedConnection>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, auth.key, auth.tenant))
}

/// Inbound webhook ingestion: hand to the adapter, record into the
/// agent's context.
async fn webhook_handler(
    State(state): State<SharedState>,
    Path((adapter, agent_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> std::result::Result<Json<Value>, StatusCode> {
    if state.authenticate_headers(&headers).await.is_err() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("X-Event-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    if let Some(adapter_impl) = state.adapters.get(&adapter).await
        && let Err(e) = adapter_impl.handle_webhook(&event_type, payload.clone()).await
    {
        warn!(adapter = %adapter, error = %e, "Adapter webhook handler failed");
    }

    let context_id = state
        .bridge
        .record_webhook(
            &CancellationToken::new(),
            &agent_id,
            &adapter,
            &event_type,
            &payload,
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to record webhook");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({"context_id": context_id})))
}

// --- Socket lifecycle ---

async fn handle_socket(state: SharedState, socket: WebSocket, key: ApiKey, tenant: String) {
    let (sender, mut outbound) = mpsc::channel::<OutboundFrame>(state.config.send_queue_depth);
    let conn = Arc::new(ConnectionHandle::new(
        &tenant,
        &key,
        sender,
        state.config.binary_threshold,
        state.config.violation_threshold,
        Duration::from_secs(state.config.violation_window_seconds),
    ));
    state.connections.register(conn.clone());
    info!(conn_id = %conn.conn_id, tenant = %tenant, key = %key.key_prefix, "Agent connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer loop: the single serialization point for this connection's
    // outbound bytes.
    let writer_cancel = conn.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = outbound.recv() => {
                    let sent = match frame {
                        Some(OutboundFrame::Text(text)) => ws_tx.send(WsMessage::Text(text.into())).await,
                        Some(OutboundFrame::Binary(bytes)) => ws_tx.send(WsMessage::Binary(bytes.into())).await,
                        None => break,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader loop: decode, rate-check, dispatch.
    while let Some(Ok(ws_message)) = ws_rx.next().await {
        let decoded = match ws_message {
            WsMessage::Text(text) => frame::decode_text(text.as_str()),
            WsMessage::Binary(bytes) => BinaryCodec::decode(&bytes),
            WsMessage::Close(_) => break,
            // Ping/pong is handled by the transport.
            _ => continue,
        };

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %conn.conn_id, error = %e, "Undecodable frame dropped");
                continue;
            }
        };

        if !handle_message(&state, &conn, message) {
            break;
        }
    }

    // Fail all pending handlers, then tear down.
    conn.cancel_all();
    state.connections.remove(&conn.conn_id);
    writer.abort();
    info!(conn_id = %conn.conn_id, "Agent disconnected");
}

/// Handle one decoded inbound message. Returns false to disconnect.
fn handle_message(state: &SharedState, conn: &Arc<ConnectionHandle>, message: Message) -> bool {
    match message.kind {
        MessageType::Request => {
            match conn.check_rate() {
                RateCheck::Allowed => {}
                RateCheck::Limited { disconnect } => {
                    let err = Error::from(GatewayError::RateLimited);
                    let _ = conn.send(&Message::error_response(&message.id, &err));
                    if disconnect {
                        warn!(conn_id = %conn.conn_id, "Repeated rate violations — disconnecting");
                    }
                    return !disconnect;
                }
            }

            let method = message.method.clone().unwrap_or_default();
            if method == "protocol.set_binary" {
                handle_set_binary(conn, &message);
                return true;
            }

            spawn_request(state.clone(), conn.clone(), message, method);
            true
        }
        MessageType::Notification => {
            let method = message.method.clone().unwrap_or_default();
            let state = state.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                let params = message.params.unwrap_or(Value::Null);
                let token = conn.cancel.child_token();
                if let Err(e) = state.dispatcher.dispatch(&conn, &method, params, &token).await {
                    debug!(method = %method, error = %e, "Notification handler failed");
                }
            });
            true
        }
        // The server does not originate requests to agents yet; stray
        // responses are dropped.
        MessageType::Response | MessageType::Error => true,
    }
}

/// The two-phase binary switch. The ack is enqueued under the *current*
/// encoding; only then does the outbound encoder flip. The client flips
/// its own encoder when it receives the ack.
fn handle_set_binary(conn: &Arc<ConnectionHandle>, message: &Message) {
    let params = message.params.clone().unwrap_or(Value::Null);
    let enabled = params
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let threshold = params
        .pointer("/compression/threshold")
        .and_then(Value::as_u64)
        .map(|t| t as usize);

    let ack = Message::response(&message.id, json!({"binary_enabled": enabled}));
    if conn.send(&ack).is_err() {
        return;
    }

    if enabled {
        conn.enable_binary(threshold);
        info!(conn_id = %conn.conn_id, threshold = ?threshold, "Binary protocol enabled");
    } else {
        conn.disable_binary();
    }
}

/// Run one request on the worker pool with a per-request deadline and a
/// cancellation token parented to the connection.
fn spawn_request(state: SharedState, conn: Arc<ConnectionHandle>, message: Message, method: String) {
    let token = conn.begin_request(&message.id);
    let timeout = Duration::from_millis(state.config.request_timeout_ms);

    tokio::spawn(async move {
        let params = message.params.clone().unwrap_or(Value::Null);

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(Error::from(GatewayError::Cancelled)),
            out = tokio::time::timeout(
                timeout,
                state.dispatcher.dispatch(&conn, &method, params, &token),
            ) => match out {
                Ok(result) => result,
                Err(_) => Err(ResilienceError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                }
                .into()),
            },
        };

        let response = match outcome {
            Ok(result) => Message::response(&message.id, result),
            Err(e) => {
                debug!(method = %method, code = e.code(), error = %e, "Request failed");
                Message::error_response(&message.id, &e)
            }
        };

        if let Err(e) = conn.send(&response) {
            warn!(conn_id = %conn.conn_id, error = %e, "Failed to enqueue response");
        }
        conn.finish_request(&message.id);
    });
}
