//! Method dispatch — the canonical method set.
//!
//! Every inbound Request resolves here by `method` name. Handlers take
//! the connection (for tenant scope and agent identity), the params
//! value, and the request's cancellation token, and return the result
//! value for the Response. Unknown methods are `MethodNotFound`.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use agentmesh_adapters::AdapterRegistry;
use agentmesh_context::ContextBridge;
use agentmesh_core::adapter::Adapter;
use agentmesh_core::context::ContextStore;
use agentmesh_core::error::{GatewayError, Result, SessionError};
use agentmesh_core::message::Message;
use agentmesh_sessions::{
    CrdtState, SessionManager, TaskBoard, WorkflowCoordinator, WorkspaceManager,
};

use crate::connection::{ConnectionHandle, ConnectionRegistry};

/// Everything the method handlers operate on.
pub struct Dispatcher {
    pub sessions: SessionManager,
    pub tasks: TaskBoard,
    pub workflows: WorkflowCoordinator,
    pub workspaces: WorkspaceManager,
    pub state: CrdtState,
    pub adapters: Arc<AdapterRegistry>,
    pub bridge: Arc<ContextBridge<dyn ContextStore>>,
    pub connections: Arc<ConnectionRegistry>,
}

fn str_param(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| GatewayError::InvalidParams(format!("missing string param '{key}'")).into())
}

fn opt_str_param(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(String::from)
}

impl Dispatcher {
    /// Route one request. `protocol.set_binary` never reaches this point —
    /// the connection loop owns the encoder switch.
    pub async fn dispatch(
        &self,
        conn: &Arc<ConnectionHandle>,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        match method {
            "ping" => Ok(json!({"pong": true, "ts": chrono::Utc::now().to_rfc3339()})),

            "agent.register" => self.agent_register(conn, params),

            // --- Sessions ---
            "session.create" => {
                let initial = params.get("state").cloned().unwrap_or_else(|| json!({}));
                let session = self
                    .sessions
                    .create(&conn.tenant_id, conn.agent_id(), initial)
                    .await;
                Ok(serde_json::to_value(session)?)
            }
            "session.update_state" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                let state = params
                    .get("state")
                    .cloned()
                    .ok_or_else(|| GatewayError::InvalidParams("missing 'state'".into()))?;
                Ok(serde_json::to_value(
                    self.sessions.update_state(&id, state).await?,
                )?)
            }
            "session.get" => {
                let id = str_param(&params, "session_id")?;
                Ok(serde_json::to_value(self.tenant_session(conn, &id).await?)?)
            }
            "session.add_message" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                let role = opt_str_param(&params, "role").unwrap_or_else(|| "user".into());
                let content = str_param(&params, "content")?;
                let message = self.sessions.add_message(&id, role, content).await?;
                Ok(serde_json::to_value(message)?)
            }
            "session.get_history" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                let limit = params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|l| l as usize);
                let messages = self.sessions.get_history(&id, limit).await?;
                Ok(json!({"messages": messages}))
            }
            "session.branch" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                let branch_point = params
                    .get("branch_point")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        GatewayError::InvalidParams("missing integer 'branch_point'".into())
                    })? as usize;
                Ok(serde_json::to_value(
                    self.sessions.branch(&id, branch_point).await?,
                )?)
            }
            "session.recover" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                Ok(serde_json::to_value(self.sessions.recover(&id).await?)?)
            }
            "session.set_active" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                Ok(serde_json::to_value(self.sessions.set_active(&id).await?)?)
            }
            "session.list" => {
                let agent = opt_str_param(&params, "agent_id");
                let sessions = self
                    .sessions
                    .list(&conn.tenant_id, agent.as_deref())
                    .await;
                Ok(json!({"sessions": sessions}))
            }
            "session.get_metrics" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                Ok(serde_json::to_value(self.sessions.get_metrics(&id).await?)?)
            }
            "session.export" => {
                let id = str_param(&params, "session_id")?;
                self.tenant_session(conn, &id).await?;
                self.sessions.export(&id).await
            }

            // --- Tasks ---
            "task.create" => {
                let title = str_param(&params, "title")?;
                let payload = params.get("payload").cloned().unwrap_or_else(|| json!({}));
                let task = self
                    .tasks
                    .create(&conn.tenant_id, conn.agent_id(), title, payload)
                    .await;
                self.notify(conn, "task.created", json!({"task_id": task.id}));
                Ok(serde_json::to_value(task)?)
            }
            "task.delegate" => {
                let id = str_param(&params, "task_id")?;
                let assignee = str_param(&params, "assignee")?;
                self.tenant_task(conn, &id).await?;
                let task = self.tasks.delegate(&id, assignee).await?;
                self.notify(conn, "task.delegated", json!({"task_id": task.id}));
                Ok(serde_json::to_value(task)?)
            }
            "task.accept" => {
                let id = str_param(&params, "task_id")?;
                self.tenant_task(conn, &id).await?;
                Ok(serde_json::to_value(
                    self.tasks.accept(&id, &conn.agent_id()).await?,
                )?)
            }
            "task.complete" => {
                let id = str_param(&params, "task_id")?;
                let result = params.get("result").cloned().unwrap_or(Value::Null);
                self.tenant_task(conn, &id).await?;
                let task = self
                    .tasks
                    .complete(&id, &conn.agent_id(), result)
                    .await?;
                self.notify(conn, "task.completed", json!({"task_id": task.id}));
                Ok(serde_json::to_value(task)?)
            }

            // --- Workflows ---
            "workflow.create" => {
                let name = str_param(&params, "name")?;
                let steps: Vec<String> = params
                    .get("steps")
                    .and_then(Value::as_array)
                    .map(|steps| {
                        steps
                            .iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                let workflow = self
                    .workflows
                    .create(&conn.tenant_id, name, steps)
                    .await?;
                Ok(serde_json::to_value(workflow)?)
            }
            "workflow.start" => {
                let id = str_param(&params, "workflow_id")?;
                self.tenant_workflow(conn, &id).await?;
                Ok(serde_json::to_value(self.workflows.start(&id).await?)?)
            }
            "workflow.step.complete" => {
                let id = str_param(&params, "workflow_id")?;
                let step = str_param(&params, "step")?;
                let result = params.get("result").cloned().unwrap_or(Value::Null);
                self.tenant_workflow(conn, &id).await?;
                let workflow = self
                    .workflows
                    .complete_step(&id, &step, &conn.agent_id(), result)
                    .await?;
                Ok(serde_json::to_value(workflow)?)
            }

            // --- Workspaces & documents ---
            "workspace.create" => {
                let name = str_param(&params, "name")?;
                let workspace = self
                    .workspaces
                    .create(&conn.tenant_id, name, conn.agent_id())
                    .await;
                Ok(serde_json::to_value(workspace)?)
            }
            "workspace.join" => {
                let id = str_param(&params, "workspace_id")?;
                self.tenant_workspace(conn, &id).await?;
                Ok(serde_json::to_value(
                    self.workspaces.join(&id, conn.agent_id()).await?,
                )?)
            }
            "document.create" => {
                let workspace_id = str_param(&params, "workspace_id")?;
                self.tenant_workspace(conn, &workspace_id).await?;
                let title = str_param(&params, "title")?;
                let content = opt_str_param(&params, "content").unwrap_or_default();
                Ok(serde_json::to_value(
                    self.workspaces
                        .create_document(&workspace_id, title, content)
                        .await?,
                )?)
            }
            "document.edit" => {
                let id = str_param(&params, "document_id")?;
                let append = str_param(&params, "append")?;
                let expected = params
                    .get("expected_version")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32);
                let document = self.workspaces.get_document(&id).await?;
                self.tenant_workspace(conn, &document.workspace_id).await?;
                let document = self.workspaces.edit_document(&id, &append, expected).await?;
                Ok(serde_json::to_value(document)?)
            }

            // --- Shared CRDT state ---
            "state.create" => {
                let key = str_param(&params, "key")?;
                self.state.create(&conn.tenant_id, &key).await?;
                Ok(json!({"key": key, "value": 0}))
            }
            "state.subscribe" => {
                conn.subscribe("state.changed");
                Ok(json!({"subscribed": true}))
            }
            "state.increment" => {
                let key = str_param(&params, "key")?;
                let amount = params.get("amount").and_then(Value::as_u64).unwrap_or(1);
                let agent = conn.agent_id();
                let value = self
                    .state
                    .increment(&conn.tenant_id, &key, &agent, amount)
                    .await?;
                self.notify(
                    conn,
                    "state.changed",
                    json!({"key": key, "value": value, "agent_id": agent}),
                );
                Ok(json!({"key": key, "value": value}))
            }
            "state.get" => {
                let key = str_param(&params, "key")?;
                let counter = self.state.get(&conn.tenant_id, &key).await?;
                Ok(json!({"key": key, "value": counter.value(), "counts": counter.counts()}))
            }

            // --- Adapter invocation ---
            "tool.execute" => self.tool_execute(conn, params, cancel).await,
            "embedding.generate" => {
                let adapter = self.resolve_adapter(&params).await?;
                adapter
                    .execute_action(None, "generate_embedding", params)
                    .await
                    .map_err(Into::into)
            }

            other => Err(GatewayError::MethodNotFound(other.to_string()).into()),
        }
    }

    fn agent_register(&self, conn: &Arc<ConnectionHandle>, params: Value) -> Result<Value> {
        let agent_id = str_param(&params, "agent_id")?;
        let capabilities: Vec<String> = params
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        conn.register_agent(&agent_id, capabilities);
        Ok(json!({"agent_id": agent_id, "conn_id": conn.conn_id}))
    }

    async fn tool_execute(
        &self,
        _conn: &Arc<ConnectionHandle>,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let name = str_param(&params, "name")?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let context_id = opt_str_param(&params, "context_id");

        let adapter = self.resolve_adapter(&params).await?;
        let outcome = adapter
            .execute_action(context_id.as_deref(), &name, arguments.clone())
            .await;

        // Record the operation into its context; a recording failure never
        // changes the call outcome.
        if let Some(context_id) = &context_id {
            let (response, error) = match &outcome {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(e.to_string())),
            };
            if let Err(e) = self
                .bridge
                .record_operation(
                    cancel,
                    context_id,
                    adapter.name(),
                    &name,
                    &arguments,
                    response,
                    error.as_deref(),
                )
                .await
            {
                warn!(context_id = %context_id, error = %e, "Failed to record operation");
            }
        }

        outcome.map_err(Into::into)
    }

    /// Adapter from the `adapter` param, or the only registered one.
    async fn resolve_adapter(&self, params: &Value) -> Result<Arc<dyn Adapter>> {
        if let Some(name) = opt_str_param(params, "adapter") {
            return self.adapters.get_or_create(&name).await;
        }

        let names = self.adapters.names().await;
        match names.as_slice() {
            [only] => self.adapters.get_or_create(only).await,
            [] => Err(GatewayError::InvalidParams("no adapters registered".into()).into()),
            _ => Err(GatewayError::InvalidParams(
                "multiple adapters registered; 'adapter' param required".into(),
            )
            .into()),
        }
    }

    /// Fan a notification out to the connection's tenant.
    fn notify(&self, conn: &Arc<ConnectionHandle>, method: &str, params: Value) {
        let event = Message::notification(method, params);
        self.connections.broadcast(&conn.tenant_id, &event);
    }

    // --- Tenant scoping. Cross-tenant ids read as "not found". ---

    async fn tenant_session(
        &self,
        conn: &Arc<ConnectionHandle>,
        id: &str,
    ) -> Result<agentmesh_sessions::Session> {
        let session = self.sessions.get(id).await?;
        if session.tenant_id != conn.tenant_id {
            return Err(SessionError::NotFound(id.to_string()).into());
        }
        Ok(session)
    }

    async fn tenant_task(&self, conn: &Arc<ConnectionHandle>, id: &str) -> Result<()> {
        let task = self.tasks.get(id).await?;
        if task.tenant_id != conn.tenant_id {
            return Err(GatewayError::InvalidParams(format!("task not found: {id}")).into());
        }
        Ok(())
    }

    async fn tenant_workflow(&self, conn: &Arc<ConnectionHandle>, id: &str) -> Result<()> {
        let workflow = self.workflows.get(id).await?;
        if workflow.tenant_id != conn.tenant_id {
            return Err(GatewayError::InvalidParams(format!("workflow not found: {id}")).into());
        }
        Ok(())
    }

    async fn tenant_workspace(&self, conn: &Arc<ConnectionHandle>, id: &str) -> Result<()> {
        let workspace = self.workspaces.get(id).await?;
        if workspace.tenant_id != conn.tenant_id {
            return Err(GatewayError::InvalidParams(format!("workspace not found: {id}")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_context::InMemoryContextStore;
    use agentmesh_core::adapter::AdapterHealth;
    use agentmesh_core::context::Context;
    use agentmesh_core::error::AdapterError;
    use agentmesh_core::event::AdapterEvent;
    use agentmesh_core::tenant::{ApiKey, KeyType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    use crate::connection::OutboundFrame;

    struct StubAdapter {
        events: broadcast::Sender<AdapterEvent>,
    }

    impl StubAdapter {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(8);
            Arc::new(Self { events })
        }
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn name(&self) -> &str {
            "github"
        }

        async fn init(&self) -> std::result::Result<(), AdapterError> {
            Ok(())
        }

        async fn get_data(&self, _query: Value) -> std::result::Result<Value, AdapterError> {
            Ok(json!({}))
        }

        async fn execute_action(
            &self,
            _context_id: Option<&str>,
            operation: &str,
            params: Value,
        ) -> std::result::Result<Value, AdapterError> {
            if !self.is_safe_operation(operation) {
                return Err(AdapterError::Restricted {
                    adapter: "github".into(),
                    operation: operation.into(),
                    reason: "prefix rule".into(),
                });
            }
            Ok(json!({"operation": operation, "echo": params}))
        }

        fn is_safe_operation(&self, operation: &str) -> bool {
            !operation.starts_with("delete_")
        }

        fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
            self.events.subscribe()
        }

        async fn handle_webhook(
            &self,
            _event_type: &str,
            _payload: Value,
        ) -> std::result::Result<(), AdapterError> {
            Ok(())
        }

        async fn health(&self) -> AdapterHealth {
            AdapterHealth::Healthy
        }

        async fn close(&self) -> std::result::Result<(), AdapterError> {
            Ok(())
        }
    }

    fn test_key(tenant: &str) -> ApiKey {
        ApiKey {
            key_prefix: "testpref".into(),
            secret_hash: vec![0; 32],
            tenant_id: tenant.into(),
            key_type: KeyType::Agent,
            scopes: vec![],
            rate_limit_requests: 1_000,
            rate_limit_window_seconds: 1,
            is_active: true,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<InMemoryContextStore>,
    }

    async fn fixture() -> Fixture {
        let adapters = Arc::new(AdapterRegistry::new());
        let stub = StubAdapter::new();
        adapters
            .register("github", Arc::new(move || Ok(stub.clone() as Arc<dyn Adapter>)))
            .await;

        let store: Arc<InMemoryContextStore> = Arc::new(InMemoryContextStore::new());
        let bridge: Arc<ContextBridge<dyn ContextStore>> =
            Arc::new(ContextBridge::new(store.clone() as Arc<dyn ContextStore>));

        Fixture {
            dispatcher: Dispatcher {
                sessions: SessionManager::new(3_600),
                tasks: TaskBoard::new(),
                workflows: WorkflowCoordinator::new(),
                workspaces: WorkspaceManager::new(),
                state: CrdtState::new(),
                adapters,
                bridge,
                connections: Arc::new(ConnectionRegistry::new()),
            },
            store,
        }
    }

    fn conn_for(
        fixture: &Fixture,
        tenant: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ConnectionHandle::new(
            tenant,
            &test_key(tenant),
            tx,
            1024,
            10,
            Duration::from_secs(60),
        ));
        fixture.dispatcher.connections.register(conn.clone());
        (conn, rx)
    }

    async fn call(
        fixture: &Fixture,
        conn: &Arc<ConnectionHandle>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        fixture
            .dispatcher
            .dispatch(conn, method, params, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");
        let err = call(&fx, &conn, "no.such.method", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4003);
    }

    #[tokio::test]
    async fn session_create_get_roundtrip_law() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let created = call(&fx, &conn, "session.create", json!({"state": {"goal": "g"}}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let fetched = call(&fx, &conn, "session.get", json!({"session_id": id}))
            .await
            .unwrap();
        assert_eq!(fetched["id"], created["id"]);
        assert_eq!(fetched["state_data"]["goal"], "g");
        assert_eq!(fetched["state"], "active");
    }

    #[tokio::test]
    async fn add_message_history_in_order_law() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let session = call(&fx, &conn, "session.create", json!({})).await.unwrap();
        let id = session["id"].as_str().unwrap();

        for i in 0..3 {
            call(
                &fx,
                &conn,
                "session.add_message",
                json!({"session_id": id, "content": format!("m{i}")}),
            )
            .await
            .unwrap();
        }

        let history = call(
            &fx,
            &conn,
            "session.get_history",
            json!({"session_id": id, "limit": 3}),
        )
        .await
        .unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message["content"], format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn cross_tenant_session_reads_as_not_found() {
        let fx = fixture().await;
        let (conn_a, _rx_a) = conn_for(&fx, "tenant-1");
        let (conn_b, _rx_b) = conn_for(&fx, "tenant-2");

        let session = call(&fx, &conn_a, "session.create", json!({})).await.unwrap();
        let id = session["id"].as_str().unwrap();

        let err = call(&fx, &conn_b, "session.get", json!({"session_id": id}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn task_lifecycle_via_methods() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");
        call(&fx, &conn, "agent.register", json!({"agent_id": "worker-1"}))
            .await
            .unwrap();

        let task = call(&fx, &conn, "task.create", json!({"title": "scan"}))
            .await
            .unwrap();
        let id = task["id"].as_str().unwrap();

        call(
            &fx,
            &conn,
            "task.delegate",
            json!({"task_id": id, "assignee": "worker-1"}),
        )
        .await
        .unwrap();
        call(&fx, &conn, "task.accept", json!({"task_id": id}))
            .await
            .unwrap();
        let done = call(
            &fx,
            &conn,
            "task.complete",
            json!({"task_id": id, "result": {"ok": true}}),
        )
        .await
        .unwrap();
        assert_eq!(done["status"], "completed");
    }

    #[tokio::test]
    async fn workflow_and_workspace_methods() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let workflow = call(
            &fx,
            &conn,
            "workflow.create",
            json!({"name": "rel", "steps": ["build", "ship"]}),
        )
        .await
        .unwrap();
        let wf_id = workflow["id"].as_str().unwrap();
        call(&fx, &conn, "workflow.start", json!({"workflow_id": wf_id}))
            .await
            .unwrap();
        let after = call(
            &fx,
            &conn,
            "workflow.step.complete",
            json!({"workflow_id": wf_id, "step": "build"}),
        )
        .await
        .unwrap();
        assert_eq!(after["current_step"], 1);

        let workspace = call(&fx, &conn, "workspace.create", json!({"name": "w"}))
            .await
            .unwrap();
        let ws_id = workspace["id"].as_str().unwrap();
        let document = call(
            &fx,
            &conn,
            "document.create",
            json!({"workspace_id": ws_id, "title": "notes", "content": "a"}),
        )
        .await
        .unwrap();
        let edited = call(
            &fx,
            &conn,
            "document.edit",
            json!({"document_id": document["id"], "append": "b"}),
        )
        .await
        .unwrap();
        assert_eq!(edited["version"], 2);
        assert_eq!(edited["content"], "ab");
    }

    #[tokio::test]
    async fn state_increment_broadcasts_to_subscribers() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");
        let (watcher, mut watcher_rx) = conn_for(&fx, "tenant-1");
        let (outsider, mut outsider_rx) = conn_for(&fx, "tenant-2");

        call(&fx, &watcher, "state.subscribe", json!({})).await.unwrap();
        call(&fx, &outsider, "state.subscribe", json!({})).await.unwrap();

        call(&fx, &conn, "state.create", json!({"key": "done"}))
            .await
            .unwrap();
        let result = call(
            &fx,
            &conn,
            "state.increment",
            json!({"key": "done", "amount": 2}),
        )
        .await
        .unwrap();
        assert_eq!(result["value"], 2);

        // Same-tenant subscriber got the notification.
        let frame = watcher_rx.try_recv().unwrap();
        let OutboundFrame::Text(raw) = frame else {
            panic!("expected text frame")
        };
        assert!(raw.contains("state.changed"));

        // The other tenant saw nothing.
        assert!(outsider_rx.try_recv().is_err());

        let got = call(&fx, &conn, "state.get", json!({"key": "done"}))
            .await
            .unwrap();
        assert_eq!(got["value"], 2);
    }

    #[tokio::test]
    async fn tool_execute_happy_path_records_context() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let ctx = fx
            .store
            .create(Context::new("agent-1", "model-a", 10_000))
            .await
            .unwrap();

        let result = call(
            &fx,
            &conn,
            "tool.execute",
            json!({
                "name": "get_repo",
                "arguments": {"owner": "o", "repo": "r"},
                "context_id": ctx.id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(result["operation"], "get_repo");

        // Exactly one item was appended (role tool).
        let stored = fx.store.get(&ctx.id).await.unwrap();
        assert_eq!(stored.content.len(), 1);
        assert_eq!(stored.content[0].metadata.get("operation").unwrap(), "get_repo");
    }

    #[tokio::test]
    async fn tool_execute_restricted_is_4005() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let err = call(
            &fx,
            &conn,
            "tool.execute",
            json!({"name": "delete_repository", "arguments": {}}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 4005);
    }

    #[tokio::test]
    async fn session_recover_cycle_via_methods() {
        let fx = fixture().await;
        let (conn, _rx) = conn_for(&fx, "tenant-1");

        let session = call(&fx, &conn, "session.create", json!({})).await.unwrap();
        let id = session["id"].as_str().unwrap();

        // Not persisted yet: recover is an invalid transition.
        assert!(
            call(&fx, &conn, "session.recover", json!({"session_id": id}))
                .await
                .is_err()
        );

        fx.dispatcher.sessions.persist(id).await.unwrap();
        let recovered = call(&fx, &conn, "session.recover", json!({"session_id": id}))
            .await
            .unwrap();
        assert_eq!(recovered["state"], "recovered");

        let active = call(&fx, &conn, "session.set_active", json!({"session_id": id}))
            .await
            .unwrap();
        assert_eq!(active["state"], "active");
    }
}
