//! Session lifecycle and history.
//!
//! Per session: `Active → Persisted → Recovered → Active` on reconnect +
//! recover, or `Active → Expired` once the idle TTL elapses. Mutating
//! operations on an expired session fail with `SessionExpired`; reads
//! still work so agents can inspect what they lost.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use agentmesh_core::context::estimate_tokens;
use agentmesh_core::error::{Result, SessionError};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Persisted,
    Recovered,
    Expired,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Persisted => "persisted",
            SessionState::Recovered => "recovered",
            SessionState::Expired => "expired",
        }
    }
}

/// One message in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub tokens: u32,
    pub timestamp: DateTime<Utc>,
}

/// A conversational session owned by one agent within one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub state: SessionState,

    /// Free-form state the agent maintains via `session.update_state`
    pub state_data: Value,

    pub messages: Vec<SessionMessage>,

    /// Set on branched sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Aggregate numbers for `session.get_metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub message_count: usize,
    pub total_tokens: u64,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Owns all sessions and enforces the lifecycle rules.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    pub async fn create(
        &self,
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        initial_state: Value,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            state: SessionState::Active,
            state_data: initial_state,
            messages: Vec::new(),
            parent_session_id: None,
            created_at: now,
            last_activity: now,
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, agent_id = %session.agent_id, "Session created");
        session
    }

    /// Fetch a session, applying lazy TTL expiry first.
    pub async fn get(&self, id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Self::apply_expiry(session, self.ttl);
        Ok(session.clone())
    }

    /// Merge new state data into the session (object keys overwrite).
    pub async fn update_state(&self, id: &str, state_data: Value) -> Result<Session> {
        self.mutate(id, |session| {
            match (&mut session.state_data, state_data) {
                (Value::Object(current), Value::Object(incoming)) => {
                    for (key, value) in incoming {
                        current.insert(key, value);
                    }
                }
                (slot, incoming) => *slot = incoming,
            }
            Ok(())
        })
        .await
    }

    /// Append a message; returns the updated session.
    pub async fn add_message(
        &self,
        id: &str,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<SessionMessage> {
        let content = content.into();
        let message = SessionMessage {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            tokens: estimate_tokens(&content),
            content,
            timestamp: Utc::now(),
        };
        let message2 = message.clone();
        self.mutate(id, move |session| {
            session.messages.push(message2);
            Ok(())
        })
        .await?;
        Ok(message)
    }

    /// The last `limit` messages, oldest first. No limit returns all.
    pub async fn get_history(&self, id: &str, limit: Option<usize>) -> Result<Vec<SessionMessage>> {
        let session = self.get(id).await?;
        let messages = session.messages;
        let start = match limit {
            Some(limit) if limit < messages.len() => messages.len() - limit,
            _ => 0,
        };
        Ok(messages[start..].to_vec())
    }

    /// Create a new session from the parent's first `branch_point`
    /// messages. The two sessions diverge independently afterwards.
    pub async fn branch(&self, id: &str, branch_point: usize) -> Result<Session> {
        let parent = self.get(id).await?;
        if parent.state == SessionState::Expired {
            return Err(SessionError::Expired(id.to_string()).into());
        }
        if branch_point > parent.messages.len() {
            return Err(SessionError::InvalidState {
                session_id: id.to_string(),
                state: format!(
                    "branch point {branch_point} beyond history ({} messages)",
                    parent.messages.len()
                ),
            }
            .into());
        }

        let now = Utc::now();
        let branched = Session {
            id: Uuid::new_v4().to_string(),
            tenant_id: parent.tenant_id.clone(),
            agent_id: parent.agent_id.clone(),
            state: SessionState::Active,
            state_data: parent.state_data.clone(),
            messages: parent.messages[..branch_point].to_vec(),
            parent_session_id: Some(parent.id.clone()),
            created_at: now,
            last_activity: now,
        };
        self.sessions
            .write()
            .await
            .insert(branched.id.clone(), branched.clone());
        Ok(branched)
    }

    /// Persist: park an active session (survives disconnects).
    pub async fn persist(&self, id: &str) -> Result<Session> {
        self.transition(id, SessionState::Persisted, |state| {
            matches!(state, SessionState::Active | SessionState::Recovered)
        })
        .await
    }

    /// Recover a persisted session after reconnect.
    pub async fn recover(&self, id: &str) -> Result<Session> {
        self.transition(id, SessionState::Recovered, |state| {
            state == SessionState::Persisted
        })
        .await
    }

    /// Make a recovered (or persisted) session active again.
    pub async fn set_active(&self, id: &str) -> Result<Session> {
        self.transition(id, SessionState::Active, |state| {
            matches!(
                state,
                SessionState::Recovered | SessionState::Persisted | SessionState::Active
            )
        })
        .await
    }

    /// Sessions for a tenant, optionally narrowed to one agent.
    pub async fn list(&self, tenant_id: &str, agent_id: Option<&str>) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let mut result: Vec<Session> = sessions
            .values_mut()
            .map(|session| {
                Self::apply_expiry(session, self.ttl);
                session
            })
            .filter(|s| s.tenant_id == tenant_id)
            .filter(|s| agent_id.is_none_or(|a| s.agent_id == a))
            .map(|s| s.clone())
            .collect();
        result.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        result
    }

    pub async fn get_metrics(&self, id: &str) -> Result<SessionMetrics> {
        let session = self.get(id).await?;
        Ok(SessionMetrics {
            message_count: session.messages.len(),
            total_tokens: session.messages.iter().map(|m| u64::from(m.tokens)).sum(),
            state: session.state,
            created_at: session.created_at,
            last_activity: session.last_activity,
        })
    }

    /// The full session as one JSON document.
    pub async fn export(&self, id: &str) -> Result<Value> {
        let session = self.get(id).await?;
        Ok(serde_json::to_value(session)?)
    }

    /// Apply a mutation to a live (non-expired) session.
    async fn mutate<F>(&self, id: &str, apply: F) -> Result<Session>
    where
        F: FnOnce(&mut Session) -> Result<()>,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Self::apply_expiry(session, self.ttl);
        if session.state == SessionState::Expired {
            return Err(SessionError::Expired(id.to_string()).into());
        }
        apply(session)?;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    async fn transition<F>(&self, id: &str, to: SessionState, allowed_from: F) -> Result<Session>
    where
        F: FnOnce(SessionState) -> bool,
    {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Self::apply_expiry(session, self.ttl);

        if session.state == SessionState::Expired {
            return Err(SessionError::Expired(id.to_string()).into());
        }
        if !allowed_from(session.state) {
            return Err(SessionError::InvalidState {
                session_id: id.to_string(),
                state: session.state.as_str().to_string(),
            }
            .into());
        }

        debug!(session_id = %id, from = session.state.as_str(), to = to.as_str(), "Session transition");
        session.state = to;
        session.last_activity = Utc::now();
        Ok(session.clone())
    }

    /// `Active → Expired` once the idle TTL has elapsed. Persisted
    /// sessions do not expire; that is what persisting is for.
    fn apply_expiry(session: &mut Session, ttl: Duration) {
        if session.state == SessionState::Active && Utc::now() - session.last_activity > ttl {
            session.state = SessionState::Expired;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new(3_600)
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let mgr = manager();
        let created = mgr.create("tenant-1", "agent-1", json!({"goal": "x"})).await;

        let fetched = mgr.get(&created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.state, SessionState::Active);
        assert_eq!(fetched.state_data["goal"], "x");
    }

    #[tokio::test]
    async fn missing_session_not_found() {
        assert!(manager().get("missing").await.is_err());
    }

    #[tokio::test]
    async fn history_preserves_insertion_order() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;

        for i in 0..5 {
            mgr.add_message(&session.id, "user", format!("message {i}"))
                .await
                .unwrap();
        }

        let history = mgr.get_history(&session.id, Some(5)).await.unwrap();
        assert_eq!(history.len(), 5);
        for (i, message) in history.iter().enumerate() {
            assert_eq!(message.content, format!("message {i}"));
        }

        let last_two = mgr.get_history(&session.id, Some(2)).await.unwrap();
        assert_eq!(last_two[0].content, "message 3");
        assert_eq!(last_two[1].content, "message 4");
    }

    #[tokio::test]
    async fn update_state_merges_objects() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({"a": 1})).await;

        let updated = mgr
            .update_state(&session.id, json!({"b": 2}))
            .await
            .unwrap();
        assert_eq!(updated.state_data["a"], 1);
        assert_eq!(updated.state_data["b"], 2);
    }

    #[tokio::test]
    async fn branch_copies_prefix_and_diverges() {
        let mgr = manager();
        let parent = mgr.create("tenant-1", "agent-1", json!({})).await;
        for i in 0..4 {
            mgr.add_message(&parent.id, "user", format!("m{i}"))
                .await
                .unwrap();
        }

        let branched = mgr.branch(&parent.id, 2).await.unwrap();
        assert_eq!(branched.parent_session_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(branched.messages.len(), 2);

        // Divergence: new messages on the branch do not appear on the parent.
        mgr.add_message(&branched.id, "user", "branch only")
            .await
            .unwrap();
        assert_eq!(mgr.get(&parent.id).await.unwrap().messages.len(), 4);
        assert_eq!(mgr.get(&branched.id).await.unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn branch_point_beyond_history_rejected() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;
        assert!(mgr.branch(&session.id, 3).await.is_err());
    }

    #[tokio::test]
    async fn lifecycle_persist_recover_activate() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;

        assert_eq!(
            mgr.persist(&session.id).await.unwrap().state,
            SessionState::Persisted
        );
        assert_eq!(
            mgr.recover(&session.id).await.unwrap().state,
            SessionState::Recovered
        );
        assert_eq!(
            mgr.set_active(&session.id).await.unwrap().state,
            SessionState::Active
        );
    }

    #[tokio::test]
    async fn recover_requires_persisted() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;
        let err = mgr.recover(&session.id).await.unwrap_err();
        assert_eq!(err.code(), 4004);
    }

    #[tokio::test]
    async fn idle_session_expires_and_rejects_mutations() {
        let mgr = SessionManager::new(0); // everything is instantly idle
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let fetched = mgr.get(&session.id).await.unwrap();
        assert_eq!(fetched.state, SessionState::Expired);

        let err = mgr
            .add_message(&session.id, "user", "too late")
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4101);
    }

    #[tokio::test]
    async fn list_filters_by_tenant_and_agent() {
        let mgr = manager();
        mgr.create("tenant-1", "agent-1", json!({})).await;
        mgr.create("tenant-1", "agent-2", json!({})).await;
        mgr.create("tenant-2", "agent-1", json!({})).await;

        assert_eq!(mgr.list("tenant-1", None).await.len(), 2);
        assert_eq!(mgr.list("tenant-1", Some("agent-1")).await.len(), 1);
        assert_eq!(mgr.list("tenant-3", None).await.len(), 0);
    }

    #[tokio::test]
    async fn metrics_and_export() {
        let mgr = manager();
        let session = mgr.create("tenant-1", "agent-1", json!({})).await;
        mgr.add_message(&session.id, "user", "x".repeat(40))
            .await
            .unwrap();

        let metrics = mgr.get_metrics(&session.id).await.unwrap();
        assert_eq!(metrics.message_count, 1);
        assert_eq!(metrics.total_tokens, 10);

        let exported = mgr.export(&session.id).await.unwrap();
        assert_eq!(exported["id"], session.id.as_str());
        assert_eq!(exported["messages"].as_array().unwrap().len(), 1);
    }
}
