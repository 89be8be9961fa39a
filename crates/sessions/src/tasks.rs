//! Task board — delegation of work between agents.
//!
//! Lifecycle: `Created → Delegated → Accepted → Completed`. Only the
//! delegated assignee may accept, and only the acceptor may complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use agentmesh_core::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Delegated,
    Accepted,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Delegated => "delegated",
            TaskStatus::Accepted => "accepted",
            TaskStatus::Completed => "completed",
        }
    }
}

/// One unit of delegable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub created_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    pub status: TaskStatus,
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// All tasks, tenant-partitioned by the `tenant_id` field.
#[derive(Default)]
pub struct TaskBoard {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        tenant_id: impl Into<String>,
        created_by: impl Into<String>,
        title: impl Into<String>,
        payload: Value,
    ) -> Task {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            title: title.into(),
            created_by: created_by.into(),
            assignee: None,
            status: TaskStatus::Created,
            payload,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        task
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams(format!("task not found: {id}")).into())
    }

    pub async fn delegate(&self, id: &str, assignee: impl Into<String>) -> Result<Task> {
        let assignee = assignee.into();
        self.mutate(id, |task| {
            if task.status != TaskStatus::Created {
                return Err(invalid_status(id, task.status));
            }
            task.assignee = Some(assignee);
            task.status = TaskStatus::Delegated;
            Ok(())
        })
        .await
    }

    pub async fn accept(&self, id: &str, agent_id: &str) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status != TaskStatus::Delegated {
                return Err(invalid_status(id, task.status));
            }
            if task.assignee.as_deref() != Some(agent_id) {
                return Err(GatewayError::InvalidParams(format!(
                    "task {id} is delegated to a different agent"
                ))
                .into());
            }
            task.status = TaskStatus::Accepted;
            Ok(())
        })
        .await
    }

    pub async fn complete(&self, id: &str, agent_id: &str, result: Value) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status != TaskStatus::Accepted {
                return Err(invalid_status(id, task.status));
            }
            if task.assignee.as_deref() != Some(agent_id) {
                return Err(GatewayError::InvalidParams(format!(
                    "task {id} is owned by a different agent"
                ))
                .into());
            }
            task.result = Some(result);
            task.status = TaskStatus::Completed;
            Ok(())
        })
        .await
    }

    /// Tasks for one tenant, newest first.
    pub async fn list(&self, tenant_id: &str) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| GatewayError::InvalidParams(format!("task not found: {id}")))?;
        apply(task)?;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}

fn invalid_status(id: &str, status: TaskStatus) -> agentmesh_core::error::Error {
    GatewayError::InvalidParams(format!("task {id} is in status '{}'", status.as_str())).into()
}
