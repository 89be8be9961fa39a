//! Multi-step workflows with strict step ordering.
//!
//! Steps complete in declaration order; completing the last step
//! completes the workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use agentmesh_core::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub completed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,

    /// Index of the next step to complete
    pub current_step: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// All workflows, tenant-partitioned by the `tenant_id` field.
#[derive(Default)]
pub struct WorkflowCoordinator {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl WorkflowCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        step_names: Vec<String>,
    ) -> Result<Workflow> {
        if step_names.is_empty() {
            return Err(GatewayError::InvalidParams("workflow needs at least one step".into()).into());
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            status: WorkflowStatus::Created,
            steps: step_names
                .into_iter()
                .map(|name| WorkflowStep {
                    name,
                    completed: false,
                    result: None,
                    completed_by: None,
                })
                .collect(),
            current_step: 0,
            created_at: now,
            updated_at: now,
        };
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    pub async fn get(&self, id: &str) -> Result<Workflow> {
        self.workflows
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams(format!("workflow not found: {id}")).into())
    }

    pub async fn start(&self, id: &str) -> Result<Workflow> {
        self.mutate(id, |workflow| {
            if workflow.status != WorkflowStatus::Created {
                return Err(GatewayError::InvalidParams(format!(
                    "workflow {id} already started"
                ))
                .into());
            }
            workflow.status = WorkflowStatus::Running;
            Ok(())
        })
        .await
    }

    /// Complete the named step. Must be the current step; the last step
    /// completes the workflow.
    pub async fn complete_step(
        &self,
        id: &str,
        step_name: &str,
        completed_by: &str,
        result: Value,
    ) -> Result<Workflow> {
        self.mutate(id, |workflow| {
            if workflow.status != WorkflowStatus::Running {
                return Err(GatewayError::InvalidParams(format!(
                    "workflow {id} is not running"
                ))
                .into());
            }

            let index = workflow.current_step;
            let step = workflow.steps.get_mut(index).expect("current step in range");
            if step.name != step_name {
                return Err(GatewayError::InvalidParams(format!(
                    "expected step '{}', got '{step_name}'",
                    step.name
                ))
                .into());
            }

            step.completed = true;
            step.result = Some(result);
            step.completed_by = Some(completed_by.to_string());
            workflow.current_step += 1;

            if workflow.current_step == workflow.steps.len() {
                workflow.status = WorkflowStatus::Completed;
            }
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> Result<Workflow>
    where
        F: FnOnce(&mut Workflow) -> Result<()>,
    {
        let mut workflows = self.workflows.write().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| GatewayError::InvalidParams(format!("workflow not found: {id}")))?;
        apply(workflow)?;
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }
}
