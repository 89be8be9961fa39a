//! Shared workspaces and versioned documents.
//!
//! A workspace is a membership list; documents belong to a workspace and
//! take append-style edits, each bumping the version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use agentmesh_core::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub content: String,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

/// Workspaces and their documents.
#[derive(Default)]
pub struct WorkspaceManager {
    workspaces: RwLock<HashMap<String, Workspace>>,
    documents: RwLock<HashMap<String, Document>>,
}

impl WorkspaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        creator: impl Into<String>,
    ) -> Workspace {
        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            members: vec![creator.into()],
            created_at: Utc::now(),
        };
        self.workspaces
            .write()
            .await
            .insert(workspace.id.clone(), workspace.clone());
        workspace
    }

    pub async fn get(&self, id: &str) -> Result<Workspace> {
        self.workspaces
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams(format!("workspace not found: {id}")).into())
    }

    /// Join an agent to a workspace. Idempotent.
    pub async fn join(&self, id: &str, agent_id: impl Into<String>) -> Result<Workspace> {
        let agent_id = agent_id.into();
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(id)
            .ok_or_else(|| GatewayError::InvalidParams(format!("workspace not found: {id}")))?;
        if !workspace.members.contains(&agent_id) {
            workspace.members.push(agent_id);
        }
        Ok(workspace.clone())
    }

    pub async fn create_document(
        &self,
        workspace_id: &str,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Document> {
        // Validates the workspace exists.
        self.get(workspace_id).await?;

        let document = Document {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            title: title.into(),
            content: content.into(),
            version: 1,
            updated_at: Utc::now(),
        };
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(document)
    }

    pub async fn get_document(&self, id: &str) -> Result<Document> {
        self.documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams(format!("document not found: {id}")).into())
    }

    /// Append an edit, bumping the version. An `expected_version` that no
    /// longer matches is a conflict (a competing edit won).
    pub async fn edit_document(
        &self,
        id: &str,
        append: &str,
        expected_version: Option<u32>,
    ) -> Result<Document> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| GatewayError::InvalidParams(format!("document not found: {id}")))?;

        if let Some(expected) = expected_version
            && expected != document.version
        {
            return Err(GatewayError::InvalidParams(format!(
                "version conflict on document {id}: expected {expected}, at {}",
                document.version
            ))
            .into());
        }

        document.content.push_str(append);
        document.version += 1;
        document.updated_at = Utc::now();
        Ok(document.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_join_workspace() {
        let mgr = WorkspaceManager::new();
        let ws = mgr.create("tenant-1", "sprint-42", "agent-1").await;
        assert_eq!(ws.members, vec!["agent-1"]);

        let ws = mgr.join(&ws.id, "agent-2").await.unwrap();
        assert_eq!(ws.members.len(), 2);

        // Idempotent join.
        let ws = mgr.join(&ws.id, "agent-2").await.unwrap();
        assert_eq!(ws.members.len(), 2);
    }

    #[tokio::test]
    async fn document_versioned_edits() {
        let mgr = WorkspaceManager::new();
        let ws = mgr.create("tenant-1", "w", "agent-1").await;
        let doc = mgr
            .create_document(&ws.id, "notes", "line one\n")
            .await
            .unwrap();
        assert_eq!(doc.version, 1);

        let doc = mgr
            .edit_document(&doc.id, "line two\n", Some(1))
            .await
            .unwrap();
        assert_eq!(doc.version, 2);
        assert!(doc.content.ends_with("line two\n"));

        // Stale expected version conflicts.
        assert!(mgr.edit_document(&doc.id, "x", Some(1)).await.is_err());

        // No expected version always applies.
        let doc = mgr.edit_document(&doc.id, "line three\n", None).await.unwrap();
        assert_eq!(doc.version, 3);
    }

    #[tokio::test]
    async fn document_requires_workspace() {
        let mgr = WorkspaceManager::new();
        assert!(mgr.create_document("ghost", "t", "c").await.is_err());
    }
}
