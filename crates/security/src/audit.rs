//! Audit logging — who did what, when, against which adapter.
//!
//! The persistent store is external; the core consumes this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One auditable action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tenant_id: String,
    pub key_prefix: String,
    pub action: String,
    pub target: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        key_prefix: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key_prefix: key_prefix.into(),
            action: action.into(),
            target: None,
            success: true,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// Sink for audit records.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditRecord);
}

/// Writes audit records as structured `tracing` events.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, entry: AuditRecord) {
        info!(
            tenant = %entry.tenant_id,
            key = %entry.key_prefix,
            action = %entry.action,
            target = entry.target.as_deref().unwrap_or("-"),
            success = entry.success,
            "audit"
        );
    }
}
