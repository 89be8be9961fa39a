//! Adapter events and the canonical system event taxonomy.
//!
//! Adapters emit [`AdapterEvent`]s onto the in-process bus; the bridge maps
//! each one to exactly one [`SystemEvent`] and forwards it to the
//! system-wide bus. The mapping is total: unknown adapter event types
//! become `AdapterGeneric`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Well-known metadata keys on [`AdapterEvent::metadata`].
pub mod meta {
    pub const CONTEXT_ID: &str = "contextId";
    pub const OPERATION: &str = "operation";
    pub const ERROR: &str = "error";
    pub const EVENT_TYPE: &str = "eventType";
    pub const OLD_STATUS: &str = "oldStatus";
    pub const NEW_STATUS: &str = "newStatus";
}

/// The type of an adapter event. The enumerated variants are the ones the
/// bridge maps specially; anything else travels as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AdapterEventType {
    OperationSuccess,
    OperationFailure,
    WebhookReceived,
    HealthChanged,
    Other(String),
}

impl From<String> for AdapterEventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "operation_success" => AdapterEventType::OperationSuccess,
            "operation_failure" => AdapterEventType::OperationFailure,
            "webhook_received" => AdapterEventType::WebhookReceived,
            "health_changed" => AdapterEventType::HealthChanged,
            _ => AdapterEventType::Other(s),
        }
    }
}

impl From<AdapterEventType> for String {
    fn from(t: AdapterEventType) -> String {
        t.as_str().to_string()
    }
}

impl AdapterEventType {
    pub fn as_str(&self) -> &str {
        match self {
            AdapterEventType::OperationSuccess => "operation_success",
            AdapterEventType::OperationFailure => "operation_failure",
            AdapterEventType::WebhookReceived => "webhook_received",
            AdapterEventType::HealthChanged => "health_changed",
            AdapterEventType::Other(s) => s,
        }
    }
}

impl std::fmt::Display for AdapterEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event emitted by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEvent {
    /// Unique event ID
    pub id: String,

    /// Which adapter emitted this (e.g. "github")
    pub adapter_type: String,

    /// The event type
    pub event_type: AdapterEventType,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// Free-form payload
    pub payload: Value,

    /// String-keyed metadata; see [`meta`] for well-known keys
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AdapterEvent {
    pub fn new(adapter_type: impl Into<String>, event_type: AdapterEventType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            adapter_type: adapter_type.into(),
            event_type,
            timestamp: Utc::now(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry (builder style).
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// The canonical system-wide event taxonomy. Every adapter event maps to
/// exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    AdapterOperationSuccess {
        adapter: String,
        operation: String,
        result: Value,
        context_id: Option<String>,
    },
    AdapterOperationFailure {
        adapter: String,
        operation: String,
        error: String,
        context_id: Option<String>,
    },
    WebhookReceived {
        adapter: String,
        event_type: String,
        payload: Value,
        context_id: Option<String>,
    },
    AdapterHealthChanged {
        adapter: String,
        old_status: String,
        new_status: String,
    },
    AdapterGeneric {
        adapter: String,
        event_type: String,
        payload: Value,
        metadata: HashMap<String, String>,
    },
}

impl SystemEvent {
    /// The canonical dotted name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            SystemEvent::AdapterOperationSuccess { .. } => "adapter.operation.success",
            SystemEvent::AdapterOperationFailure { .. } => "adapter.operation.failure",
            SystemEvent::WebhookReceived { .. } => "webhook.received",
            SystemEvent::AdapterHealthChanged { .. } => "adapter.health.changed",
            SystemEvent::AdapterGeneric { .. } => "adapter.generic",
        }
    }

    pub fn adapter(&self) -> &str {
        match self {
            SystemEvent::AdapterOperationSuccess { adapter, .. }
            | SystemEvent::AdapterOperationFailure { adapter, .. }
            | SystemEvent::WebhookReceived { adapter, .. }
            | SystemEvent::AdapterHealthChanged { adapter, .. }
            | SystemEvent::AdapterGeneric { adapter, .. } => adapter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_string_roundtrip() {
        for (t, s) in [
            (AdapterEventType::OperationSuccess, "operation_success"),
            (AdapterEventType::OperationFailure, "operation_failure"),
            (AdapterEventType::WebhookReceived, "webhook_received"),
            (AdapterEventType::HealthChanged, "health_changed"),
        ] {
            assert_eq!(t.as_str(), s);
            assert_eq!(AdapterEventType::from(s.to_string()), t);
        }

        let custom = AdapterEventType::from("pull_request.opened".to_string());
        assert_eq!(
            custom,
            AdapterEventType::Other("pull_request.opened".into())
        );
        assert_eq!(custom.as_str(), "pull_request.opened");
    }

    #[test]
    fn event_metadata_builder() {
        let event = AdapterEvent::new(
            "github",
            AdapterEventType::OperationSuccess,
            serde_json::json!({"repo": "octocat/hello"}),
        )
        .with_meta(meta::OPERATION, "get_repo")
        .with_meta(meta::CONTEXT_ID, "ctx_42");

        assert_eq!(event.meta(meta::OPERATION), Some("get_repo"));
        assert_eq!(event.meta(meta::CONTEXT_ID), Some("ctx_42"));
        assert_eq!(event.meta(meta::ERROR), None);
    }

    #[test]
    fn system_event_names() {
        let ev = SystemEvent::AdapterHealthChanged {
            adapter: "harness".into(),
            old_status: "healthy".into(),
            new_status: "degraded".into(),
        };
        assert_eq!(ev.name(), "adapter.health.changed");
        assert_eq!(ev.adapter(), "harness");
    }

    #[test]
    fn adapter_event_serializes_event_type_as_string() {
        let event = AdapterEvent::new(
            "xray",
            AdapterEventType::Other("scan.completed".into()),
            Value::Null,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "scan.completed");
    }
}
