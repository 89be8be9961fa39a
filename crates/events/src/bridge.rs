//! Bridge from the adapter bus to the system bus.
//!
//! One-way: every adapter event maps to exactly one canonical system
//! event. A failure to forward is logged and never propagated — the
//! emitting adapter's operation outcome must not depend on observers.

use std::sync::Arc;

use tracing::warn;

use agentmesh_core::event::{AdapterEvent, AdapterEventType, SystemEvent, meta};

use crate::bus::AdapterEventBus;
use crate::system::SystemEventBus;

/// Translates adapter events into the canonical taxonomy and forwards
/// them to the system bus.
pub struct SystemEventBridge {
    system_bus: Arc<SystemEventBus>,
}

impl SystemEventBridge {
    pub fn new(system_bus: Arc<SystemEventBus>) -> Self {
        Self { system_bus }
    }

    /// Subscribe this bridge to everything on an adapter bus.
    pub fn attach(self: &Arc<Self>, adapter_bus: &AdapterEventBus) {
        let bridge = Arc::clone(self);
        adapter_bus.register("*", "*", Arc::new(move |event| {
            bridge.forward(event);
            // Observer failures stay inside the bridge.
            Ok(())
        }));
    }

    /// Map and publish one event.
    pub fn forward(&self, event: &AdapterEvent) {
        let mapped = Self::map_event(event);
        self.system_bus.publish(mapped);
    }

    /// The canonical mapping. Total: unknown types become `AdapterGeneric`.
    pub fn map_event(event: &AdapterEvent) -> SystemEvent {
        let adapter = event.adapter_type.clone();
        let context_id = event.meta(meta::CONTEXT_ID).map(String::from);

        match &event.event_type {
            AdapterEventType::OperationSuccess => SystemEvent::AdapterOperationSuccess {
                adapter,
                operation: event.meta(meta::OPERATION).unwrap_or_default().to_string(),
                result: event.payload.clone(),
                context_id,
            },
            AdapterEventType::OperationFailure => SystemEvent::AdapterOperationFailure {
                adapter,
                operation: event.meta(meta::OPERATION).unwrap_or_default().to_string(),
                error: event.meta(meta::ERROR).unwrap_or_default().to_string(),
                context_id,
            },
            AdapterEventType::WebhookReceived => SystemEvent::WebhookReceived {
                adapter,
                event_type: event.meta(meta::EVENT_TYPE).unwrap_or_default().to_string(),
                payload: event.payload.clone(),
                context_id,
            },
            AdapterEventType::HealthChanged => {
                let old_status = event.meta(meta::OLD_STATUS).unwrap_or_default().to_string();
                let new_status = event.meta(meta::NEW_STATUS).unwrap_or_default().to_string();
                if old_status.is_empty() || new_status.is_empty() {
                    warn!(adapter = %event.adapter_type, "Health event missing status metadata");
                }
                SystemEvent::AdapterHealthChanged {
                    adapter,
                    old_status,
                    new_status,
                }
            }
            AdapterEventType::Other(raw) => SystemEvent::AdapterGeneric {
                adapter,
                event_type: raw.clone(),
                payload: event.payload.clone(),
                metadata: event.metadata.clone(),
            },
        }
    }
}
