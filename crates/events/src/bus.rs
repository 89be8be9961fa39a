//! In-process adapter event bus.
//!
//! Listeners register for `(adapter_name, event_type)` pairs; `"*"` is a
//! wildcard in either position. Publication walks the matching listeners
//! in registration order on the publisher's call stack. A failing listener
//! never stops the ones after it — the last failure is handed back to the
//! publisher for logging. Registration is rare, publication is hot, so the
//! listener list sits behind a read-heavy `RwLock`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use agentmesh_core::error::{Error, Result};
use agentmesh_core::event::AdapterEvent;

/// A synchronous listener, invoked on the publisher's stack.
pub type SyncListener = Arc<dyn Fn(&AdapterEvent) -> Result<()> + Send + Sync>;

/// An asynchronous listener; each delivery is spawned onto the runtime.
pub type AsyncListener =
    Arc<dyn Fn(AdapterEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum Listener {
    Sync(SyncListener),
    Async(AsyncListener),
}

struct Registration {
    adapter: String,
    event_type: String,
    listener: Listener,
}

/// The bus adapters publish their events onto.
#[derive(Default)]
pub struct AdapterEventBus {
    registrations: RwLock<Vec<Registration>>,
}

fn rule_matches(rule: &str, actual: &str) -> bool {
    rule == "*" || rule == actual
}

impl AdapterEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous listener for `(adapter, event_type)`, either
    /// of which may be `"*"`.
    pub fn register(
        &self,
        adapter: impl Into<String>,
        event_type: impl Into<String>,
        listener: SyncListener,
    ) {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registrations.push(Registration {
            adapter: adapter.into(),
            event_type: event_type.into(),
            listener: Listener::Sync(listener),
        });
    }

    /// Register a listener that runs on the runtime instead of the
    /// publisher's stack.
    pub fn register_async(
        &self,
        adapter: impl Into<String>,
        event_type: impl Into<String>,
        listener: AsyncListener,
    ) {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        registrations.push(Registration {
            adapter: adapter.into(),
            event_type: event_type.into(),
            listener: Listener::Async(listener),
        });
    }

    /// Publish to all matching listeners in registration order.
    ///
    /// Returns the last listener failure, if any; delivery to the
    /// remaining listeners is unaffected.
    pub fn publish(&self, event: &AdapterEvent) -> Result<()> {
        let registrations = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        let event_type = event.event_type.as_str();

        let mut last_failure: Option<Error> = None;
        let mut delivered = 0usize;

        for registration in registrations.iter() {
            if !rule_matches(&registration.adapter, &event.adapter_type)
                || !rule_matches(&registration.event_type, event_type)
            {
                continue;
            }
            delivered += 1;

            match &registration.listener {
                Listener::Sync(listener) => {
                    if let Err(e) = listener(event) {
                        warn!(
                            adapter = %event.adapter_type,
                            event_type = %event_type,
                            error = %e,
                            "Event listener failed"
                        );
                        last_failure = Some(e);
                    }
                }
                Listener::Async(listener) => {
                    tokio::spawn(listener(event.clone()));
                }
            }
        }

        debug!(
            adapter = %event.adapter_type,
            event_type = %event_type,
            listeners = delivered,
            "Event published"
        );

        match last_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of registered listeners (any key).
    pub fn listener_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
