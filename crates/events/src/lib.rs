//! Event plumbing for AgentMesh.
//!
//! [`AdapterEventBus`] is the in-process bus adapters publish onto, keyed
//! by `(adapter_name, event_type)` with wildcards. [`SystemEventBus`] is
//! the system-wide broadcast bus. [`SystemEventBridge`] connects the two,
//! one-way, mapping every adapter event to its canonical system event.

pub mod bridge;
pub mod bus;
pub mod system;

pub use bridge::SystemEventBridge;
pub use bus::AdapterEventBus;
pub use system::SystemEventBus;
