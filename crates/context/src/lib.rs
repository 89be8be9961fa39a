//! Context persistence and the context bridge for AgentMesh.
//!
//! The [`ContextStore`](agentmesh_core::context::ContextStore) trait lives
//! in core; this crate ships the in-memory reference implementation, the
//! bridge that records operations/events/webhooks into contexts, and the
//! cycle-safe marshaller for arbitrary request/response values.

pub mod bridge;
pub mod in_memory;
pub mod marshal;

pub use bridge::ContextBridge;
pub use in_memory::InMemoryContextStore;
