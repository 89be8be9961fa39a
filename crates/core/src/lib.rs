//! # AgentMesh Core
//!
//! Domain types, traits, and error definitions for the AgentMesh
//! coordination gateway. This crate has **zero framework dependencies** —
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod adapter;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod metrics;
pub mod tenant;

// Re-export key types at crate root for ergonomics
pub use adapter::{Adapter, AdapterHealth};
pub use context::{Context, ContextItem, ContextStore, ItemRole, UpdateOptions, estimate_tokens};
pub use error::{
    AdapterError, ContextError, Error, GatewayError, ResilienceError, Result, SessionError,
};
pub use event::{AdapterEvent, AdapterEventType, SystemEvent};
pub use message::{ErrorBody, Message, MessageType};
pub use metrics::{MetricsSink, NoopMetrics};
pub use tenant::{ApiKey, KeyStore, KeyType, Tenant};
