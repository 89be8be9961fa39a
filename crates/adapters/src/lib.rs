//! Adapter invocation engine and registry for AgentMesh.
//!
//! [`Invoker`] is the shared machinery every adapter body calls through:
//! credential injection, the composed resilience stack, ETag-conditional
//! GETs with response caching, typed upstream error mapping, pagination,
//! GraphQL envelopes with batching, and the operation-safety gate. The
//! [`AdapterRegistry`] produces live adapters from factories and tracks
//! their health.

pub mod cache;
pub mod graphql;
pub mod invoker;
pub mod pagination;
pub mod registry;

pub use cache::{EtagCache, ResponseCache};
pub use invoker::{Invoker, RestCall};
pub use pagination::{PageMode, Paginator};
pub use registry::{AdapterFactory, AdapterRegistry};
