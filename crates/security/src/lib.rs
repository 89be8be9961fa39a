//! Security building blocks for AgentMesh.
//!
//! - [`credentials`]: pluggable outbound header signers (C2)
//! - [`apikey`]: inbound API-key generation, hashing, and constant-time
//!   verification, plus the in-memory key store
//! - [`safety`]: the operation-safety policy gating mutating adapter calls
//! - [`audit`]: the audit-log interface

pub mod apikey;
pub mod audit;
pub mod credentials;
pub mod safety;

pub use apikey::{InMemoryKeyStore, KeyAuthenticator, generate_key};
pub use audit::{AuditLog, AuditRecord, TracingAuditLog};
pub use credentials::CredentialProvider;
pub use safety::{OperationCheck, OperationPolicy};
