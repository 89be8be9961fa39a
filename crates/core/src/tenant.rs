//! Tenant and API key domain types.
//!
//! A tenant is the top-level isolation unit: keys, rate budgets, and all
//! messaging are partitioned by `tenant_id`. An API key is identified by
//! its short prefix; the prefix alone never authenticates — the full
//! secret is verified against `secret_hash` in constant time (see the
//! security crate).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A tenant — owner of keys, budgets, and connection scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Opaque tenant ID
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Origins allowed to open connections for this tenant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,
}

/// The class of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Full access; may override the bound tenant via `X-Tenant-ID`
    Admin,
    /// A connecting agent
    Agent,
    /// Server-to-server integration
    Service,
}

/// A stored API key record. The secret itself is never stored — only its
/// SHA-256 hash.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// First 8 characters of the key; the lookup index
    pub key_prefix: String,

    /// SHA-256 hash of the full secret
    pub secret_hash: Vec<u8>,

    pub tenant_id: String,
    pub key_type: KeyType,

    /// Scope strings this key grants
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    /// Token-bucket size for connections bound to this key
    pub rate_limit_requests: u32,
    pub rate_limit_window_seconds: u64,

    pub is_active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether the key has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Requests per second this key's bucket refills at.
    pub fn rate_per_second(&self) -> f64 {
        if self.rate_limit_window_seconds == 0 {
            return f64::MAX;
        }
        f64::from(self.rate_limit_requests) / self.rate_limit_window_seconds as f64
    }
}

// Keys show up in connection logs; never print the hash.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("key_prefix", &self.key_prefix)
            .field("secret_hash", &"[REDACTED]")
            .field("tenant_id", &self.tenant_id)
            .field("key_type", &self.key_type)
            .field("is_active", &self.is_active)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lookup interface for API keys (backed by the external key store).
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Find a key record by its prefix.
    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>, Error>;

    /// Persist a new key record.
    async fn insert(&self, key: ApiKey) -> Result<(), Error>;

    /// Deactivate a key by prefix; returns whether a key was found.
    async fn revoke(&self, prefix: &str) -> Result<bool, Error>;
}
