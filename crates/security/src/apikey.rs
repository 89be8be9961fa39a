//! API-key generation, hashing, and constant-time verification.
//!
//! Keys have the form `<prefix>.<secret>`: the 8-character prefix indexes
//! the stored record; the full key is verified against a SHA-256 hash with
//! a constant-time comparison so the prefix alone never authenticates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

use agentmesh_core::error::{Error, GatewayError, Result};
use agentmesh_core::tenant::{ApiKey, KeyStore, KeyType};

/// Length of the indexable key prefix.
pub const PREFIX_LEN: usize = 8;

/// Length of the secret half of a key.
const SECRET_LEN: usize = 32;

/// Mint a new API key. Returns the storable record and the full key
/// string — the only time the secret is ever visible.
pub fn generate_key(
    tenant_id: impl Into<String>,
    key_type: KeyType,
    scopes: Vec<String>,
    rate_limit_requests: u32,
    rate_limit_window_seconds: u64,
    expires_at: Option<DateTime<Utc>>,
) -> (ApiKey, String) {
    let mut rng = rand::rng();
    let prefix: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(PREFIX_LEN)
        .map(char::from)
        .collect();
    let secret: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect();
    let full = format!("{prefix}.{secret}");

    let record = ApiKey {
        key_prefix: prefix,
        secret_hash: hash_key(&full),
        tenant_id: tenant_id.into(),
        key_type,
        scopes,
        rate_limit_requests,
        rate_limit_window_seconds,
        is_active: true,
        expires_at,
        created_at: Utc::now(),
    };

    (record, full)
}

/// SHA-256 over the full `<prefix>.<secret>` string, binding the secret to
/// its prefix.
pub fn hash_key(full_key: &str) -> Vec<u8> {
    Sha256::digest(full_key.as_bytes()).to_vec()
}

/// Constant-time byte comparison. Runs over the whole input regardless of
/// where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Authenticates presented keys against a [`KeyStore`].
pub struct KeyAuthenticator {
    store: std::sync::Arc<dyn KeyStore>,
}

impl KeyAuthenticator {
    pub fn new(store: std::sync::Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn KeyStore {
        self.store.as_ref()
    }

    /// Verify a presented `<prefix>.<secret>` key. Returns the key record
    /// on success. Every failure path is `Unauthorized` — callers close
    /// the connection before any application frame.
    pub async fn authenticate(&self, presented: &str) -> Result<ApiKey> {
        let (prefix, _) = presented
            .split_once('.')
            .ok_or_else(|| unauthorized("malformed key"))?;
        if prefix.len() != PREFIX_LEN {
            return Err(unauthorized("malformed key prefix"));
        }

        let record = self
            .store
            .find_by_prefix(prefix)
            .await?
            .ok_or_else(|| unauthorized("unknown key"))?;

        if !constant_time_eq(&record.secret_hash, &hash_key(presented)) {
            warn!(prefix = %prefix, "API key secret mismatch");
            return Err(unauthorized("invalid key"));
        }
        if !record.is_active {
            return Err(unauthorized("key disabled"));
        }
        if record.is_expired(Utc::now()) {
            return Err(unauthorized("key expired"));
        }

        Ok(record)
    }

    /// Resolve the tenant a connection binds to. `X-Tenant-ID` may override
    /// the key's tenant only for admin keys; for all others it must match.
    pub fn resolve_tenant(&self, key: &ApiKey, override_tenant: Option<&str>) -> Result<String> {
        match override_tenant {
            None => Ok(key.tenant_id.clone()),
            Some(requested) if requested == key.tenant_id => Ok(key.tenant_id.clone()),
            Some(requested) if key.key_type == KeyType::Admin => Ok(requested.to_string()),
            Some(requested) => {
                warn!(
                    requested = %requested,
                    bound = %key.tenant_id,
                    "Tenant override rejected for non-admin key"
                );
                Err(unauthorized("tenant override not permitted"))
            }
        }
    }
}

fn unauthorized(reason: &str) -> Error {
    GatewayError::Unauthorized(reason.to_string()).into()
}

/// In-memory key store, used in tests and single-node deployments. The
/// production store is external (C7-style interface).
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn find_by_prefix(&self, prefix: &str) -> Result<Option<ApiKey>> {
        Ok(self.keys.read().await.get(prefix).cloned())
    }

    async fn insert(&self, key: ApiKey) -> Result<()> {
        self.keys.write().await.insert(key.key_prefix.clone(), key);
        Ok(())
    }

    async fn revoke(&self, prefix: &str) -> Result<bool> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(prefix) {
            Some(key) => {
                key.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
