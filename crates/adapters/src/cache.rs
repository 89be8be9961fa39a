//! ETag and decoded-response caches.
//!
//! Backed by `DashMap`: reads are lock-free, writes take a per-shard lock
//! only. Keys are the request path (including query string).

use dashmap::DashMap;
use serde_json::Value;

/// Cache of `ETag` values per request path.
#[derive(Debug, Default)]
pub struct EtagCache {
    etags: DashMap<String, String>,
}

impl EtagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.etags.get(path).map(|e| e.clone())
    }

    pub fn put(&self, path: impl Into<String>, etag: impl Into<String>) {
        self.etags.insert(path.into(), etag.into());
    }

    pub fn invalidate(&self, path: &str) {
        self.etags.remove(path);
    }

    pub fn len(&self) -> usize {
        self.etags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.etags.is_empty()
    }
}

/// Cache of decoded response bodies per request path, served on `304`.
#[derive(Debug, Default)]
pub struct ResponseCache {
    bodies: DashMap<String, Value>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.bodies.get(path).map(|v| v.clone())
    }

    pub fn put(&self, path: impl Into<String>, body: Value) {
        self.bodies.insert(path.into(), body);
    }

    pub fn invalidate(&self, path: &str) {
        self.bodies.remove(path);
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}
