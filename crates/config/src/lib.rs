//! Configuration loading, validation, and management for AgentMesh.
//!
//! Loads configuration from `agentmesh.toml` with environment variable
//! overrides. Validates all settings at startup. Secrets never appear in
//! `Debug` output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use agentmesh_resilience::ResilienceConfig;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// The root configuration structure.
///
/// Maps directly to `agentmesh.toml`.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Gateway (WebSocket) settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Context store settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Per-adapter configuration, keyed by adapter name
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bounded per-connection send queue depth
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// Rate-limit violations within the window that force a disconnect
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// Violation counting window (seconds)
    #[serde(default = "default_violation_window_seconds")]
    pub violation_window_seconds: u64,

    /// Default compression threshold (bytes) for binary-mode payloads
    #[serde(default = "default_binary_threshold")]
    pub binary_threshold: usize,

    /// Per-request handler deadline (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8700
}
fn default_send_queue_depth() -> usize {
    64
}
fn default_violation_threshold() -> u32 {
    10
}
fn default_violation_window_seconds() -> u64 {
    60
}
fn default_binary_threshold() -> usize {
    1024
}
fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_queue_depth: default_send_queue_depth(),
            violation_threshold: default_violation_threshold(),
            violation_window_seconds: default_violation_window_seconds(),
            binary_threshold: default_binary_threshold(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle TTL after which a session expires (seconds)
    #[serde(default = "default_session_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_session_ttl_seconds() -> u64 {
    3_600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Default token budget for newly created contexts
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    128_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
        }
    }
}

/// How the engine authenticates against one adapter's upstream.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },

    /// A static API key in a configurable header (e.g. `x-api-key`)
    ApiKey { header: String, key: String },

    /// HTTP basic auth
    Basic { username: String, password: String },

    /// HMAC-SHA256-signed app-identity JWT
    AppJwt { app_id: String, secret: String },

    /// No credentials attached
    #[default]
    None,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::Bearer { .. } => write!(f, "Bearer {{ token: [REDACTED] }}"),
            AuthConfig::ApiKey { header, .. } => {
                write!(f, "ApiKey {{ header: {header:?}, key: [REDACTED] }}")
            }
            AuthConfig::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, password: [REDACTED] }}")
            }
            AuthConfig::AppJwt { app_id, .. } => {
                write!(f, "AppJwt {{ app_id: {app_id:?}, secret: [REDACTED] }}")
            }
            AuthConfig::None => write!(f, "None"),
        }
    }
}

/// Operation-safety lists for one adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Operations refused outright
    #[serde(default)]
    pub restricted: Vec<String>,

    /// Dangerous operations explicitly permitted
    #[serde(default)]
    pub allowed_dangerous: Vec<String>,

    /// Per-prefix escape hatches: operations under a dangerous prefix
    /// (e.g. "delete_") that are still permitted
    #[serde(default)]
    pub prefix_allowlist: HashMap<String, Vec<String>>,

    /// Branch names mutations may never touch
    #[serde(default)]
    pub protected_branches: Vec<String>,

    /// Team names mutations may never touch
    #[serde(default)]
    pub protected_teams: Vec<String>,

    /// Repository names mutations may never touch
    #[serde(default)]
    pub protected_repos: Vec<String>,
}

/// Configuration for one adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_url: String,

    /// Separate endpoint for uploads, when the upstream has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    /// Items per page for paginated fetches
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Hard cap on pages fetched in one paginated call
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Delay between page fetches (milliseconds)
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

fn default_per_page() -> u32 {
    100
}
fn default_max_pages() -> u32 {
    10
}
fn default_page_delay_ms() -> u64 {
    50
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("gateway", &self.gateway)
            .field("session", &self.session)
            .field("context", &self.context)
            .field("adapters", &self.adapters)
            .finish()
    }
}

impl AppConfig {
    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("AGENTMESH_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Ok(port) = std::env::var("AGENTMESH_GATEWAY_PORT")
            && let Ok(port) = port.parse()
        {
            self.gateway.port = port;
        }
        if let Ok(ttl) = std::env::var("AGENTMESH_SESSION_TTL_SECONDS")
            && let Ok(ttl) = ttl.parse()
        {
            self.session.ttl_seconds = ttl;
        }
    }

    /// Validate cross-field constraints. Called by `load`/`from_env`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.send_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "gateway.send_queue_depth must be > 0".into(),
            ));
        }
        if self.gateway.violation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "gateway.violation_threshold must be > 0".into(),
            ));
        }
        if self.session.ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "session.ttl_seconds must be > 0".into(),
            ));
        }
        for (name, adapter) in &self.adapters {
            if adapter.base_url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "adapters.{name}.base_url must not be empty"
                )));
            }
            if adapter.per_page == 0 || adapter.max_pages == 0 {
                return Err(ConfigError::Invalid(format!(
                    "adapters.{name}: per_page and max_pages must be > 0"
                )));
            }
        }
        Ok(())
    }
}
