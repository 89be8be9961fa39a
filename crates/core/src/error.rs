//! Error types for the AgentMesh domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant. Every application error
//! maps to a numeric wire code via [`Error::code`], and to a retriability
//! class via [`Error::is_transient`] — no string matching anywhere.

use thiserror::Error;

/// The top-level error type for all AgentMesh operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Resilience errors ---
    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    // --- Adapter errors ---
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    // --- Context errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Gateway errors ---
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The application-layer wire code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Error::Resilience(e) => e.code(),
            Error::Adapter(e) => e.code(),
            Error::Context(e) => e.code(),
            Error::Session(e) => e.code(),
            Error::Gateway(e) => e.code(),
            Error::Config { .. } | Error::Internal(_) => codes::INTERNAL,
            Error::Serialization(_) => codes::INVALID_PARAMS,
        }
    }

    /// Whether this error is worth retrying (network faults, 5xx, rate
    /// limits, transient storage failures). Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Resilience(e) => {
                matches!(
                    e,
                    ResilienceError::RateLimited { .. } | ResilienceError::Timeout { .. }
                )
            }
            Error::Adapter(e) => match e {
                AdapterError::Network { .. } | AdapterError::RateLimited { .. } => true,
                AdapterError::Upstream { status, .. } => *status >= 500,
                _ => false,
            },
            Error::Context(e) => matches!(e, ContextError::Storage(_)),
            _ => false,
        }
    }
}

/// Application-layer wire codes. Transport close codes are separate.
pub mod codes {
    pub const UNAUTHORIZED: u16 = 4001;
    pub const RATE_LIMITED: u16 = 4002;
    pub const METHOD_NOT_FOUND: u16 = 4003;
    pub const INVALID_PARAMS: u16 = 4004;
    pub const RESTRICTED_OPERATION: u16 = 4005;
    pub const SESSION_EXPIRED: u16 = 4101;
    pub const CONTEXT_NOT_FOUND: u16 = 4102;
    pub const CYCLIC_VALUE: u16 = 4103;
    pub const INTERNAL: u16 = 5000;
    pub const CIRCUIT_OPEN: u16 = 5001;
    pub const BULKHEAD_FULL: u16 = 5002;
    pub const TIMEOUT: u16 = 5003;
    pub const UPSTREAM_ERROR: u16 = 5004;
    pub const BACKPRESSURE: u16 = 5101;
    pub const CANCELLED: u16 = 5102;
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error("Circuit breaker is open ({failures} failures in window)")]
    CircuitOpen { failures: u32 },

    #[error("Bulkhead full: no permit within {waited_ms}ms")]
    BulkheadFull { waited_ms: u64 },

    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Rate limited, no token within {waited_ms}ms")]
    RateLimited { waited_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl ResilienceError {
    pub fn code(&self) -> u16 {
        match self {
            ResilienceError::CircuitOpen { .. } => codes::CIRCUIT_OPEN,
            ResilienceError::BulkheadFull { .. } => codes::BULKHEAD_FULL,
            ResilienceError::Timeout { .. } => codes::TIMEOUT,
            ResilienceError::RateLimited { .. } => codes::RATE_LIMITED,
            ResilienceError::Cancelled => codes::CANCELLED,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("Unauthorized against upstream for adapter '{adapter}'")]
    Unauthorized { adapter: String },

    #[error("Rate limited by upstream for adapter '{adapter}'")]
    RateLimited {
        adapter: String,
        /// Upstream reset hint (epoch seconds), if provided.
        reset_at: Option<i64>,
    },

    #[error("Upstream error for adapter '{adapter}': {status} {message}")]
    Upstream {
        adapter: String,
        status: u16,
        message: String,
        operation: Option<String>,
        resource: Option<String>,
        rate_limit: Option<crate::adapter::RateLimitInfo>,
    },

    #[error("Network error for adapter '{adapter}': {message}")]
    Network { adapter: String, message: String },

    #[error("Restricted operation '{operation}' on adapter '{adapter}': {reason}")]
    Restricted {
        adapter: String,
        operation: String,
        reason: String,
    },

    #[error("GraphQL response for adapter '{adapter}' had no data: {errors}")]
    GraphQlNoData { adapter: String, errors: String },

    #[error("Invalid adapter request: {0}")]
    InvalidRequest(String),

    #[error("Adapter not registered: {0}")]
    NotRegistered(String),
}

impl AdapterError {
    pub fn code(&self) -> u16 {
        match self {
            AdapterError::Unauthorized { .. } => codes::UNAUTHORIZED,
            AdapterError::RateLimited { .. } => codes::RATE_LIMITED,
            AdapterError::Upstream { .. }
            | AdapterError::Network { .. }
            | AdapterError::GraphQlNoData { .. } => codes::UPSTREAM_ERROR,
            AdapterError::Restricted { .. } => codes::RESTRICTED_OPERATION,
            AdapterError::InvalidRequest(_) => codes::INVALID_PARAMS,
            AdapterError::NotRegistered(_) => codes::METHOD_NOT_FOUND,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("Context not found: {0}")]
    NotFound(String),

    #[error("Value contains a cycle or exceeds depth limit ({depth})")]
    CyclicValue { depth: usize },

    #[error("Context storage error: {0}")]
    Storage(String),
}

impl ContextError {
    pub fn code(&self) -> u16 {
        match self {
            ContextError::NotFound(_) => codes::CONTEXT_NOT_FOUND,
            ContextError::CyclicValue { .. } => codes::CYCLIC_VALUE,
            ContextError::Storage(_) => codes::UPSTREAM_ERROR,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session '{session_id}' is in state '{state}'")]
    InvalidState { session_id: String, state: String },
}

impl SessionError {
    pub fn code(&self) -> u16 {
        match self {
            SessionError::Expired(_) => codes::SESSION_EXPIRED,
            SessionError::NotFound(_) | SessionError::InvalidState { .. } => codes::INVALID_PARAMS,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request rate limit exceeded for connection")]
    RateLimited,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Send queue overflow on connection {conn_id}")]
    Backpressure { conn_id: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(_) => codes::UNAUTHORIZED,
            GatewayError::RateLimited => codes::RATE_LIMITED,
            GatewayError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            GatewayError::InvalidParams(_) => codes::INVALID_PARAMS,
            GatewayError::Backpressure { .. } => codes::BACKPRESSURE,
            GatewayError::Cancelled => codes::CANCELLED,
        }
    }
}
