//! The shared outbound invocation engine.
//!
//! Every adapter call goes through here: the operation-safety gate,
//! credential injection, the composed resilience stack, ETag-conditional
//! GETs served from the response cache on `304`, typed mapping of upstream
//! statuses, rate-limit header surfacing, and success/failure event
//! emission onto the adapter bus.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentmesh_config::AdapterConfig;
use agentmesh_core::adapter::RateLimitInfo;
use agentmesh_core::error::{AdapterError, ResilienceError, Result};
use agentmesh_core::event::{AdapterEvent, AdapterEventType, meta};
use agentmesh_core::metrics::{MetricsSink, NoopMetrics};
use agentmesh_events::AdapterEventBus;
use agentmesh_resilience::ResilienceStack;
use agentmesh_security::credentials::{self, CredentialProvider};
use agentmesh_security::safety::{OperationCheck, OperationPolicy};

use crate::cache::{EtagCache, ResponseCache};

/// One REST call through the engine.
#[derive(Debug, Clone)]
pub struct RestCall {
    pub method: Method,
    pub path: String,

    /// Query pairs, appended in order
    pub query: Vec<(String, String)>,

    /// JSON body for mutating calls
    pub body: Option<Value>,

    /// Extra headers beyond credentials and `Accept`
    pub headers: Vec<(String, String)>,

    /// Route to the upload endpoint instead of the API base
    pub is_upload: bool,

    /// Operation name, used by the safety gate and error annotation
    pub operation: String,

    /// Context to associate emitted events with
    pub context_id: Option<String>,
}

impl RestCall {
    pub fn new(method: Method, path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            is_upload: false,
            operation: operation.into(),
            context_id: None,
        }
    }

    pub fn get(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(Method::GET, path, operation)
    }

    pub fn post(path: impl Into<String>, operation: impl Into<String>, body: Value) -> Self {
        let mut call = Self::new(Method::POST, path, operation);
        call.body = Some(body);
        call
    }

    pub fn delete(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, operation)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn upload(mut self) -> Self {
        self.is_upload = true;
        self
    }

    /// GET and HEAD never mutate; everything else passes the safety gate.
    pub fn is_read_only(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// The per-adapter invocation engine.
pub struct Invoker {
    name: String,
    client: reqwest::Client,
    config: AdapterConfig,
    credentials: Box<dyn CredentialProvider>,
    stack: ResilienceStack,
    policy: OperationPolicy,
    etags: EtagCache,
    responses: ResponseCache,
    metrics: Arc<dyn MetricsSink>,
    events: Option<Arc<AdapterEventBus>>,
    configured_rate: f64,
}

impl Invoker {
    pub fn new(name: impl Into<String>, config: AdapterConfig) -> Self {
        let hard_timeout = Duration::from_millis(
            config.resilience.timeout.timeout_ms + config.resilience.timeout.grace_ms,
        );
        let client = reqwest::Client::builder()
            .timeout(hard_timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            client,
            credentials: credentials::from_config(&config.auth),
            stack: ResilienceStack::new(config.resilience.clone()),
            policy: OperationPolicy::from_config(&config.safety),
            etags: EtagCache::new(),
            responses: ResponseCache::new(),
            metrics: Arc::new(NoopMetrics),
            events: None,
            configured_rate: config.resilience.rate_limiter.rate,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<AdapterEventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub(crate) fn resilience(&self) -> &ResilienceStack {
        &self.stack
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn credential_headers(&self) -> Result<Vec<(String, String)>> {
        self.credentials.headers()
    }

    pub fn etag_for(&self, path: &str) -> Option<String> {
        self.etags.get(path)
    }

    /// Gate a mutating operation before anything leaves the process.
    pub fn check_safety(&self, operation: &str, params: &Value) -> Result<()> {
        match self.policy.check(operation, params) {
            OperationCheck::Allowed => Ok(()),
            OperationCheck::Denied { operation, reason } => {
                self.metrics.incr_counter(
                    "adapter.restricted",
                    &[("adapter", &self.name), ("operation", &operation)],
                );
                Err(AdapterError::Restricted {
                    adapter: self.name.clone(),
                    operation,
                    reason,
                }
                .into())
            }
        }
    }

    /// Perform a REST call with the full engine behavior.
    pub async fn rest_call(&self, cancel: &CancellationToken, call: RestCall) -> Result<Value> {
        if !call.is_read_only() {
            self.check_safety(
                &call.operation,
                call.body.as_ref().unwrap_or(&Value::Null),
            )?;
        }

        let url = self.url_for(&call)?;
        let cache_key = Self::cache_key(&call);
        let started = Instant::now();

        let call_ref = &call;
        let url_ref = url.as_str();
        let key_ref = cache_key.as_str();
        let outcome = self
            .stack
            .call(cancel, move |token| async move {
                self.send_once(&token, call_ref, url_ref, key_ref).await
            })
            .await;

        let elapsed = started.elapsed().as_millis() as u64;
        let labels = [
            ("adapter", self.name.as_str()),
            ("operation", call.operation.as_str()),
        ];
        match &outcome {
            Ok(value) => {
                self.metrics.record_timing("adapter.call", elapsed, &labels);
                self.metrics.incr_counter("adapter.call.success", &labels);
                self.emit(
                    AdapterEventType::OperationSuccess,
                    value.clone(),
                    &call,
                    None,
                );
            }
            Err(e) => {
                self.metrics
                    .record_error("adapter.call", &e.to_string(), &labels);
                self.emit(
                    AdapterEventType::OperationFailure,
                    Value::Null,
                    &call,
                    Some(e.to_string()),
                );
            }
        }

        outcome
    }

    /// One attempt: build, send, map.
    async fn send_once(
        &self,
        token: &CancellationToken,
        call: &RestCall,
        url: &str,
        cache_key: &str,
    ) -> Result<Value> {
        let is_get = call.method == Method::GET;

        let mut request = self.client.request(call.method.clone(), url);
        for (key, value) in self.credentials.headers()? {
            request = request.header(&key, &value);
        }
        for (key, value) in &call.headers {
            request = request.header(key, value);
        }
        request = request.header("Accept", "application/json");
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        // Conditional GET only when we hold both the ETag and the body.
        if is_get
            && let Some(etag) = self.etags.get(cache_key)
            && self.responses.get(cache_key).is_some()
        {
            request = request.header("If-None-Match", &etag);
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(ResilienceError::Cancelled.into()),
            sent = request.send() => sent.map_err(|e| AdapterError::Network {
                adapter: self.name.clone(),
                message: e.to_string(),
            })?,
        };

        let status = response.status().as_u16();
        let rate_limit = Self::rate_limit_info(response.headers());
        self.observe_rate_limit(&rate_limit);

        if status == 304 {
            debug!(adapter = %self.name, path = %cache_key, "304 Not Modified — serving cached body");
            self.metrics
                .incr_counter("adapter.cache.hit", &[("adapter", &self.name)]);
            return Ok(self.responses.get(cache_key).unwrap_or(Value::Null));
        }

        if (200..300).contains(&status) {
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let bytes = response.bytes().await.map_err(|e| AdapterError::Network {
                adapter: self.name.clone(),
                message: e.to_string(),
            })?;
            let value: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes)?
            };

            if is_get {
                if let Some(etag) = etag {
                    self.etags.put(cache_key, etag);
                }
                self.responses.put(cache_key, value.clone());
            } else {
                // A mutation invalidates whatever we held for that path.
                self.etags.invalidate(cache_key);
                self.responses.invalidate(cache_key);
            }
            return Ok(value);
        }

        let body_text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body_text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(body_text);

        let err = match status {
            401 => AdapterError::Unauthorized {
                adapter: self.name.clone(),
            },
            403 if rate_limit.remaining == Some(0) => AdapterError::RateLimited {
                adapter: self.name.clone(),
                reset_at: rate_limit.reset,
            },
            429 => AdapterError::RateLimited {
                adapter: self.name.clone(),
                reset_at: rate_limit.reset,
            },
            _ => AdapterError::Upstream {
                adapter: self.name.clone(),
                status,
                message,
                operation: Some(call.operation.clone()),
                resource: Self::extract_resource(&call.path),
                rate_limit: Some(rate_limit),
            },
        };
        Err(err.into())
    }

    fn url_for(&self, call: &RestCall) -> Result<String> {
        let base = if call.is_upload {
            self.config
                .upload_url
                .as_deref()
                .ok_or_else(|| AdapterError::InvalidRequest("no upload URL configured".into()))?
        } else {
            self.config.base_url.as_str()
        };
        Ok(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            call.path.trim_start_matches('/')
        ))
    }

    fn cache_key(call: &RestCall) -> String {
        if call.query.is_empty() {
            return call.path.clone();
        }
        let query: Vec<String> = call
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}?{}", call.path, query.join("&"))
    }

    /// owner/name for repo paths, the org/user for those collections.
    fn extract_resource(path: &str) -> Option<String> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["repos", owner, repo, ..] => Some(format!("{owner}/{repo}")),
            ["orgs", org, ..] => Some((*org).to_string()),
            ["users", user, ..] => Some((*user).to_string()),
            _ => None,
        }
    }

    fn rate_limit_info(headers: &HeaderMap) -> RateLimitInfo {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        RateLimitInfo {
            limit: read("x-ratelimit-limit"),
            remaining: read("x-ratelimit-remaining"),
            reset: headers
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok()),
            used: read("x-ratelimit-used"),
        }
    }

    /// Slow down to what the upstream says is left in its window; never
    /// above the configured rate.
    fn observe_rate_limit(&self, info: &RateLimitInfo) {
        let (Some(remaining), Some(reset)) = (info.remaining, info.reset) else {
            return;
        };
        let window = (reset - chrono::Utc::now().timestamp()).max(1) as f64;
        let upstream_rate = remaining as f64 / window;
        if upstream_rate < self.configured_rate {
            self.stack.limiter().set_rate(upstream_rate.max(0.1));
        }
    }

    fn emit(
        &self,
        event_type: AdapterEventType,
        payload: Value,
        call: &RestCall,
        error: Option<String>,
    ) {
        let Some(bus) = &self.events else {
            return;
        };
        let mut event = AdapterEvent::new(&self.name, event_type, payload)
            .with_meta(meta::OPERATION, &call.operation);
        if let Some(context_id) = &call.context_id {
            event = event.with_meta(meta::CONTEXT_ID, context_id);
        }
        if let Some(error) = error {
            event = event.with_meta(meta::ERROR, error);
        }
        if let Err(e) = bus.publish(&event) {
            // Observer failures never affect the call outcome.
            warn!(adapter = %self.name, error = %e, "Event listener failed after adapter call");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::test_invoker;
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn invoker(server: &MockServer) -> Invoker {
        test_invoker(server)
    }

    #[tokio::test]
    async fn get_decodes_and_sends_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "r"})))
            .expect(1)
            .mount(&server)
            .await;

        let value = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::get("repos/o/r", "get_repo"),
            )
            .await
            .unwrap();
        assert_eq!(value["name"], "r");
    }

    #[tokio::test]
    async fn etag_stored_then_304_served_from_cache() {
        let server = MockServer::start().await;

        // Conditional request short-circuits; mounted first so it wins.
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_json(json!({"name": "r", "stars": 7})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let invoker = invoker(&server);
        let cancel = CancellationToken::new();

        let first = invoker
            .rest_call(&cancel, RestCall::get("repos/o/r", "get_repo"))
            .await
            .unwrap();
        assert_eq!(invoker.etag_for("repos/o/r").as_deref(), Some("\"v1\""));

        let second = invoker
            .rest_call(&cancel, RestCall::get("repos/o/r", "get_repo"))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn restricted_operation_never_reaches_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::delete("repos/o/r", "delete_repository"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4005);
    }

    #[tokio::test]
    async fn protected_branch_blocked_by_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::post(
                    "repos/o/r/merges",
                    "merge_branch",
                    json!({"branch": "main"}),
                ),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4005);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_4001() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::get("repos/o/r", "get_repo"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4001);
    }

    #[tokio::test]
    async fn forbidden_with_exhausted_quota_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1999999999"),
            )
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::get("repos/o/r", "get_repo"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 4002);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"message": "down"})))
            .expect(3) // retry config allows 3 attempts
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::get("repos/o/r", "get_repo"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 5004);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn client_errors_are_not_retried_and_annotated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"message": "nope"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = invoker(&server)
            .rest_call(
                &CancellationToken::new(),
                RestCall::get("repos/o/r", "get_repo"),
            )
            .await
            .unwrap_err();

        match err {
            agentmesh_core::error::Error::Adapter(AdapterError::Upstream {
                status,
                message,
                operation,
                resource,
                ..
            }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "nope");
                assert_eq!(operation.as_deref(), Some("get_repo"));
                assert_eq!(resource.as_deref(), Some("o/r"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn success_and_failure_events_emitted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "nf"})))
            .mount(&server)
            .await;

        let bus = Arc::new(AdapterEventBus::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.register("github", "*", Arc::new(move |event| {
            let _ = tx.send((event.event_type.clone(), event.metadata.clone()));
            Ok(())
        }));

        let invoker = invoker(&server).with_event_bus(bus);
        let cancel = CancellationToken::new();

        invoker
            .rest_call(
                &cancel,
                RestCall::get("repos/o/r", "get_repo").with_context("ctx_1"),
            )
            .await
            .unwrap();
        let (event_type, metadata) = rx.recv().await.unwrap();
        assert_eq!(event_type, AdapterEventType::OperationSuccess);
        assert_eq!(metadata.get(meta::OPERATION).unwrap(), "get_repo");
        assert_eq!(metadata.get(meta::CONTEXT_ID).unwrap(), "ctx_1");

        let _ = invoker
            .rest_call(&cancel, RestCall::get("repos/o/missing", "get_repo"))
            .await
            .unwrap_err();
        let (event_type, metadata) = rx.recv().await.unwrap();
        assert_eq!(event_type, AdapterEventType::OperationFailure);
        assert!(metadata.contains_key(meta::ERROR));
    }

    #[tokio::test]
    async fn mutation_invalidates_cached_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_json(json!({"name": "r"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/o/r"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"updated": true})))
            .mount(&server)
            .await;

        let invoker = invoker(&server);
        let cancel = CancellationToken::new();

        invoker
            .rest_call(&cancel, RestCall::get("repos/o/r", "get_repo"))
            .await
            .unwrap();
        assert!(invoker.etag_for("repos/o/r").is_some());

        invoker
            .rest_call(
                &cancel,
                RestCall::post("repos/o/r", "update_repo", json!({"name": "r2"})),
            )
            .await
            .unwrap();
        assert!(invoker.etag_for("repos/o/r").is_none());
    }

    #[test]
    fn resource_extraction() {
        assert_eq!(
            Invoker::extract_resource("repos/octo/hello/issues"),
            Some("octo/hello".into())
        );
        assert_eq!(Invoker::extract_resource("orgs/acme"), Some("acme".into()));
        assert_eq!(Invoker::extract_resource("rate_limit"), None);
    }

    #[test]
    fn cache_key_includes_query() {
        let call = RestCall::get("repos/o/r/issues", "list_issues")
            .with_query("state", "open")
            .with_query("page", "2");
        assert_eq!(Invoker::cache_key(&call), "repos/o/r/issues?state=open&page=2");
    }
}
