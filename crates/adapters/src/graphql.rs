//! GraphQL calls through the engine.
//!
//! POSTs a `{query, variables}` envelope, parses both `data` and `errors`,
//! and supports batching named sub-queries into one outer query with
//! per-name result dispatch and `path[0]` error attribution.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use agentmesh_core::error::{AdapterError, ResilienceError, Result};

use crate::invoker::Invoker;

/// Default endpoint path for GraphQL upstreams.
const GRAPHQL_PATH: &str = "graphql";

/// Most sub-queries allowed in one batched outer query.
pub const MAX_BATCH: usize = 10;

/// One named sub-query: `alias` keys the result, `selection` is the field
/// selection text (e.g. `repository(owner: "o", name: "r") { stargazerCount }`).
#[derive(Debug, Clone)]
pub struct NamedQuery {
    pub alias: String,
    pub selection: String,
}

/// Outcome of a batched call: per-alias data and per-alias errors.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub data: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    path: Vec<Value>,
}

impl Invoker {
    /// Execute a GraphQL query and decode `data` into `T`.
    ///
    /// Empty `data` with errors present is `GraphQlNoData`. Non-empty
    /// `data` alongside errors returns the data and surfaces the errors
    /// through the metrics sink.
    pub async fn graphql_call<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        query: &str,
        variables: Value,
    ) -> Result<T> {
        let envelope = self.graphql_raw(cancel, query, variables).await?;
        Ok(serde_json::from_value(envelope)?)
    }

    /// Execute up to [`MAX_BATCH`] named sub-queries as one outer query.
    /// Larger inputs are chunked into several upstream calls.
    pub async fn graphql_batch(
        &self,
        cancel: &CancellationToken,
        queries: &[NamedQuery],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for chunk in queries.chunks(MAX_BATCH) {
            let selections: Vec<String> = chunk
                .iter()
                .map(|q| format!("{}: {}", q.alias, q.selection))
                .collect();
            let outer = format!("query {{ {} }}", selections.join(" "));

            let envelope = match self.graphql_envelope(cancel, &outer, Value::Null).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Attribute a whole-chunk failure to every alias in it.
                    for q in chunk {
                        outcome.errors.insert(q.alias.clone(), e.to_string());
                    }
                    continue;
                }
            };

            if let Some(Value::Object(map)) = envelope.data {
                for (alias, value) in map {
                    outcome.data.insert(alias, value);
                }
            }
            for error in envelope.errors {
                let alias = error
                    .path
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("<root>");
                outcome.errors.insert(alias.to_string(), error.message);
            }
        }

        Ok(outcome)
    }

    /// Shared POST + envelope parsing. Returns `data`, logging partial
    /// errors.
    async fn graphql_raw(
        &self,
        cancel: &CancellationToken,
        query: &str,
        variables: Value,
    ) -> Result<Value> {
        let envelope = self.graphql_envelope(cancel, query, variables).await?;

        if !envelope.errors.is_empty() {
            // Partial success: hand the data back, log the errors.
            for error in &envelope.errors {
                let alias = error
                    .path
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("<root>");
                warn!(adapter = %self.name(), alias = %alias, error = %error.message, "GraphQL partial error");
            }
        }

        Ok(envelope.data.unwrap_or(Value::Null))
    }

    /// POST the envelope through the resilience stack and check for the
    /// no-data case.
    async fn graphql_envelope(
        &self,
        cancel: &CancellationToken,
        query: &str,
        variables: Value,
    ) -> Result<GraphQlEnvelope> {
        let body = serde_json::json!({
            "query": query,
            "variables": variables,
        });

        let body_ref = &body;
        let raw = self
            .resilience()
            .call(cancel, move |token| async move {
                self.graphql_post(&token, body_ref).await
            })
            .await?;

        let envelope: GraphQlEnvelope = serde_json::from_value(raw)?;

        let data_empty = match &envelope.data {
            None | Some(Value::Null) => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        };

        if data_empty && !envelope.errors.is_empty() {
            let joined: Vec<String> = envelope.errors.iter().map(|e| e.message.clone()).collect();
            return Err(AdapterError::GraphQlNoData {
                adapter: self.name().to_string(),
                errors: joined.join("; "),
            }
            .into());
        }

        Ok(envelope)
    }

    async fn graphql_post(&self, token: &CancellationToken, body: &Value) -> Result<Value> {
        let url = format!(
            "{}/{}",
            self.config().base_url.trim_end_matches('/'),
            GRAPHQL_PATH
        );

        let mut request = self.http_client().post(&url).json(body);
        for (key, value) in self.credential_headers()? {
            request = request.header(&key, &value);
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(ResilienceError::Cancelled.into()),
            sent = request.send() => sent.map_err(|e| AdapterError::Network {
                adapter: self.name().to_string(),
                message: e.to_string(),
            })?,
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Upstream {
                adapter: self.name().to_string(),
                status,
                message,
                operation: Some("graphql".into()),
                resource: None,
                rate_limit: None,
            }
            .into());
        }

        Ok(response.json().await.map_err(|e| AdapterError::Network {
            adapter: self.name().to_string(),
            message: e.to_string(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::tests_support::test_invoker;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn decodes_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"repository": {"stargazerCount": 42}}
            })))
            .mount(&server)
            .await;

        #[derive(Deserialize)]
        struct Data {
            repository: Repo,
        }
        #[derive(Deserialize)]
        struct Repo {
            #[serde(rename = "stargazerCount")]
            stars: u32,
        }

        let data: Data = test_invoker(&server)
            .graphql_call(
                &CancellationToken::new(),
                "query { repository(owner: \"o\", name: \"r\") { stargazerCount } }",
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(data.repository.stars, 42);
    }

    #[tokio::test]
    async fn no_data_with_errors_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{"message": "Field 'nope' doesn't exist"}]
            })))
            .mount(&server)
            .await;

        let err = test_invoker(&server)
            .graphql_call::<Value>(&CancellationToken::new(), "query { nope }", Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no data"));
        assert_eq!(err.code(), 5004);
    }

    #[tokio::test]
    async fn partial_errors_still_return_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"good": {"id": 1}},
                "errors": [{"message": "bad field", "path": ["bad"]}]
            })))
            .mount(&server)
            .await;

        let data: Value = test_invoker(&server)
            .graphql_call(&CancellationToken::new(), "query { good bad }", Value::Null)
            .await
            .unwrap();
        assert_eq!(data["good"]["id"], 1);
    }

    #[tokio::test]
    async fn batch_dispatches_per_alias() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_partial_json(json!({})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"q0": {"id": "a"}, "q1": {"id": "b"}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let queries = vec![
            NamedQuery {
                alias: "q0".into(),
                selection: "repository(owner: \"o\", name: \"a\") { id }".into(),
            },
            NamedQuery {
                alias: "q1".into(),
                selection: "repository(owner: \"o\", name: \"b\") { id }".into(),
            },
        ];

        let outcome = test_invoker(&server)
            .graphql_batch(&CancellationToken::new(), &queries)
            .await
            .unwrap();
        assert_eq!(outcome.data.len(), 2);
        assert_eq!(outcome.data["q0"]["id"], "a");
        assert_eq!(outcome.data["q1"]["id"], "b");
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_chunked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .expect(2) // 12 queries → two chunks of ≤ 10
            .mount(&server)
            .await;

        let queries: Vec<NamedQuery> = (0..12)
            .map(|i| NamedQuery {
                alias: format!("q{i}"),
                selection: "viewer { login }".into(),
            })
            .collect();

        test_invoker(&server)
            .graphql_batch(&CancellationToken::new(), &queries)
            .await
            .unwrap();
    }
}
