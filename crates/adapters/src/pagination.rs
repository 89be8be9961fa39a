//! Lazy pagination over REST collections.
//!
//! Pulls pages on demand: bounded by `max_pages`, a small inter-page delay
//! smooths upstream load, and a short page (fewer than `per_page` items)
//! stops the iteration early. Handles both page-number-driven upstreams
//! (bare JSON arrays) and cursor-driven ones (`{items, next_cursor}`).

use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use agentmesh_core::error::Result;

use crate::invoker::{Invoker, RestCall};

/// How the upstream pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// `?page=N&per_page=M`, response is a JSON array
    Numbered,
    /// `?cursor=...`, response is `{items: [...], next_cursor: "..."}`
    Cursor,
}

/// A lazy page iterator; create via [`Invoker::paginate`].
pub struct Paginator<'a> {
    invoker: &'a Invoker,
    path: String,
    operation: String,
    query: Vec<(String, String)>,
    mode: PageMode,
    per_page: u32,
    max_pages: u32,
    delay: Duration,
    page: u32,
    cursor: Option<String>,
    fetched: u32,
    done: bool,
}

impl Invoker {
    /// Start paginating `path` with this adapter's configured page sizes.
    pub fn paginate(
        &self,
        path: impl Into<String>,
        operation: impl Into<String>,
        mode: PageMode,
    ) -> Paginator<'_> {
        let config = self.config();
        Paginator {
            invoker: self,
            path: path.into(),
            operation: operation.into(),
            query: Vec::new(),
            mode,
            per_page: config.per_page,
            max_pages: config.max_pages,
            delay: Duration::from_millis(config.page_delay_ms),
            page: 1,
            cursor: None,
            fetched: 0,
            done: false,
        }
    }
}

impl Paginator<'_> {
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Fetch the next page, or `None` when exhausted (max pages reached,
    /// short page seen, or cursor ran out).
    pub async fn next_page(&mut self, cancel: &CancellationToken) -> Result<Option<Vec<Value>>> {
        if self.done || self.fetched >= self.max_pages {
            self.done = true;
            return Ok(None);
        }

        if self.fetched > 0 {
            tokio::time::sleep(self.delay).await;
        }

        let mut call = RestCall::get(&self.path, &self.operation);
        call.query = self.query.clone();
        call = call.with_query("per_page", self.per_page.to_string());
        match self.mode {
            PageMode::Numbered => {
                call = call.with_query("page", self.page.to_string());
            }
            PageMode::Cursor => {
                if let Some(cursor) = &self.cursor {
                    call = call.with_query("cursor", cursor.clone());
                }
            }
        }

        let value = self.invoker.rest_call(cancel, call).await?;
        self.fetched += 1;
        self.page += 1;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => {
                let items = match map.remove("items") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                match map
                    .remove("next_cursor")
                    .and_then(|v| v.as_str().map(String::from))
                {
                    Some(next) if !next.is_empty() => self.cursor = Some(next),
                    _ => self.done = true,
                }
                items
            }
            _ => Vec::new(),
        };

        if (items.len() as u32) < self.per_page {
            self.done = true;
        }

        Ok(Some(items))
    }

    /// Drain every remaining page into one vector.
    pub async fn collect_all(mut self, cancel: &CancellationToken) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(mut page) = self.next_page(cancel).await? {
            all.append(&mut page);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::tests_support::test_invoker;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn numbered_pages_until_short_page() {
        let server = MockServer::start().await;
        // per_page is 2 in the test config.
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"n": 1}, {"n": 2}])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/issues"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"n": 3}])))
            .expect(1)
            .mount(&server)
            .await;

        let invoker = test_invoker(&server);
        let items = invoker
            .paginate("repos/o/r/issues", "list_issues", PageMode::Numbered)
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["n"], 3);
    }

    #[tokio::test]
    async fn max_pages_bounds_iteration() {
        let server = MockServer::start().await;
        // Always-full pages; max_pages is 5 in the test config.
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"a": 1}, {"a": 2}])))
            .expect(5)
            .mount(&server)
            .await;

        let invoker = test_invoker(&server);
        let items = invoker
            .paginate("items", "list_items", PageMode::Numbered)
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(items.len(), 10);
    }

    #[tokio::test]
    async fn cursor_mode_follows_next_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scans"))
            .and(query_param("cursor", "c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 3}],
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scans"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"id": 1}, {"id": 2}],
                "next_cursor": "c2",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let invoker = test_invoker(&server);
        let items = invoker
            .paginate("scans", "list_scans", PageMode::Cursor)
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[2]["id"], 3);
    }

    #[tokio::test]
    async fn lazy_fetch_yields_page_by_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"a": 1}])))
            .mount(&server)
            .await;

        let invoker = test_invoker(&server);
        let cancel = CancellationToken::new();
        let mut pages = invoker.paginate("items", "list_items", PageMode::Numbered);

        let first = pages.next_page(&cancel).await.unwrap();
        assert_eq!(first.unwrap().len(), 1);

        // Short page ended the iteration.
        assert!(pages.next_page(&cancel).await.unwrap().is_none());
    }
}
