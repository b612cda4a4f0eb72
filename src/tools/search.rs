//! The `google_search` tool.
//!
//! The search index itself is an external collaborator behind the
//! [`SearchBackend`] trait; [`HttpSearchBackend`] speaks a simple JSON
//! search endpoint over HTTP. The payload always carries a `summary`
//! string so downstream steps can template it into emails and replies.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{require_str, ParamSpec, Tool, ToolContext, ToolError, ToolSpec};

/// Tool name registered for web search.
pub const GOOGLE_SEARCH: &str = "google_search";

/// Default number of results when `max_results` is not specified.
const DEFAULT_MAX_RESULTS: u64 = 5;

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Result title.
    pub title: String,
    /// Result URL.
    pub url: String,
    /// Short excerpt.
    #[serde(default)]
    pub snippet: String,
}

/// Search index contract.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run a query, returning at most `max_results` hits.
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError>;
}

/// Backend speaking `GET {base_url}/search?q=...&limit=...` returning
/// `{"results": [{title, url, snippet}]}`.
pub struct HttpSearchBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct WireResults {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl HttpSearchBackend {
    /// Create a backend client for the given endpoint.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ToolError> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("limit", &max_results.to_string())])
            .send()
            .await
            .map_err(|e| ToolError::Failed {
                message: format!("search request failed: {e}"),
                retry_possible: true,
            })?;

        if !response.status().is_success() {
            return Err(ToolError::Failed {
                message: format!("search endpoint returned {}", response.status()),
                retry_possible: response.status().is_server_error(),
            });
        }

        let wire: WireResults = response.json().await.map_err(|e| ToolError::Failed {
            message: format!("malformed search response: {e}"),
            retry_possible: false,
        })?;

        Ok(wire.results.into_iter().take(max_results).collect())
    }
}

/// Handler for `google_search`.
pub struct GoogleSearchTool {
    backend: Arc<dyn SearchBackend>,
}

impl GoogleSearchTool {
    /// Create the handler over a search backend.
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }

    /// Registration spec. Read-only, hence pure.
    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: GOOGLE_SEARCH.to_owned(),
            description: "Search the web and summarize the top results".to_owned(),
            parameters: vec![
                ParamSpec::new("query", "string", true),
                ParamSpec::new("max_results", "number", false),
            ],
            delivery_terminal: false,
            pure: true,
            default_deadline_ms: Some(15_000),
        }
    }
}

#[async_trait]
impl Tool for GoogleSearchTool {
    fn name(&self) -> &str {
        GOOGLE_SEARCH
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let query = require_str(&params, "query")?;
        let max_results = params
            .get("max_results")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let max_results = usize::try_from(max_results).unwrap_or(usize::MAX);

        debug!(query, max_results, "running web search");
        let hits = self.backend.search(query, max_results).await?;

        let summary = if hits.is_empty() {
            format!("No results found for \"{query}\".")
        } else {
            hits.iter()
                .map(|hit| {
                    if hit.snippet.is_empty() {
                        hit.title.clone()
                    } else {
                        format!("{}: {}", hit.title, hit.snippet)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        Ok(json!({
            "query": query,
            "result_count": hits.len(),
            "results": hits,
            "summary": summary,
        }))
    }
}
