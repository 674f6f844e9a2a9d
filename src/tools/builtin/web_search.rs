//! Web search via a SearXNG instance's JSON API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::WebSearchConfig;
use crate::tools::{tool_err, tool_ok, Tool};

const DEFAULT_LIMIT: usize = 5;

pub struct WebSearchTool {
    base_url: Option<String>,
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(config: &WebSearchConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn capability(&self) -> String {
        "web_search(query, limit?) -> {success, results: [{title, url, snippet}]}\n\
         Searches the web through the configured SearXNG instance."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["query"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: SearchArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };
        if args.query.trim().is_empty() {
            return Ok(tool_err("Search query is empty"));
        }
        let Some(base) = &self.base_url else {
            return Ok(tool_err(
                "Web search is not configured (tools.web_search.url)",
            ));
        };

        let response = match self
            .http
            .get(format!("{}/search", base.trim_end_matches('/')))
            .query(&[("q", args.query.as_str()), ("format", "json")])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Ok(tool_err(format!("Search request failed: {e}"))),
        };
        if !response.status().is_success() {
            return Ok(tool_err(format!(
                "Search failed with status {}",
                response.status()
            )));
        }

        let data: Value = match response.json().await {
            Ok(d) => d,
            Err(e) => return Ok(tool_err(format!("Bad search response: {e}"))),
        };

        let limit = args.limit.unwrap_or(DEFAULT_LIMIT);
        let results: Vec<Value> = data["results"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .take(limit)
                    .map(|r| {
                        json!({
                            "title": r["title"].as_str().unwrap_or(""),
                            "url": r["url"].as_str().unwrap_or(""),
                            "snippet": r["content"].as_str().unwrap_or(""),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tool_ok(json!({ "query": args.query, "results": results })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_unconfigured_is_soft_failure() {
        let tool = WebSearchTool::new(&WebSearchConfig::default());
        let result = tool.run(json!({"query": "rust"})).await.unwrap();
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_empty_query() {
        let tool = WebSearchTool::new(&WebSearchConfig {
            url: Some("http://localhost".to_string()),
        });
        let result = tool.run(json!({"query": "  "})).await.unwrap();
        assert!(is_failure(&result));
    }
}
