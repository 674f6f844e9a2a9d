//! Plain HTTP request tool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{tool_err, tool_ok, Tool};

const MAX_BODY_BYTES: usize = 50_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpTool {
    http: reqwest::Client,
}

impl HttpTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpArgs {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    json: Option<Value>,
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http"
    }

    fn capability(&self) -> String {
        "http(url, method?, headers?, body?, json?) -> {success, status, body}\n\
         Performs an HTTP request (default GET). The response body is \
         returned as text, truncated past 50kB. Non-2xx statuses are still \
         success=true; read the status field."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["url"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: HttpArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let method = match args
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_uppercase()
            .parse::<reqwest::Method>()
        {
            Ok(m) => m,
            Err(_) => return Ok(tool_err(format!("Invalid method '{:?}'", args.method))),
        };

        let mut builder = self
            .http
            .request(method, &args.url)
            .timeout(REQUEST_TIMEOUT);
        if let Some(headers) = &args.headers {
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = args.body {
            builder = builder.body(body);
        }
        if let Some(payload) = args.json {
            builder = builder.json(&payload);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => return Ok(tool_err(format!("Request failed: {e}"))),
        };

        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_BODY_BYTES {
            let mut cut = MAX_BODY_BYTES;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push_str("\n[body truncated]");
        }

        Ok(tool_ok(json!({ "status": status, "body": body })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_invalid_args() {
        let tool = HttpTool::new();
        let result = tool.run(json!({"nope": 1})).await.unwrap();
        assert!(is_failure(&result));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_soft_failure() {
        let tool = HttpTool::new();
        let result = tool
            .run(json!({"url": "http://127.0.0.1:1/none"}))
            .await
            .unwrap();
        assert!(is_failure(&result));
    }
}
