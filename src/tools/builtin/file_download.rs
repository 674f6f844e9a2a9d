//! Streaming file download tool.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::tools::{tool_err, tool_ok, Tool};

pub struct FileDownloadTool {
    http: reqwest::Client,
}

impl FileDownloadTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for FileDownloadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadArgs {
    url: String,
    filepath: String,
}

#[async_trait]
impl Tool for FileDownloadTool {
    fn name(&self) -> &str {
        "file_download"
    }

    fn capability(&self) -> String {
        "file_download(url, filepath) -> {success, filepath, bytes}\n\
         Streams a URL to a local file, creating parent directories."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["url", "filepath"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: DownloadArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let response = match self.http.get(&args.url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(tool_err(format!("Request failed: {e}"))),
        };
        if !response.status().is_success() {
            return Ok(tool_err(format!(
                "Download failed with status {}",
                response.status()
            )));
        }

        if let Some(parent) = std::path::Path::new(&args.filepath).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(tool_err(format!("Failed to create directories: {e}")));
            }
        }
        let mut file = match tokio::fs::File::create(&args.filepath).await {
            Ok(f) => f,
            Err(e) => return Ok(tool_err(format!("Cannot create '{}': {e}", args.filepath))),
        };

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return Ok(tool_err(format!("Download interrupted: {e}"))),
            };
            if let Err(e) = file.write_all(&chunk).await {
                return Ok(tool_err(format!("Write failed: {e}")));
            }
            written += chunk.len() as u64;
        }
        if let Err(e) = file.flush().await {
            return Ok(tool_err(format!("Flush failed: {e}")));
        }

        info!("Downloaded {} -> {} ({} bytes)", args.url, args.filepath, written);
        Ok(tool_ok(json!({ "filepath": args.filepath, "bytes": written })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_missing_args() {
        let tool = FileDownloadTool::new();
        let result = tool.run(json!({"url": "http://x"})).await.unwrap();
        assert!(is_failure(&result));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let dir = tempfile::tempdir().unwrap();
        let tool = FileDownloadTool::new();
        let result = tool
            .run(json!({
                "url": "http://127.0.0.1:1/file",
                "filepath": dir.path().join("f").to_str().unwrap()
            }))
            .await
            .unwrap();
        assert!(is_failure(&result));
    }
}
