//! PDF text extraction via the `pdftotext` binary.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{tool_err, tool_ok, Tool};

const MAX_TEXT_BYTES: usize = 200_000;

pub struct PdfTool;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PdfArgs {
    filepath: String,
    #[serde(default)]
    first_page: Option<u32>,
    #[serde(default)]
    last_page: Option<u32>,
}

#[async_trait]
impl Tool for PdfTool {
    fn name(&self) -> &str {
        "pdf"
    }

    fn capability(&self) -> String {
        "pdf(filepath, first_page?, last_page?) -> {success, text}\n\
         Extracts text from a PDF (requires the pdftotext binary on the host)."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["filepath"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: PdfArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let mut command = tokio::process::Command::new("pdftotext");
        if let Some(first) = args.first_page {
            command.arg("-f").arg(first.to_string());
        }
        if let Some(last) = args.last_page {
            command.arg("-l").arg(last.to_string());
        }
        command.arg(&args.filepath).arg("-");

        let output = match command.output().await {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(tool_err(
                    "pdftotext is not installed on this host; ask the user to install poppler-utils",
                ))
            }
            Err(e) => return Ok(tool_err(format!("Failed to run pdftotext: {e}"))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(tool_err(format!(
                "pdftotext failed: {}",
                stderr.trim()
            )));
        }

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.len() > MAX_TEXT_BYTES {
            let mut cut = MAX_TEXT_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n[text truncated]");
        }
        Ok(tool_ok(json!({ "filepath": args.filepath, "text": text })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_missing_file_fails() {
        let result = PdfTool
            .run(json!({"filepath": "/nonexistent/x.pdf"}))
            .await
            .unwrap();
        assert!(is_failure(&result));
    }
}
