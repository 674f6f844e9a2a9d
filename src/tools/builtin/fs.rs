//! File system tools: read, write, patch, list.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::tools::{tool_err, tool_ok, Tool};

const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;
const MAX_LIST_ENTRIES: usize = 500;

pub struct FileReadTool;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadArgs {
    filepath: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn capability(&self) -> String {
        "file_read(filepath, offset?, limit?) -> {success, content}\n\
         Reads a text file. offset is a 1-based starting line, limit caps the \
         number of lines returned."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["filepath"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: ReadArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };

        let metadata = match tokio::fs::metadata(&args.filepath).await {
            Ok(m) => m,
            Err(e) => return Ok(tool_err(format!("Cannot access '{}': {e}", args.filepath))),
        };
        if metadata.is_dir() {
            return Ok(tool_err(format!(
                "'{}' is a directory; use file_list",
                args.filepath
            )));
        }
        if metadata.len() > MAX_READ_BYTES {
            return Ok(tool_err(format!(
                "File too large ({} bytes); read it in pieces with bash",
                metadata.len()
            )));
        }

        let content = match tokio::fs::read_to_string(&args.filepath).await {
            Ok(c) => c,
            Err(e) => return Ok(tool_err(format!("Cannot read '{}': {e}", args.filepath))),
        };

        let content = match (args.offset, args.limit) {
            (None, None) => content,
            (offset, limit) => {
                let start = offset.unwrap_or(1).max(1) - 1;
                let lines: Vec<&str> = content.lines().collect();
                let end = limit.map_or(lines.len(), |l| (start + l).min(lines.len()));
                if start >= lines.len() {
                    String::new()
                } else {
                    lines[start..end].join("\n")
                }
            }
        };

        Ok(tool_ok(json!({
            "filepath": args.filepath,
            "content": content,
        })))
    }
}

pub struct FileWriteTool;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteArgs {
    filepath: String,
    content: String,
    #[serde(default)]
    append: bool,
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn capability(&self) -> String {
        "file_write(filepath, content, append?) -> {success, bytes_written}\n\
         Writes (or appends to) a file, creating parent directories. Put the \
         content in a SKIPPY_FILE block, not in the JSON."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["filepath", "content"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: WriteArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => {
                return Ok(tool_err(format!(
                    "Invalid arguments: {e}. Multi-line content belongs in a \
                     ===SKIPPY_FILE_START block."
                )))
            }
        };

        if let Some(parent) = std::path::Path::new(&args.filepath).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(tool_err(format!("Failed to create directories: {e}")));
            }
        }

        let result = if args.append {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&args.filepath)
                .await
            {
                Ok(mut file) => file.write_all(args.content.as_bytes()).await,
                Err(e) => Err(e),
            }
        } else {
            tokio::fs::write(&args.filepath, &args.content).await
        };

        match result {
            Ok(()) => {
                info!("Wrote {} bytes to {}", args.content.len(), args.filepath);
                Ok(tool_ok(json!({
                    "filepath": args.filepath,
                    "bytes_written": args.content.len(),
                })))
            }
            Err(e) => Ok(tool_err(format!("Failed to write '{}': {e}", args.filepath))),
        }
    }
}

pub struct FilePatchTool;

#[derive(Deserialize)]
struct PatchChangeArgs {
    find: String,
    replace: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchArgs {
    filepath: String,
    changes: Vec<PatchChangeArgs>,
}

#[async_trait]
impl Tool for FilePatchTool {
    fn name(&self) -> &str {
        "patch_file"
    }

    fn capability(&self) -> String {
        "patch_file(filepath, changes: [{find, replace}]) -> {success, changes_applied}\n\
         Replaces the first occurrence of each find text. Put find/replace \
         pairs in a SKIPPY_PATCH block, not in the JSON. Fails when a find \
         text is absent from the file."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["filepath"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: PatchArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => {
                return Ok(tool_err(format!(
                    "Invalid arguments: {e}. Changes belong in a \
                     ===SKIPPY_PATCH_START block."
                )))
            }
        };
        if args.changes.is_empty() {
            return Ok(tool_err("No changes supplied"));
        }

        let mut content = match tokio::fs::read_to_string(&args.filepath).await {
            Ok(c) => c,
            Err(e) => return Ok(tool_err(format!("Cannot read '{}': {e}", args.filepath))),
        };

        for (i, change) in args.changes.iter().enumerate() {
            if !content.contains(&change.find) {
                return Ok(tool_err(format!(
                    "find text not found (change {} of {}): {:?}",
                    i + 1,
                    args.changes.len(),
                    truncate(&change.find, 120)
                )));
            }
            content = content.replacen(&change.find, &change.replace, 1);
        }

        match tokio::fs::write(&args.filepath, &content).await {
            Ok(()) => Ok(tool_ok(json!({
                "filepath": args.filepath,
                "changes_applied": args.changes.len(),
            }))),
            Err(e) => Ok(tool_err(format!("Failed to write '{}': {e}", args.filepath))),
        }
    }
}

pub struct FileListTool;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ListArgs {
    path: Option<String>,
}

#[async_trait]
impl Tool for FileListTool {
    fn name(&self) -> &str {
        "file_list"
    }

    fn capability(&self) -> String {
        "file_list(path?) -> {success, entries: [{name, kind, size}]}\n\
         Lists a directory (default: working directory)."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["path"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: ListArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };
        let path = args.path.unwrap_or_else(|| ".".to_string());

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(r) => r,
            Err(e) => return Ok(tool_err(format!("Cannot list '{path}': {e}"))),
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            if entries.len() >= MAX_LIST_ENTRIES {
                break;
            }
            let meta = entry.metadata().await.ok();
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": if meta.as_ref().is_some_and(|m| m.is_dir()) { "dir" } else { "file" },
                "size": meta.map(|m| m.len()).unwrap_or(0),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(tool_ok(json!({ "path": path, "entries": entries })))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}
