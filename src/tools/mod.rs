//! Tool contract and registry.
//!
//! A tool is `init` + `run(args) -> result` + a static capability document.
//! The registry owns dispatch: name matching tolerant of LLM spellings,
//! argument-shape normalization, and crash-to-failure mapping so the loop
//! only ever sees result values.

pub mod args;
pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::llm::ChatBackend;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Capability document: a human-readable schema of operations, argument
    /// shapes and result shape, taught to the LLM via the condensed context.
    fn capability(&self) -> String;

    /// One-time setup; tools without state keep the default.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value>;

    /// Names that positional argument arrays map onto, in order.
    fn positional_keys(&self) -> &[&str] {
        &[]
    }
}

/// Collapse a tool name to its canonical spelling: lowercase, underscores
/// removed, a trailing `tool` suffix dropped. `FileReadTool`, `file_read`
/// and `fileread` all resolve identically.
pub fn canonical_name(name: &str) -> String {
    let folded: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match folded.strip_suffix("tool") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => folded,
    }
}

pub fn tool_err(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": message.into() })
}

pub fn tool_ok(mut payload: Value) -> Value {
    if !payload.is_object() {
        payload = json!({ "result": payload });
    }
    payload["success"] = json!(true);
    payload
}

/// A result counts as failed when it says so or carries a non-null error.
pub fn is_failure(result: &Value) -> bool {
    if result.get("success").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    matches!(result.get("error"), Some(e) if !e.is_null())
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let key = canonical_name(tool.name());
        self.index.insert(key, self.tools.len());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index
            .get(&canonical_name(name))
            .map(|&i| self.tools[i].clone())
    }

    pub fn list(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub async fn init_all(&self) -> anyhow::Result<()> {
        for tool in &self.tools {
            tool.init()
                .await
                .map_err(|e| anyhow::anyhow!("Tool '{}' failed to init: {e}", tool.name()))?;
            info!("Tool '{}' initialized", tool.name());
        }
        Ok(())
    }

    /// Every capability document, concatenated. This is the uncompressed
    /// input to the condensation pass.
    pub fn capability_context(&self) -> String {
        let mut out = String::new();
        for tool in &self.tools {
            out.push_str(&format!("## Tool: {}\n", tool.name()));
            out.push_str(tool.capability().trim_end());
            out.push_str("\n\n");
        }
        out
    }

    /// Dispatch an action's tool call. Never errors: unknown tools, bad
    /// arguments and crashes all come back as failure values the model can
    /// read and react to.
    pub async fn dispatch(&self, name: &str, raw_args: &Value) -> Value {
        let Some(tool) = self.get(name) else {
            let known: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
            return tool_err(format!(
                "Unknown tool '{}'. Available tools: {}",
                name,
                known.join(", ")
            ));
        };

        let normalized = args::normalize(raw_args, tool.positional_keys());
        match tool.run(normalized).await {
            Ok(result) => result,
            Err(e) => {
                error!("Tool '{}' crashed: {e:#}", tool.name());
                json!({ "success": false, "error": e.to_string(), "exitCode": 1 })
            }
        }
    }
}

/// Summarize the full capability context into the Condensed Tool Context.
/// Runs once per process lifetime; a failed or empty condensation falls back
/// to the uncompressed text.
pub async fn compile_condensed_context(
    registry: &ToolRegistry,
    llm: &dyn ChatBackend,
    model: &str,
) -> String {
    let full = registry.capability_context();
    let prompt = format!(
        "Condense the following tool reference into the shortest form that still \
         lists every tool, every operation, and every argument name with its type. \
         Drop prose and examples. Output plain text only.\n\n{full}"
    );
    match llm.completion(model, &prompt).await {
        Ok(condensed) if !condensed.trim().is_empty() => condensed.trim().to_string(),
        Ok(_) => {
            warn!("Tool context condensation returned empty text; using full context");
            full
        }
        Err(e) => {
            warn!("Tool context condensation failed ({e}); using full context");
            full
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "file_read"
        }

        fn capability(&self) -> String {
            "file_read(filepath) -> {success, content}".to_string()
        }

        async fn run(&self, args: Value) -> anyhow::Result<Value> {
            Ok(tool_ok(json!({ "echo": args })))
        }

        fn positional_keys(&self) -> &[&str] {
            &["filepath"]
        }
    }

    struct CrashTool;

    #[async_trait]
    impl Tool for CrashTool {
        fn name(&self) -> &str {
            "crash"
        }

        fn capability(&self) -> String {
            "crash() -> never".to_string()
        }

        async fn run(&self, _args: Value) -> anyhow::Result<Value> {
            anyhow::bail!("boom")
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(CrashTool));
        registry
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("FileReadTool"), "fileread");
        assert_eq!(canonical_name("file_read"), "fileread");
        assert_eq!(canonical_name("FILEREAD"), "fileread");
        assert_eq!(canonical_name("cron"), "cron");
        assert_eq!(canonical_name("web-search"), "websearch");
    }

    #[test]
    fn test_lookup_tolerant_spellings() {
        let registry = registry();
        for name in ["file_read", "FileReadTool", "fileread", "File_Read"] {
            assert!(registry.get(name).is_some(), "lookup failed for {name}");
        }
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool_is_failure() {
        let registry = registry();
        let result = registry.dispatch("nope", &json!({})).await;
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("file_read"));
    }

    #[tokio::test]
    async fn test_dispatch_crash_maps_to_failure() {
        let registry = registry();
        let result = registry.dispatch("crash", &json!({})).await;
        assert!(is_failure(&result));
        assert_eq!(result["exitCode"], json!(1));
        assert_eq!(result["error"], json!("boom"));
    }

    #[tokio::test]
    async fn test_dispatch_normalizes_positional() {
        let registry = registry();
        let result = registry.dispatch("file_read", &json!(["/tmp/a.txt"])).await;
        assert_eq!(result["echo"]["filepath"], json!("/tmp/a.txt"));
    }

    #[test]
    fn test_is_failure() {
        assert!(is_failure(&json!({"success": false})));
        assert!(is_failure(&json!({"error": "x"})));
        assert!(!is_failure(&json!({"success": true})));
        assert!(!is_failure(&json!({"error": null, "success": true})));
        assert!(!is_failure(&json!({"content": "hi"})));
    }

    #[test]
    fn test_capability_context_lists_all() {
        let registry = registry();
        let context = registry.capability_context();
        assert!(context.contains("## Tool: file_read"));
        assert!(context.contains("## Tool: crash"));
    }
}
