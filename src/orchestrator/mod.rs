//! The Prompt Orchestrator: context assembly, the bounded agentic loop,
//! response parsing, tool dispatch, and abort/continuation/budget control.

pub mod context;
pub mod parser;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context_items::ContextItems;
use crate::llm::{ChatBackend, ChatRequest, ChunkSink};
use crate::memory::MemoryStore;
use crate::tools::{is_failure, ToolRegistry};

use parser::Envelope;

const FALLBACK_SUMMARY_TIMEOUT: Duration = Duration::from_secs(180);
const FALLBACK_APOLOGY: &str =
    "I finished working on your request but couldn't put together a summary. \
     Please check the tool output above.";

/// Receives status updates and raw LLM chunks for one prompt chain.
/// Discord posts bubbles, IPC writes frames, cron drops everything.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn status(&self, text: &str);

    /// Raw LLM chunks as they stream; default drops them.
    fn on_chunk(&self, _chunk: &str) {}
}

pub struct NoopStatus;

#[async_trait]
impl StatusSink for NoopStatus {
    async fn status(&self, _text: &str) {}
}

struct ChunkForward<'a>(&'a dyn StatusSink);

impl ChunkSink for ChunkForward<'_> {
    fn on_chunk(&self, chunk: &str) {
        self.0.on_chunk(chunk);
    }
}

/// Pending stop requests, keyed by channel. Polled at loop top, after each
/// LLM completion, and before each tool.
#[derive(Default)]
pub struct AbortRegistry {
    flags: Mutex<HashSet<String>>,
}

impl AbortRegistry {
    pub fn request(&self, channel: &str) {
        self.flags.lock().unwrap().insert(channel.to_string());
    }

    pub fn is_set(&self, channel: &str) -> bool {
        self.flags.lock().unwrap().contains(channel)
    }

    /// Clear and report whether a request was pending.
    pub fn consume(&self, channel: &str) -> bool {
        self.flags.lock().unwrap().remove(channel)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub result: Value,
}

#[derive(Debug, Clone)]
struct PendingContinuation {
    tool_results: Vec<ToolInvocation>,
    resume_prompt: String,
    original_prompt: String,
    loop_count: usize,
}

/// One saved continuation per channel; a newer one replaces the old.
#[derive(Default)]
pub struct Continuations {
    map: Mutex<HashMap<String, PendingContinuation>>,
}

impl Continuations {
    fn save(&self, channel: &str, pending: PendingContinuation) {
        self.map
            .lock()
            .unwrap()
            .insert(channel.to_string(), pending);
    }

    fn take(&self, channel: &str) -> Option<PendingContinuation> {
        self.map.lock().unwrap().remove(channel)
    }

    pub fn has_pending(&self, channel: &str) -> bool {
        self.map.lock().unwrap().contains_key(channel)
    }
}

/// Tokens that resume a saved continuation.
pub fn is_affirmative(text: &str) -> bool {
    let normalized: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    matches!(
        normalized.trim(),
        "yes" | "y"
            | "yep"
            | "yeah"
            | "sure"
            | "ok"
            | "okay"
            | "continue"
            | "proceed"
            | "go ahead"
            | "go on"
            | "do it"
            | "please do"
            | "yes please"
            | "keep going"
            | "resume"
    )
}

#[derive(Debug, Clone)]
pub enum ImageSource {
    Url(String),
    Path(String),
    Base64(String),
}

#[derive(Debug, Clone, Default)]
pub struct PromptRequest {
    pub prompt: String,
    pub channel: String,
    pub user: String,
    pub model: Option<String>,
    pub extra_context: Option<String>,
    pub images: Vec<ImageSource>,
}

#[derive(Debug)]
pub struct PromptOutcome {
    pub final_answer: String,
    pub tool_results: Vec<ToolInvocation>,
    pub loop_count: usize,
    pub aborted: bool,
}

pub struct Orchestrator {
    llm: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    memory: MemoryStore,
    items: Arc<ContextItems>,
    config: Arc<RwLock<Config>>,
    /// Compiled once at startup, before serving.
    condensed_tools: String,
    /// Detected at startup via model introspection.
    detected_context_window: Option<u64>,
    known_channels: Arc<RwLock<Vec<String>>>,
    working_dir: String,
    pub aborts: Arc<AbortRegistry>,
    pub continuations: Continuations,
    /// One chain at a time per channel; a later prompt waits, it never
    /// cancels the chain in flight.
    chain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    http: reqwest::Client,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        memory: MemoryStore,
        items: Arc<ContextItems>,
        config: Arc<RwLock<Config>>,
        condensed_tools: String,
        detected_context_window: Option<u64>,
        known_channels: Arc<RwLock<Vec<String>>>,
        working_dir: String,
    ) -> Self {
        Self {
            llm,
            registry,
            memory,
            items,
            config,
            condensed_tools,
            detected_context_window,
            known_channels,
            working_dir,
            aborts: Arc::new(AbortRegistry::default()),
            continuations: Continuations::default(),
            chain_locks: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn default_user(&self) -> String {
        self.config.read().unwrap().discord.default_user.clone()
    }

    fn chain_lock(&self, channel: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.chain_locks
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Drive one prompt chain to completion. Strictly sequential within the
    /// chain: LLM turn, parse, tools in emission order, next turn.
    pub async fn run_prompt(
        &self,
        request: PromptRequest,
        status: &dyn StatusSink,
    ) -> anyhow::Result<PromptOutcome> {
        let channel = request.channel.clone();
        let lock = self.chain_lock(&channel);
        let _chain_guard = lock.lock().await;

        // A saved continuation is resumed by an affirmative reply and
        // silently discarded by anything else.
        let saved = self.continuations.take(&channel);
        let (prompt, mut tool_results, mut loop_count, resumed) = match saved {
            Some(pending) if is_affirmative(&request.prompt) => {
                info!(
                    "Resuming saved continuation on channel '{}' at step {}",
                    channel, pending.loop_count
                );
                (
                    pending.resume_prompt,
                    pending.tool_results,
                    pending.loop_count,
                    true,
                )
            }
            _ => (request.prompt.clone(), Vec::new(), 0, false),
        };
        let original_prompt = if resumed {
            prompt.clone()
        } else {
            request.prompt.clone()
        };

        status.status("💭 Thinking...").await;

        let (model, loop_limit, categories, config_window, enforce_budget) = {
            let config = self.config.read().unwrap();
            (
                request
                    .model
                    .clone()
                    .unwrap_or_else(|| config.ollama.model.clone()),
                config.prompt.loop_limit,
                config.memory.context_categories.clone(),
                config.ollama.context_window,
                config.prompt.enforce_budget,
            )
        };

        // Images load once per chain and attach to the first turn only.
        let mut images = self.load_images(&request.images).await;
        images.extend(self.items.load_images());

        let known_channels = self.known_channels.read().unwrap().clone();
        let inputs = context::ContextInputs {
            user: &request.user,
            channel: Some(channel.as_str()),
            condensed_tools: &self.condensed_tools,
            known_channels: &known_channels,
            categories: &categories,
            working_dir: &self.working_dir,
        };
        let assembled_context = context::assemble_context(&inputs, &self.memory, &self.items)?;
        let user_message = context::build_user_message(&prompt, request.extra_context.as_deref());

        let mut iterations = 0usize;
        let mut parse_failures = 0u32;

        loop {
            if self.aborts.consume(&channel) {
                info!("Prompt chain on '{}' aborted before turn", channel);
                return Ok(PromptOutcome {
                    final_answer: String::new(),
                    tool_results,
                    loop_count,
                    aborted: true,
                });
            }

            if iterations >= loop_limit {
                let resume_prompt = format!(
                    "{original_prompt}\n\n(Earlier steps were cut off by the step limit. \
                     Continue from where the tool results leave off.)"
                );
                self.continuations.save(
                    &channel,
                    PendingContinuation {
                        tool_results: tool_results.clone(),
                        resume_prompt,
                        original_prompt: original_prompt.clone(),
                        loop_count,
                    },
                );
                let answer = format!(
                    "I've hit my step limit ({loop_limit} steps) and there's still work to do. \
                     Would you like me to continue?"
                );
                status.status("✅ Done").await;
                self.aborts.consume(&channel);
                return Ok(PromptOutcome {
                    final_answer: answer,
                    tool_results,
                    loop_count,
                    aborted: false,
                });
            }
            iterations += 1;
            loop_count += 1;

            if loop_count > 1 {
                status
                    .status(&format!("⚙️ Processing step {loop_count}..."))
                    .await;
            }

            let turn_message = build_turn_message(&user_message, &tool_results)?;

            // Observational accounting: chars/4 against the effective window.
            let estimated = context::estimate_tokens(&assembled_context)
                + context::estimate_tokens(&turn_message);
            let window = config_window
                .or(self.detected_context_window)
                .unwrap_or(1_000_000);
            let utilization = estimated.saturating_mul(100) / window.max(1);
            info!(
                "Step {loop_count}: ~{estimated} tokens of {window} context window \
                 ({utilization}% utilization)"
            );
            if enforce_budget && estimated >= window {
                warn!("Estimated tokens exceed the context window; output may be degraded");
            }

            let chat_request = ChatRequest {
                model: model.clone(),
                context: assembled_context.clone(),
                prompt: turn_message,
                images: std::mem::take(&mut images),
            };
            let response_text = self
                .llm
                .chat(chat_request, &ChunkForward(status))
                .await
                .map_err(|e| anyhow::anyhow!("Ollama request failed: {e}"))?;

            if self.aborts.consume(&channel) {
                info!("Prompt chain on '{}' aborted after LLM turn", channel);
                return Ok(PromptOutcome {
                    final_answer: String::new(),
                    tool_results,
                    loop_count,
                    aborted: true,
                });
            }

            let parsed = parser::parse_response(&response_text);

            let Some(mut envelope) = parsed.envelope else {
                if !parsed.had_json {
                    parse_failures += 1;
                    if parse_failures >= 2 {
                        anyhow::bail!(
                            "LLM response contained no extractable JSON after {} attempts",
                            parse_failures
                        );
                    }
                }
                tool_results.push(system_note(
                    "Your last response was not a valid control envelope. Respond with \
                     exactly one JSON object: {\"reasoning\", \"actions\", \
                     \"final_answer\", \"continue\"}.",
                    true,
                ));
                continue;
            };
            parse_failures = 0;

            if parsed.repaired {
                // The model gets told; repair must not become load-bearing.
                tool_results.push(system_note(
                    "Your last response needed JSON repair before it parsed. \
                     Emit clean JSON with no surrounding text.",
                    false,
                ));
            }

            parser::inject_blocks(&mut envelope.actions, &parsed.blocks);

            let mut any_failure = false;
            for action in &envelope.actions {
                if self.aborts.consume(&channel) {
                    info!("Prompt chain on '{}' aborted before tool", channel);
                    return Ok(PromptOutcome {
                        final_answer: String::new(),
                        tool_results,
                        loop_count,
                        aborted: true,
                    });
                }
                status.status(&format!("🔧 Running {}...", action.tool)).await;

                let result = self.registry.dispatch(&action.tool, &action.arguments).await;
                if is_failure(&result) {
                    any_failure = true;
                }
                tool_results.push(ToolInvocation {
                    tool: action.tool.clone(),
                    arguments: action.arguments.clone(),
                    result,
                });
            }

            let mut continue_ = envelope.continue_;
            if any_failure && !continue_ {
                // The model must see the failure before it can settle.
                info!("Tool failure forces another turn");
                continue_ = true;
            }

            if !continue_
                && (!envelope.final_answer.trim().is_empty() || envelope.actions.is_empty())
            {
                let answer = self
                    .finalize_answer(&model, &original_prompt, &envelope, &tool_results)
                    .await;
                status.status("✅ Done").await;
                self.aborts.consume(&channel);
                return Ok(PromptOutcome {
                    final_answer: answer,
                    tool_results,
                    loop_count,
                    aborted: false,
                });
            }
        }
    }

    async fn finalize_answer(
        &self,
        model: &str,
        original_prompt: &str,
        envelope: &Envelope,
        tool_results: &[ToolInvocation],
    ) -> String {
        let answer = envelope.final_answer.trim();
        if !answer.is_empty() {
            return answer.to_string();
        }
        let ran_tools = tool_results.iter().any(|t| t.tool != "_system");
        if !ran_tools {
            return String::new();
        }

        let digest = tool_results
            .iter()
            .map(|t| format!("- {}: {}", t.tool, t.result))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "The user asked: {original_prompt}\n\nWork performed:\n{digest}\n\n\
             Write one short, friendly message telling the user what was done."
        );

        match tokio::time::timeout(FALLBACK_SUMMARY_TIMEOUT, self.llm.completion(model, &prompt))
            .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) | Ok(Err(_)) => FALLBACK_APOLOGY.to_string(),
            Err(_) => {
                error!("Fallback summary timed out");
                FALLBACK_APOLOGY.to_string()
            }
        }
    }

    async fn load_images(&self, sources: &[ImageSource]) -> Vec<String> {
        let mut images = Vec::new();
        for source in sources {
            match source {
                ImageSource::Base64(data) => images.push(data.clone()),
                ImageSource::Path(path) => match std::fs::read(path) {
                    Ok(bytes) => {
                        images.push(base64::engine::general_purpose::STANDARD.encode(bytes))
                    }
                    Err(e) => warn!("Could not read image {}: {}", path, e),
                },
                ImageSource::Url(url) => {
                    match self.http.get(url).send().await.and_then(|r| r.error_for_status()) {
                        Ok(response) => match response.bytes().await {
                            Ok(bytes) => images
                                .push(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                            Err(e) => warn!("Could not download image {}: {}", url, e),
                        },
                        Err(e) => warn!("Could not download image {}: {}", url, e),
                    }
                }
            }
        }
        images
    }
}

fn system_note(message: &str, is_error: bool) -> ToolInvocation {
    let result = if is_error {
        json!({ "success": false, "error": message })
    } else {
        json!({ "success": true, "warning": message })
    };
    ToolInvocation {
        tool: "_system".to_string(),
        arguments: json!({}),
        result,
    }
}

/// The per-turn user message: the original request plus every tool result so
/// far, in execution order.
fn build_turn_message(
    user_message: &str,
    tool_results: &[ToolInvocation],
) -> anyhow::Result<String> {
    if tool_results.is_empty() {
        return Ok(user_message.to_string());
    }
    let serialized = serde_json::to_string_pretty(tool_results)?;
    Ok(format!(
        "{user_message}\n\n# Tool results so far\n{serialized}\n\n\
         Continue with the next JSON envelope."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::llm::{LlmError, ModelInfo};
    use crate::tools::builtin::fs::{FilePatchTool, FileReadTool, FileWriteTool};
    use crate::tools::{tool_ok, Tool};
    use std::collections::VecDeque;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<String>>,
        calls: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            request: ChatRequest,
            _sink: &dyn ChunkSink,
        ) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))
        }

        async fn introspect(&self, model: &str) -> Result<ModelInfo, LlmError> {
            Ok(ModelInfo {
                name: model.to_string(),
                param_size: "test".into(),
                quantization: "test".into(),
                context_length: Some(4096),
            })
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
            Ok(Vec::new())
        }
    }

    fn test_config() -> Config {
        serde_json::from_str(
            r#"{ "discord": { "token": "t" }, "ollama": { "model": "test-model" } }"#,
        )
        .unwrap()
    }

    struct Fixture {
        orchestrator: Orchestrator,
        backend: Arc<ScriptedBackend>,
        _dir: tempfile::TempDir,
    }

    fn fixture(responses: Vec<&str>, loop_limit: usize) -> Fixture {
        fixture_with(responses, loop_limit, |_| {})
    }

    fn fixture_with(
        responses: Vec<&str>,
        loop_limit: usize,
        customize: impl FnOnce(&mut ToolRegistry),
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(responses));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FileReadTool));
        registry.register(Arc::new(FileWriteTool));
        registry.register(Arc::new(FilePatchTool));
        customize(&mut registry);

        let mut config = test_config();
        config.prompt.loop_limit = loop_limit;

        let memory = MemoryStore::new(Database::open_in_memory().unwrap()).unwrap();
        let items =
            Arc::new(ContextItems::load(dir.path().join("context.json")).unwrap());

        let orchestrator = Orchestrator::new(
            backend.clone(),
            Arc::new(registry),
            memory,
            items,
            Arc::new(RwLock::new(config)),
            "tools".to_string(),
            Some(4096),
            Arc::new(RwLock::new(Vec::new())),
            dir.path().to_str().unwrap().to_string(),
        );

        Fixture {
            orchestrator,
            backend,
            _dir: dir,
        }
    }

    fn request(prompt: &str) -> PromptRequest {
        PromptRequest {
            prompt: prompt.to_string(),
            channel: "general".to_string(),
            user: "alice".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_simple_question() {
        let fx = fixture(
            vec![r#"{"reasoning": "easy", "actions": [], "final_answer": "4", "continue": false}"#],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("What is 2+2?"), &NoopStatus)
            .await
            .unwrap();

        assert_eq!(outcome.final_answer, "4");
        assert_eq!(outcome.loop_count, 1);
        assert!(outcome.tool_results.is_empty());
        assert!(!outcome.aborted);
        assert_eq!(fx.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_single_tool_chain() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "hi").unwrap();

        let turn1 = format!(
            r#"{{"reasoning": "read it", "actions": [{{"type": "tool_call", "tool": "FileReadTool", "arguments": {{"filepath": "{}"}}, "reasoning": ""}}], "final_answer": "", "continue": true}}"#,
            file.display()
        );
        let fx = fixture(
            vec![
                &turn1,
                r#"{"reasoning": "", "actions": [], "final_answer": "hi", "continue": false}"#,
            ],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("Read the file"), &NoopStatus)
            .await
            .unwrap();

        assert_eq!(outcome.final_answer, "hi");
        assert_eq!(outcome.loop_count, 2);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].tool, "FileReadTool");
        assert_eq!(outcome.tool_results[0].result["content"], json!("hi"));
    }

    #[tokio::test]
    async fn test_out_of_band_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x.py");

        let turn1 = format!(
            "{{\"reasoning\": \"\", \"actions\": [{{\"type\": \"tool_call\", \"tool\": \"FileWriteTool\", \"arguments\": {{\"filepath\": \"{path}\"}}, \"reasoning\": \"\"}}], \"final_answer\": \"\", \"continue\": true}}\n===SKIPPY_FILE_START:{path}===\ndef f():\n  return 1\n===SKIPPY_FILE_END===",
            path = target.display()
        );
        let fx = fixture(
            vec![
                &turn1,
                r#"{"reasoning": "", "actions": [], "final_answer": "written", "continue": false}"#,
            ],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("Write the function"), &NoopStatus)
            .await
            .unwrap();

        assert_eq!(outcome.final_answer, "written");
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written, "def f():\n  return 1\n");
    }

    #[tokio::test]
    async fn test_patch_failure_forces_continue() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("code.txt");
        std::fs::write(&file, "alpha beta gamma").unwrap();

        // continue=false with a non-empty answer would normally terminate;
        // the failed tool must force another turn anyway.
        let turn1 = format!(
            r#"{{"reasoning": "", "actions": [{{"type": "tool_call", "tool": "PatchFile", "arguments": {{"filepath": "{path}", "changes": [{{"find": "missing text", "replace": "x"}}]}}, "reasoning": ""}}], "final_answer": "premature", "continue": false}}"#,
            path = file.display()
        );
        let turn2 = format!(
            r#"{{"reasoning": "retry", "actions": [{{"type": "tool_call", "tool": "PatchFile", "arguments": {{"filepath": "{path}", "changes": [{{"find": "beta", "replace": "delta"}}]}}, "reasoning": ""}}], "final_answer": "", "continue": true}}"#,
            path = file.display()
        );
        let fx = fixture(
            vec![
                &turn1,
                &turn2,
                r#"{"reasoning": "", "actions": [], "final_answer": "patched", "continue": false}"#,
            ],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("Patch the file"), &NoopStatus)
            .await
            .unwrap();

        // Failure on turn 1 must force a second LLM turn despite continue=false.
        assert_eq!(outcome.loop_count, 3);
        assert_eq!(outcome.final_answer, "patched");
        assert!(is_failure(&outcome.tool_results[0].result));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "alpha delta gamma");
    }

    #[tokio::test]
    async fn test_loop_limit_saves_continuation_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "data").unwrap();

        let work_turn = format!(
            r#"{{"reasoning": "", "actions": [{{"type": "tool_call", "tool": "file_read", "arguments": {{"filepath": "{path}"}}, "reasoning": ""}}], "final_answer": "", "continue": true}}"#,
            path = file.display()
        );
        let fx = fixture(
            vec![
                &work_turn,
                &work_turn,
                // Only reachable after the continuation resumes.
                r#"{"reasoning": "", "actions": [], "final_answer": "all done", "continue": false}"#,
            ],
            2,
        );

        let outcome = fx
            .orchestrator
            .run_prompt(request("Do a long job"), &NoopStatus)
            .await
            .unwrap();
        assert!(outcome
            .final_answer
            .contains("I've hit my step limit (2 steps)"));
        assert_eq!(outcome.loop_count, 2);
        assert!(fx.orchestrator.continuations.has_pending("general"));

        let resumed = fx
            .orchestrator
            .run_prompt(request("yes"), &NoopStatus)
            .await
            .unwrap();
        assert_eq!(resumed.final_answer, "all done");
        // Saved tool results ride along into the resumed chain.
        assert_eq!(resumed.tool_results.len(), 2);
        assert_eq!(resumed.loop_count, 3);
        assert!(!fx.orchestrator.continuations.has_pending("general"));
    }

    #[tokio::test]
    async fn test_non_affirmative_discards_continuation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "data").unwrap();

        let work_turn = format!(
            r#"{{"reasoning": "", "actions": [{{"type": "tool_call", "tool": "file_read", "arguments": {{"filepath": "{path}"}}, "reasoning": ""}}], "final_answer": "", "continue": true}}"#,
            path = file.display()
        );
        let fx = fixture(
            vec![
                &work_turn,
                r#"{"reasoning": "", "actions": [], "final_answer": "fresh", "continue": false}"#,
            ],
            1,
        );

        let first = fx
            .orchestrator
            .run_prompt(request("Long job"), &NoopStatus)
            .await
            .unwrap();
        assert!(first.final_answer.contains("step limit"));

        let second = fx
            .orchestrator
            .run_prompt(request("What's the weather?"), &NoopStatus)
            .await
            .unwrap();
        assert_eq!(second.final_answer, "fresh");
        // Discarded, not resumed: fresh run starts with empty results.
        assert!(second.tool_results.is_empty());
        assert!(!fx.orchestrator.continuations.has_pending("general"));
    }

    /// Tool that flips the channel's abort flag while it runs, simulating a
    /// user /stop landing mid-execution.
    struct AbortingTool {
        aborts: Arc<AbortRegistry>,
    }

    #[async_trait]
    impl Tool for AbortingTool {
        fn name(&self) -> &str {
            "slow_job"
        }

        fn capability(&self) -> String {
            "slow_job() -> {success}".to_string()
        }

        async fn run(&self, _args: Value) -> anyhow::Result<Value> {
            self.aborts.request("general");
            Ok(tool_ok(json!({"done": true})))
        }
    }

    #[tokio::test]
    async fn test_abort_stops_before_next_tool() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "data").unwrap();

        // Two actions in one turn: the first sets the abort flag while
        // "executing"; the second must never run.
        let turn = format!(
            r#"{{"reasoning": "", "actions": [{{"type": "tool_call", "tool": "slow_job", "arguments": {{}}, "reasoning": ""}}, {{"type": "tool_call", "tool": "file_read", "arguments": {{"filepath": "{path}"}}, "reasoning": ""}}], "final_answer": "", "continue": true}}"#,
            path = file.display()
        );

        // The tool needs the same abort registry the loop polls; swap the
        // orchestrator's registry in after construction.
        let shared_aborts = Arc::new(AbortRegistry::default());
        let mut fx = fixture_with(vec![&turn], 10, |registry| {
            registry.register(Arc::new(AbortingTool {
                aborts: shared_aborts.clone(),
            }));
        });
        fx.orchestrator.aborts = shared_aborts.clone();

        let outcome = fx
            .orchestrator
            .run_prompt(request("Run two things"), &NoopStatus)
            .await
            .unwrap();

        assert!(outcome.aborted);
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].tool, "slow_job");
    }

    #[tokio::test]
    async fn test_abort_before_start() {
        let fx = fixture(vec![], 10);
        fx.orchestrator.aborts.request("general");
        let outcome = fx
            .orchestrator
            .run_prompt(request("anything"), &NoopStatus)
            .await
            .unwrap();
        assert!(outcome.aborted);
        assert_eq!(fx.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_envelope_retried_via_system_note() {
        let fx = fixture(
            vec![
                r#"{"mood": "confused"}"#,
                r#"{"reasoning": "", "actions": [], "final_answer": "recovered", "continue": false}"#,
            ],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("hello"), &NoopStatus)
            .await
            .unwrap();

        assert_eq!(outcome.final_answer, "recovered");
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].tool, "_system");
        assert!(is_failure(&outcome.tool_results[0].result));
    }

    #[tokio::test]
    async fn test_unparseable_twice_errors() {
        let fx = fixture(vec!["no json here at all", "still just prose"], 10);
        let err = fx
            .orchestrator
            .run_prompt(request("hello"), &NoopStatus)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no extractable JSON"));
    }

    #[tokio::test]
    async fn test_repaired_response_surfaces_warning() {
        let fx = fixture(
            vec![r#"```json
{"reasoning": "", "actions": [], "final_answer": "ok", "continue": false}
```"#],
            10,
        );
        let outcome = fx
            .orchestrator
            .run_prompt(request("hello"), &NoopStatus)
            .await
            .unwrap();
        assert_eq!(outcome.final_answer, "ok");
        assert_eq!(outcome.tool_results.len(), 1);
        assert_eq!(outcome.tool_results[0].tool, "_system");
        assert!(!is_failure(&outcome.tool_results[0].result));
    }

    #[test]
    fn test_is_affirmative() {
        for yes in ["yes", "Yes!", " yep ", "go ahead", "OK", "please do", "continue"] {
            assert!(is_affirmative(yes), "{yes:?} should be affirmative");
        }
        for no in ["no", "stop", "what's the weather?", "yesterday was fine"] {
            assert!(!is_affirmative(no), "{no:?} should not be affirmative");
        }
    }

    #[test]
    fn test_turn_message_includes_results() {
        let results = vec![ToolInvocation {
            tool: "bash".into(),
            arguments: json!({"command": "ls"}),
            result: json!({"success": true, "stdout": "a.txt"}),
        }];
        let message = build_turn_message("do it", &results).unwrap();
        assert!(message.starts_with("do it"));
        assert!(message.contains("Tool results so far"));
        assert!(message.contains("a.txt"));
    }
}
