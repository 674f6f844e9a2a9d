use std::path::Path;

use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// Process-wide configuration, loaded once from `~/.Skippy/Skippy.json`.
///
/// The struct is immutable in spirit; the two runtime-settable fields
/// (`ollama.model`, `prompt.loop_limit`) are mutated through the shared
/// `RwLock<Config>` and written back with [`Config::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub discord: DiscordConfig,
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    #[serde(rename = "guildId", default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<u64>,
    #[serde(rename = "messageHistoryLimit", default = "default_history_limit")]
    pub message_history_limit: usize,
    #[serde(default = "default_user")]
    pub default_user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    /// Total wall-clock budget for one chat request, in seconds.
    #[serde(rename = "timeout", default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Abort the stream if no chunk arrives within this many seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub stream_inactivity_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Explicit context-window cap; overrides whatever introspection detects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_loop_limit")]
    pub loop_limit: usize,
    /// Configuration hook only: when set, 100% utilization logs a warning.
    /// Token accounting never changes loop behavior.
    #[serde(default)]
    pub enforce_budget: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            loop_limit: default_loop_limit(),
            enforce_budget: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Memory categories auto-injected into every prompt, in order.
    #[serde(default = "default_context_categories")]
    pub context_categories: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_categories: default_context_categories(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub bash: BashToolConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub trello: TrelloConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BashToolConfig {
    /// The bash tool is intentionally unsandboxed. Running the daemon as root
    /// refuses to start unless this flag is set.
    #[serde(rename = "unsafe", default)]
    pub unsafe_mode: bool,
    /// Working directory for commands; defaults to the process cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchConfig {
    /// Base URL of a SearXNG instance with the JSON API enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrelloConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_limit() -> usize {
    25
}

fn default_user() -> String {
    "user".to_string()
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_timeout() -> u64 {
    600
}

fn default_inactivity_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_loop_limit() -> usize {
    15
}

fn default_context_categories() -> Vec<String> {
    vec!["general".to_string()]
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if config.discord.token.trim().is_empty() {
            anyhow::bail!("discord.token must be set");
        }
        if config.ollama.model.trim().is_empty() {
            anyhow::bail!("ollama.model must be set");
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> String {
        r#"{
            "discord": { "token": "t", "guildId": 42 },
            "ollama": { "model": "llama3.2" }
        }"#
        .to_string()
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str(&minimal_json()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.discord.message_history_limit, 25);
        assert_eq!(config.ollama.host, "http://localhost:11434");
        assert_eq!(config.ollama.timeout_secs, 600);
        assert_eq!(config.ollama.stream_inactivity_timeout, 120);
        assert_eq!(config.ollama.max_retries, 3);
        assert_eq!(config.ollama.context_window, None);
        assert_eq!(config.prompt.loop_limit, 15);
        assert!(!config.prompt.enforce_budget);
        assert_eq!(config.memory.context_categories, vec!["general"]);
        assert!(!config.tools.bash.unsafe_mode);
    }

    #[test]
    fn test_camel_case_keys() {
        let config: Config = serde_json::from_str(
            r#"{
                "discord": { "token": "t", "messageHistoryLimit": 50 },
                "ollama": { "model": "m", "apiKey": "k", "timeout": 30 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.discord.message_history_limit, 50);
        assert_eq!(config.ollama.api_key.as_deref(), Some("k"));
        assert_eq!(config.ollama.timeout_secs, 30);
    }

    #[test]
    fn test_round_trip_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Skippy.json");
        std::fs::write(&path, minimal_json()).unwrap();

        let first = Config::load(&path).unwrap();
        first.save(&path).unwrap();
        let second = Config::load(&path).unwrap();
        second.save(&path).unwrap();
        let third = Config::load(&path).unwrap();

        assert_eq!(
            serde_json::to_value(&second).unwrap(),
            serde_json::to_value(&third).unwrap()
        );
        assert_eq!(first.prompt.loop_limit, third.prompt.loop_limit);
        assert_eq!(first.discord.guild_id, third.discord.guild_id);
    }

    #[test]
    fn test_missing_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Skippy.json");
        std::fs::write(
            &path,
            r#"{ "discord": { "token": "" }, "ollama": { "model": "m" } }"#,
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.json")).is_err());
    }
}
