pub mod commands;
pub mod config;
pub mod context_items;
pub mod cron;
pub mod db;
pub mod gateway;
pub mod ipc;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod paths;
pub mod tools;

use std::sync::{Arc, RwLock};

use config::Config;
use context_items::ContextItems;
use cron::CronStore;
use gateway::ChatEgress;
use llm::ChatBackend;
use memory::MemoryStore;
use orchestrator::Orchestrator;
use paths::Paths;
use tools::ToolRegistry;

/// Shared application context, built once at startup and threaded through
/// the gateway, IPC server, and scheduler.
pub struct App {
    pub paths: Paths,
    pub config: Arc<RwLock<Config>>,
    pub llm: Arc<dyn ChatBackend>,
    pub memory: MemoryStore,
    pub cron: CronStore,
    pub registry: Arc<ToolRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub items: Arc<ContextItems>,
    pub egress: Arc<ChatEgress>,
    pub known_channels: Arc<RwLock<Vec<String>>>,
    /// Context window detected at startup via model introspection.
    pub detected_context_window: Option<u64>,
}

impl App {
    /// Config cap wins over the detected window; 1M is the open-ended
    /// default when neither is known.
    pub fn effective_context_window(&self) -> u64 {
        self.config
            .read()
            .unwrap()
            .ollama
            .context_window
            .or(self.detected_context_window)
            .unwrap_or(1_000_000)
    }
}

/// Custom data passed to all commands
pub struct Data {
    pub app: Arc<App>,
    pub bot_id: u64,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
