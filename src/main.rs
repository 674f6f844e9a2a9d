use std::sync::{Arc, RwLock};

use anyhow::Context as AnyhowContext;
use tracing::{info, warn};

use skippy::config::Config;
use skippy::context_items::ContextItems;
use skippy::cron::{CronStore, Scheduler};
use skippy::db::Database;
use skippy::gateway::ChatEgress;
use skippy::llm::{ChatBackend, OllamaClient};
use skippy::memory::MemoryStore;
use skippy::orchestrator::Orchestrator;
use skippy::paths::Paths;
use skippy::tools::{builtin, compile_condensed_context, ToolRegistry};
use skippy::{gateway, ipc, logging, App};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Startup preconditions fail fast with exit code 1.
    let paths = Paths::resolve()?;
    let config = Config::load(&paths.config_file())?;
    logging::init(&config.log_level, &paths.log_file())?;
    info!("Starting Skippy...");

    // The bash tool is unsandboxed; running it as root needs an explicit
    // opt-in.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 && !config.tools.bash.unsafe_mode {
        anyhow::bail!(
            "Refusing to start as root without tools.bash.unsafe = true in the config"
        );
    }

    paths.ensure_memory_dir()?;
    let memory = MemoryStore::new(Database::open(&paths.memory_db())?)
        .context("Failed to open memory store")?;
    let cron_store =
        CronStore::new(Database::open(&paths.cron_db())?).context("Failed to open cron store")?;
    info!("Stores opened under {}", paths.root().display());

    let llm: Arc<dyn ChatBackend> = Arc::new(OllamaClient::new(&config.ollama));
    let egress = Arc::new(ChatEgress::new());

    let working_dir = std::env::current_dir()
        .map(|d| d.to_string_lossy().to_string())
        .unwrap_or_else(|_| ".".to_string());

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(builtin::bash::BashTool::new(
        config.tools.bash.working_dir.clone(),
    )));
    registry.register(Arc::new(builtin::fs::FileReadTool));
    registry.register(Arc::new(builtin::fs::FileWriteTool));
    registry.register(Arc::new(builtin::fs::FilePatchTool));
    registry.register(Arc::new(builtin::fs::FileListTool));
    registry.register(Arc::new(builtin::http::HttpTool::new()));
    registry.register(Arc::new(builtin::pdf::PdfTool));
    registry.register(Arc::new(builtin::web_search::WebSearchTool::new(
        &config.tools.web_search,
    )));
    registry.register(Arc::new(builtin::weather::WeatherTool::new()));
    registry.register(Arc::new(builtin::file_download::FileDownloadTool::new()));
    registry.register(Arc::new(builtin::trello::TrelloTool::new(
        &config.tools.trello,
    )));
    registry.register(Arc::new(builtin::memory::MemoryTool::new(memory.clone())));
    registry.register(Arc::new(builtin::cron::CronTool::new(cron_store.clone())));
    registry.register(Arc::new(builtin::discord_send::DiscordSendTool::new(
        egress.clone(),
    )));
    let registry = Arc::new(registry);
    registry.init_all().await?;
    info!("{} tools registered", registry.list().len());

    // Once per process: condense the capability documents for injection.
    let condensed_tools =
        compile_condensed_context(&registry, llm.as_ref(), &config.ollama.model).await;
    info!(
        "Condensed tool context compiled ({} chars)",
        condensed_tools.len()
    );

    let detected_context_window = match llm.introspect(&config.ollama.model).await {
        Ok(model_info) => {
            info!(
                "Model {}: {} {} context_length={:?}",
                model_info.name,
                model_info.param_size,
                model_info.quantization,
                model_info.context_length
            );
            model_info.context_length
        }
        Err(e) => {
            warn!("Model introspection failed ({e}); context window unknown");
            None
        }
    };

    let items = Arc::new(ContextItems::load(paths.context_file())?);
    info!("{} persistent context items loaded", items.list().len());

    let config = Arc::new(RwLock::new(config));
    let known_channels = Arc::new(RwLock::new(Vec::new()));

    let orchestrator = Arc::new(Orchestrator::new(
        llm.clone(),
        registry.clone(),
        memory.clone(),
        items.clone(),
        config.clone(),
        condensed_tools,
        detected_context_window,
        known_channels.clone(),
        working_dir,
    ));

    let app = Arc::new(App {
        paths: paths.clone(),
        config,
        llm,
        memory,
        cron: cron_store.clone(),
        registry,
        orchestrator: orchestrator.clone(),
        items,
        egress,
        known_channels,
        detected_context_window,
    });

    let socket_path = paths.socket_file();
    let ipc_handle = tokio::spawn({
        let app = app.clone();
        let socket_path = socket_path.clone();
        async move {
            if let Err(e) = ipc::run(app, socket_path).await {
                tracing::error!("IPC server failed: {e:#}");
            }
        }
    });

    let scheduler = Scheduler::new(cron_store, orchestrator);
    let cron_handle = tokio::spawn(scheduler.run());

    // The gateway owns the foreground; ctrl_c shuts its shards down and
    // start() returns, after which the background services are stopped.
    let result = gateway::run(app).await;

    ipc_handle.abort();
    cron_handle.abort();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    info!("Skippy stopped.");
    result
}
