//! Majordomo server binary.
//!
//! `majordomo start` boots the orchestration core and serves the
//! WebSocket transport; `majordomo check` loads and prints the resolved
//! configuration for diagnosis.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use majordomo::config::Config;
use majordomo::kernel::orchestrator::Orchestrator;
use majordomo::logging;
use majordomo::memory::MemoryStore;
use majordomo::prompts::PromptStore;
use majordomo::providers::openai::OpenAiProvider;
use majordomo::providers::router::ModelRouter;
use majordomo::server::{self, AppState};
use majordomo::session::SessionTaskManager;
use majordomo::tools::email::{ComposeEmailTool, LogMailer};
use majordomo::tools::files::FolderDuplicatesTool;
use majordomo::tools::registry::ToolRegistry;
use majordomo::tools::reply::ReplyTool;
use majordomo::tools::search::{GoogleSearchTool, HttpSearchBackend};

/// Session documents are grouped per user; the server currently runs
/// single-tenant.
const DEFAULT_USER: &str = "default";

#[derive(Parser)]
#[command(name = "majordomo", about = "Personal assistant orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket server.
    Start,
    /// Load the configuration and print the resolved settings.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => start().await,
        Command::Check => {
            logging::init_cli();
            check()
        }
    }
}

async fn start() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _guard = logging::init_server(&config.paths.logs_dir)?;

    let state = build_state(Arc::new(config.clone()))?;
    server::serve(&config.server.bind_addr, state).await
}

fn build_state(config: Arc<Config>) -> Result<Arc<AppState>> {
    let registry = Arc::new(build_registry(&config));

    let provider = Arc::new(OpenAiProvider::new(
        &config.llm.base_url,
        config.llm.api_key.clone(),
    ));
    let router = Arc::new(
        ModelRouter::from_config(&config.models, &config.llm, provider)
            .context("failed to build model router")?,
    );

    let prompts = Arc::new(PromptStore::load(config.paths.prompts_dir.as_deref()));
    let memory = Arc::new(MemoryStore::new(
        config.paths.sessions_dir.clone(),
        DEFAULT_USER,
        config.reasoning_trace.enabled,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        router,
        prompts,
        Arc::clone(&memory),
    ));
    let sessions = Arc::new(SessionTaskManager::new(memory));

    Ok(Arc::new(AppState {
        orchestrator,
        sessions,
    }))
}

fn build_registry(config: &Config) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(ReplyTool::spec(), ReplyTool::factory);

    registry.register(ComposeEmailTool::spec(), || {
        Arc::new(ComposeEmailTool::new(Arc::new(LogMailer::new())))
    });

    let sandbox_roots = config.sandbox.roots.clone();
    registry.register(FolderDuplicatesTool::spec(), move || {
        Arc::new(FolderDuplicatesTool::new(sandbox_roots.clone()))
    });

    let search_endpoint = config.search.endpoint.clone();
    registry.register(GoogleSearchTool::spec(), move || {
        Arc::new(GoogleSearchTool::new(Arc::new(HttpSearchBackend::new(
            &search_endpoint,
        ))))
    });

    registry
}

fn check() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    println!("server.bind_addr        = {}", config.server.bind_addr);
    println!("paths.sessions_dir      = {}", config.paths.sessions_dir.display());
    println!("paths.logs_dir          = {}", config.paths.logs_dir.display());
    println!(
        "paths.prompts_dir       = {}",
        config
            .paths
            .prompts_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in prompts)".to_owned())
    );
    println!("delivery.intent_verbs   = {}", config.delivery.intent_verbs.join(", "));
    println!("delivery.required_tool  = {}", config.delivery.required_tool);
    println!(
        "delivery.reject_missing = {}",
        config.delivery.validation.reject_missing_tool
    );
    println!("planning.repair_rounds  = {}", config.planning.max_repair_rounds);
    println!("planning.replan_rounds  = {}", config.planning.max_replan_rounds);
    println!("executor.retries        = {}", config.executor.per_step_retries);
    println!("executor.deadline_ms    = {}", config.executor.default_deadline_ms);
    println!("reasoning_trace.enabled = {}", config.reasoning_trace.enabled);
    println!("screenshots.base_dir    = {}", config.screenshots.base_dir.display());
    println!("llm.base_url            = {}", config.llm.base_url);
    println!("llm.model               = {}", config.llm.model);
    println!("search.endpoint         = {}", config.search.endpoint);

    if config.sandbox.roots.is_empty() {
        println!("sandbox.roots           = (none: file tools will reject every path)");
    } else {
        for root in &config.sandbox.roots {
            println!("sandbox.roots          += {}", root.display());
        }
    }

    for constraint in &config.models.constraints {
        println!(
            "models.constraint       : /{}/ -> temperature {} ({})",
            constraint.pattern, constraint.temperature, constraint.reason
        );
    }
    for (agent, defaults) in &config.models.agent_defaults {
        println!(
            "models.agent_default    : {agent} -> temperature {}",
            defaults.temperature
        );
    }

    println!("configuration OK");
    Ok(())
}
