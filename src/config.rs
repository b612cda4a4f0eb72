//! Configuration loading and management.
//!
//! Loads configuration from `./majordomo.toml` (or `$MAJORDOMO_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
///
/// Path: `./majordomo.toml` or `$MAJORDOMO_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delivery-intent detection and enforcement (`[delivery]`).
    pub delivery: DeliveryConfig,
    /// Plan repair and replan budgets (`[planning]`).
    pub planning: PlanningConfig,
    /// Per-step retry and deadline settings (`[executor]`).
    pub executor: ExecutorConfig,
    /// File-system sandbox roots (`[sandbox]`).
    pub sandbox: SandboxConfig,
    /// Reasoning-trace feature flag (`[reasoning_trace]`).
    pub reasoning_trace: ReasoningTraceConfig,
    /// Model temperature constraints and per-agent defaults (`[models]`).
    pub models: ModelsConfig,
    /// Screenshot artifact settings (`[screenshots]`).
    pub screenshots: ScreenshotsConfig,
    /// WebSocket server settings (`[server]`).
    pub server: ServerConfig,
    /// Filesystem paths for persistent state (`[paths]`).
    pub paths: PathsConfig,
    /// LLM endpoint settings (`[llm]`).
    pub llm: LlmConfig,
    /// Web-search backend settings (`[search]`).
    pub search: SearchConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MAJORDOMO_CONFIG_PATH` or `./majordomo.toml`.
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from the TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("MAJORDOMO_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("majordomo.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MAJORDOMO_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env("MAJORDOMO_SESSIONS_DIR") {
            self.paths.sessions_dir = PathBuf::from(v);
        }
        if let Some(v) = env("MAJORDOMO_LOGS_DIR") {
            self.paths.logs_dir = PathBuf::from(v);
        }
        if let Some(v) = env("MAJORDOMO_PROMPTS_DIR") {
            self.paths.prompts_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("MAJORDOMO_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("MAJORDOMO_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = env("MAJORDOMO_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env("MAJORDOMO_REASONING_TRACE") {
            match v.parse() {
                Ok(b) => self.reasoning_trace.enabled = b,
                Err(_) => tracing::warn!(
                    var = "MAJORDOMO_REASONING_TRACE",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("MAJORDOMO_PER_STEP_RETRIES") {
            match v.parse() {
                Ok(n) => self.executor.per_step_retries = n,
                Err(_) => tracing::warn!(
                    var = "MAJORDOMO_PER_STEP_RETRIES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Delivery ────────────────────────────────────────────────────

/// Delivery-intent detection settings (`[delivery]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Verbs that trigger delivery-intent enforcement.
    pub intent_verbs: Vec<String>,
    /// Tool the plan must include when delivery intent is detected.
    pub required_tool: String,
    /// Validation behavior for missing delivery tools.
    pub validation: DeliveryValidationConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            intent_verbs: ["email", "send", "mail", "attach"]
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            required_tool: "compose_email".to_owned(),
            validation: DeliveryValidationConfig::default(),
        }
    }
}

/// Delivery validation knobs (`[delivery.validation]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryValidationConfig {
    /// When true the validator rejects plans missing the required tool;
    /// when false it only warns.
    pub reject_missing_tool: bool,
}

impl Default for DeliveryValidationConfig {
    fn default() -> Self {
        Self {
            reject_missing_tool: true,
        }
    }
}

// ── Planning / executor ─────────────────────────────────────────

/// Plan repair and replan budgets (`[planning]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// Maximum validator-driven repair rounds before the request fails.
    pub max_repair_rounds: u32,
    /// Maximum critic-driven replan rounds during execution.
    pub max_replan_rounds: u32,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_repair_rounds: 2,
            max_replan_rounds: 2,
        }
    }
}

/// Per-step retry and deadline settings (`[executor]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retries per step when a tool reports `retry_possible`.
    pub per_step_retries: u32,
    /// Default tool deadline in milliseconds.
    pub default_deadline_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            per_step_retries: 1,
            default_deadline_ms: 30_000,
        }
    }
}

// ── Sandbox / trace / screenshots ───────────────────────────────

/// File-system sandbox roots (`[sandbox]`).
///
/// File operations must resolve within one of these roots; anything
/// outside fails with `OutOfSandbox`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Allowed root directories for file tools.
    pub roots: Vec<PathBuf>,
}

/// Reasoning-trace feature flag (`[reasoning_trace]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReasoningTraceConfig {
    /// When false, trace operations are no-ops.
    pub enabled: bool,
}

/// Screenshot artifact settings (`[screenshots]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenshotsConfig {
    /// Directory screenshots are written beneath.
    pub base_dir: PathBuf,
}

impl Default for ScreenshotsConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("screenshots"),
        }
    }
}

// ── Models ──────────────────────────────────────────────────────

/// Temperature override keyed by model-name pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConstraint {
    /// Regex matched against the model name.
    pub pattern: String,
    /// Temperature forced for matching models.
    pub temperature: f32,
    /// Why the constraint exists (shown in `check` output).
    #[serde(default)]
    pub reason: String,
}

/// Per-agent sampling defaults.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AgentDefaults {
    /// Sampling temperature for this agent role.
    pub temperature: f32,
}

/// Model constraints and per-agent defaults (`[models]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Temperature overrides by model-name pattern, first match wins.
    pub constraints: Vec<ModelConstraint>,
    /// Sampling defaults keyed by agent name (`planner`, `critic`).
    pub agent_defaults: HashMap<String, AgentDefaults>,
}

// ── Server / paths / llm ────────────────────────────────────────

/// WebSocket server settings (`[server]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket server binds to.
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_owned(),
        }
    }
}

/// Filesystem paths for persistent state (`[paths]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory session JSON documents are written beneath.
    pub sessions_dir: PathBuf,
    /// Directory for rotated log files.
    pub logs_dir: PathBuf,
    /// Optional directory of markdown prompt sections overriding the
    /// embedded defaults.
    pub prompts_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = ProjectDirs::from("", "", "majordomo")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            sessions_dir: data_dir.join("sessions"),
            logs_dir: data_dir.join("logs"),
            prompts_dir: None,
        }
    }
}

/// LLM endpoint settings (`[llm]`).
///
/// Any OpenAI-compatible chat-completions endpoint works; the API key is
/// optional for local servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat-completions endpoint.
    pub base_url: String,
    /// Bearer token, if the endpoint requires one.
    pub api_key: Option<String>,
    /// Model name sent with each request.
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_owned(),
            api_key: None,
            model: "gpt-4o".to_owned(),
        }
    }
}

/// Web-search backend settings (`[search]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base URL of the search endpoint the `google_search` tool calls.
    pub endpoint: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8090".to_owned(),
        }
    }
}
