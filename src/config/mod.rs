use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::review::persona::Persona;

const DEFAULT_PORT: u16 = 4600;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const DEFAULT_MODEL_BASE_URL: &str = "https://api.anthropic.com";

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── JobsConfig ───────────────────────────────────────────────────────────────

/// Job retry/ordering tunables (`[jobs]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Maximum attempts before a retryable job becomes terminal (default: 5).
    pub max_attempts: u32,
    /// Initial retry backoff in milliseconds (doubles per attempt).
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub backoff_max_ms: u64,
    /// How long a review job waits for its index dependency before proceeding
    /// with the most recent available index (seconds). A tunable, not a
    /// contract.
    pub review_hold_secs: i64,
    /// How long terminal jobs are kept for audit before the reaper deletes
    /// them (days).
    pub audit_window_days: i64,
    /// Idle worker poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            review_hold_secs: 300,
            audit_window_days: 7,
            poll_interval_ms: 500,
        }
    }
}

// ─── ProviderConfig ───────────────────────────────────────────────────────────

/// Hosting-provider application credentials (`[provider]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider REST API base URL.
    pub api_base_url: String,
    /// Application id assigned by the provider on app registration.
    pub app_id: String,
    /// Application private key material (REVIEWD_APP_PRIVATE_KEY overrides).
    pub private_key: String,
    /// Shared secret used to verify inbound webhook signatures
    /// (REVIEWD_WEBHOOK_SECRET overrides).
    pub webhook_secret: String,
    /// Per-call timeout for provider API requests (seconds).
    pub timeout_secs: u64,
    /// Minutes before expiry at which a cached installation token is
    /// refreshed instead of served.
    pub token_refresh_margin_mins: i64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            app_id: String::new(),
            private_key: String::new(),
            webhook_secret: String::new(),
            timeout_secs: 30,
            token_refresh_margin_mins: 5,
        }
    }
}

// ─── ModelConfig ──────────────────────────────────────────────────────────────

/// Reasoning-model endpoint configuration (`[model]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model API base URL.
    pub base_url: String,
    /// API key for the model endpoint (REVIEWD_MODEL_API_KEY overrides).
    pub api_key: String,
    /// Model identifier sent with each invocation.
    pub model: String,
    /// Per-call timeout for model invocations (seconds). Reviews of large
    /// diffs routinely take longer than plain API calls.
    pub timeout_secs: u64,
    /// Upper bound on assembled review context, in bytes.
    pub max_context_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-6".to_string(),
            timeout_secs: 120,
            max_context_bytes: 96 * 1024,
        }
    }
}

// ─── ObservabilityConfig ──────────────────────────────────────────────────────

/// Observability configuration (`[observability]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log SQLite queries that exceed this threshold (milliseconds). Default: 100.
    /// Set to 0 to disable slow query logging.
    pub slow_query_threshold_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 100,
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Webhook HTTP server port (default: 4600).
    port: Option<u16>,
    /// Bind address for the webhook server (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,reviewd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// Worker pool size (default: 4).
    pool_size: Option<usize>,
    /// Job retry/ordering tunables (`[jobs]`).
    jobs: Option<JobsConfig>,
    /// Provider credentials and timeouts (`[provider]`).
    provider: Option<ProviderConfig>,
    /// Reasoning model endpoint (`[model]`).
    model: Option<ModelConfig>,
    /// Observability configuration (`[observability]`).
    observability: Option<ObservabilityConfig>,
    /// Reviewer personas (`[persona.<name>]`). A `default` persona is always
    /// present; unmapped repositories fall back to it.
    persona: Option<HashMap<String, Persona>>,
    /// Repository full name → persona name (`[repo_personas]`).
    repo_personas: Option<HashMap<String, String>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── ReviewdConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReviewdConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// Log output format: "pretty" (default) | "json".
    pub log_format: String,
    /// Number of worker tasks pulling jobs from the orchestrator.
    pub pool_size: usize,
    pub jobs: JobsConfig,
    pub provider: ProviderConfig,
    pub model: ModelConfig,
    pub observability: ObservabilityConfig,
    /// Validated persona table. Always contains `default`.
    pub personas: HashMap<String, Persona>,
    /// Repository full name → persona name.
    pub repo_personas: HashMap<String, String>,
}

impl ReviewdConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        pool_size: Option<usize>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let bind_address = std::env::var("REVIEWD_BIND")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let log_format = std::env::var("REVIEWD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());
        let pool_size = pool_size.or(toml.pool_size).unwrap_or(DEFAULT_POOL_SIZE);

        let mut provider = toml.provider.unwrap_or_default();
        // Secrets prefer the environment so they stay out of config files.
        if let Ok(secret) = std::env::var("REVIEWD_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                provider.webhook_secret = secret;
            }
        }
        if let Ok(key) = std::env::var("REVIEWD_APP_PRIVATE_KEY") {
            if !key.is_empty() {
                provider.private_key = key;
            }
        }
        let mut model = toml.model.unwrap_or_default();
        if let Ok(key) = std::env::var("REVIEWD_MODEL_API_KEY") {
            if !key.is_empty() {
                model.api_key = key;
            }
        }

        let mut personas = toml.persona.unwrap_or_default();
        // Validate at the boundary; an invalid persona never reaches the core.
        personas.retain(|name, p| match p.validate() {
            Ok(()) => true,
            Err(e) => {
                error!(persona = %name, err = %e, "invalid persona config — dropped");
                false
            }
        });
        for (name, p) in personas.iter_mut() {
            p.name = name.clone();
        }
        personas
            .entry("default".to_string())
            .or_insert_with(Persona::default);

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            pool_size,
            jobs: toml.jobs.unwrap_or_default(),
            provider,
            model,
            observability: toml.observability.unwrap_or_default(),
            personas,
            repo_personas: toml.repo_personas.unwrap_or_default(),
        }
    }

    /// Resolve the persona for a repository full name, falling back to
    /// `default`.
    pub fn persona_for(&self, repo_full_name: &str) -> Persona {
        self.repo_personas
            .get(repo_full_name)
            .and_then(|name| self.personas.get(name))
            .or_else(|| self.personas.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

fn default_data_dir() -> PathBuf {
    // $XDG_DATA_HOME/reviewd or ~/.local/share/reviewd
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("reviewd");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("reviewd");
    }
    PathBuf::from(".reviewd")
}
