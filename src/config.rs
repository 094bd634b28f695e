//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::budget::BudgetLimits;
use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Staged retry harness settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-attempt execution budget
    #[serde(default)]
    pub budget: BudgetLimits,

    /// Evidence gate ceilings
    #[serde(default)]
    pub gate: GateConfig,

    /// Turn loop bounds
    #[serde(default)]
    pub turn: TurnConfig,

    /// Artifact store settings
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Session persistence settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Hook commands
    #[serde(default)]
    pub hooks: HooksConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .popper/config.toml in current directory
            let local = PathBuf::from(".popper/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.popper/config.toml
            dirs::home_dir().map(|h| h.join(".popper/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.attempt_timeout > self.retry.turn_timeout {
            return Err(Error::Config(
                "retry.attempt_timeout must not exceed retry.turn_timeout".to_string(),
            ));
        }
        if self.gate.soft_ceiling > self.gate.hard_ceiling {
            return Err(Error::Config(
                "gate.soft_ceiling must not exceed gate.hard_ceiling".to_string(),
            ));
        }
        if self.turn.max_depth == 0 {
            return Err(Error::Config("turn.max_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Get artifact directory path (with `~` expanded)
    pub fn artifact_dir(&self) -> PathBuf {
        expand_path(&self.artifacts.directory)
    }

    /// Get session transcript directory path (with `~` expanded)
    pub fn session_dir(&self) -> PathBuf {
        expand_path(&self.sessions.directory)
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// Which backend implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions API
    Openai,
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// API base URL
    #[serde(default)]
    pub api_base: Option<String>,

    /// API key (falls back to `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Primary model
    #[serde(default = "default_model")]
    pub model: String,

    /// Model swapped in once after a persistent failure
    #[serde(default)]
    pub fallback_model: Option<String>,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Openai
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            api_base: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            fallback_model: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Staged retry harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay", with = "duration_str")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "duration_str")]
    pub max_delay: Duration,

    /// Fractional jitter applied to each delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_attempt_timeout", with = "duration_str")]
    pub attempt_timeout: Duration,

    #[serde(default = "default_turn_timeout", with = "duration_str")]
    pub turn_timeout: Duration,

    /// Disable jitter (for reproducible runs)
    #[serde(default)]
    pub deterministic: bool,

    /// Failures in a row before swapping to the fallback backend
    #[serde(default = "default_failover_after")]
    pub failover_after: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> f64 {
    0.25
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_turn_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_failover_after() -> u32 {
    2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            attempt_timeout: default_attempt_timeout(),
            turn_timeout: default_turn_timeout(),
            deterministic: false,
            failover_after: default_failover_after(),
        }
    }
}

/// Evidence gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Synthesis attempts for strict obligations before hard-blocking
    #[serde(default = "default_hard_ceiling")]
    pub hard_ceiling: u32,

    /// Synthesis attempts for non-strict obligations
    #[serde(default = "default_soft_ceiling")]
    pub soft_ceiling: u32,
}

fn default_hard_ceiling() -> u32 {
    3
}

fn default_soft_ceiling() -> u32 {
    1
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hard_ceiling: default_hard_ceiling(),
            soft_ceiling: default_soft_ceiling(),
        }
    }
}

/// Turn loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum model calls in one turn
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Maximum continuations a stop hook may request
    #[serde(default = "default_max_stop_continuations")]
    pub max_stop_continuations: u32,

    /// Race two model calls and keep the first usable one
    #[serde(default)]
    pub dual_sampling: bool,
}

fn default_max_depth() -> u32 {
    40
}

fn default_max_stop_continuations() -> u32 {
    3
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_stop_continuations: default_max_stop_continuations(),
            dual_sampling: false,
        }
    }
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_artifact_dir")]
    pub directory: PathBuf,

    /// Application name used in artifact keys
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".popper/artifacts")
}

fn default_app_name() -> String {
    "popper".to_string()
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            directory: default_artifact_dir(),
            app_name: default_app_name(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_dir")]
    pub directory: PathBuf,

    /// User id used in artifact keys
    #[serde(default = "default_user")]
    pub user: String,

    /// Lifetime of cached tool results
    #[serde(default = "default_cache_ttl", with = "duration_str")]
    pub cache_ttl: Duration,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from(".popper/sessions")
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: default_session_dir(),
            user: default_user(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

/// Shell commands invoked as hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_tool_use: Vec<String>,

    #[serde(default)]
    pub post_tool_use: Vec<String>,

    #[serde(default)]
    pub stop: Vec<String>,

    /// Per-command time limit
    #[serde(default = "default_hook_timeout", with = "duration_str")]
    pub timeout: Duration,
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(30)
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.pre_tool_use.is_empty() && self.post_tool_use.is_empty() && self.stop.is_empty()
    }
}

/// Built-in tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_bash_timeout", with = "duration_str")]
    pub bash_timeout: Duration,

    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
}

fn default_bash_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_search_max_results() -> usize {
    200
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bash_timeout: default_bash_timeout(),
            search_max_results: default_search_max_results(),
        }
    }
}

/// Serde adapter for human-readable durations ("30s", "2m 30s")
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Initialize .popper directory
pub fn init(force: bool) -> Result<PathBuf> {
    let popper_dir = PathBuf::from(".popper");

    if !popper_dir.exists() {
        std::fs::create_dir_all(&popper_dir)?;
    }

    for sub in ["artifacts", "sessions"] {
        let dir = popper_dir.join(sub);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
    }

    // Create default config if it doesn't exist
    let config_path = popper_dir.join("config.toml");
    if force || !config_path.exists() {
        let default_config = Config::default();
        let config_str = toml::to_string_pretty(&default_config)
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, config_str)?;
    }

    Ok(config_path)
}
