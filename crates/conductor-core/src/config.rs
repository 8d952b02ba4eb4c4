use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// Top-level Conductor configuration (`conductor.toml`).
///
/// Every section is optional; an empty file yields a working config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub inference: Option<InferenceConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Scheduler limits and per-node defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of nodes running at once within one execution.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Node timeout when the definition does not set one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Node retry budget when the definition does not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Capacity of the execution event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            default_timeout_ms: default_timeout_ms(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_parallelism() -> usize { 5 }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 3 }
fn default_event_capacity() -> usize { 256 }

/// Exponential backoff shared by node retries and inference retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Relative jitter, 0.2 means a factor in [0.8, 1.2].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based): `initial * 2^retry`,
    /// capped at `max_backoff_ms`, then jittered.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.min(32));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_millis(ms);
        }
        let scale = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
        Duration::from_millis((ms as f64 * scale) as u64)
    }
}

fn default_initial_backoff() -> u64 { 1_000 }
fn default_max_backoff() -> u64 { 60_000 }
fn default_jitter() -> f64 { 0.2 }

/// Reflection checks and self-correction budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Fraction of a factual sentence's salient terms that must appear in
    /// the sources.
    #[serde(default = "default_support_threshold")]
    pub support_threshold: f64,
    /// Generic length floor for textual output.
    #[serde(default = "default_min_output_chars")]
    pub min_output_chars: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            support_threshold: default_support_threshold(),
            min_output_chars: default_min_output_chars(),
        }
    }
}

fn default_max_iterations() -> usize { 2 }
fn default_support_threshold() -> f64 { 0.5 }
fn default_min_output_chars() -> usize { 20 }

/// Feedback aggregation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Average rating below which a capability is avoided.
    #[serde(default = "default_avoid_below")]
    pub avoid_below: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Cron expression for the background refresher (seconds field first).
    #[serde(default = "default_refresh_schedule")]
    pub refresh_schedule: String,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            avoid_below: default_avoid_below(),
            min_samples: default_min_samples(),
            refresh_schedule: default_refresh_schedule(),
        }
    }
}

fn default_window_days() -> i64 { 30 }
fn default_avoid_below() -> f64 { 2.5 }
fn default_min_samples() -> usize { 3 }
fn default_refresh_schedule() -> String { "0 0 * * * *".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Keep checkpoints after a run finishes.
    #[serde(default)]
    pub keep_checkpoints: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keep_checkpoints: false,
        }
    }
}

fn default_data_dir() -> String { "~/.conductor".to_string() }

/// OpenAI-compatible inference endpoint used for self-correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_request_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    /// Read execution status, capabilities and preferences
    Viewer,
    /// Submit and cancel executions, send feedback
    #[default]
    Operator,
    /// Everything, including preference refresh
    Admin,
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// JSONL run logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <data_dir>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary, 2 = node transitions, 3 = retries and reflection.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_parallelism == 0 {
            return Err(ConductorError::Config(
                "engine.max_parallelism must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reflection.support_threshold) {
            return Err(ConductorError::Config(
                "reflection.support_threshold must be within [0, 1]".into(),
            ));
        }
        if self.learning.window_days <= 0 {
            return Err(ConductorError::Config(
                "learning.window_days must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.store.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("conductor.db")
    }

    /// Resolve the JSONL log directory.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => self.data_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
