//! Configuration for the gateway.

use std::path::Path;
use std::time::{Duration, Instant};

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::gateway::{BatchQueueConfig, EngineConfig};
use crate::provider::GenerationParams;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Batch collection and worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Maximum time to wait for a batch to fill (seconds).
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: f64,
    /// Maximum number of requests dispatched together.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Pause after an empty collection cycle (milliseconds).
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff_ms: u64,
    /// Per-model queue limit. Unset means unbounded.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    /// Abort upstream calls when the client goes away.
    #[serde(default)]
    pub cancel_on_disconnect: bool,
    /// Pause before restarting a crashed worker (milliseconds).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_timeout_secs: default_batch_timeout(),
            max_batch_size: default_max_batch_size(),
            idle_backoff_ms: default_idle_backoff(),
            max_queue_depth: None,
            cancel_on_disconnect: false,
            restart_delay_ms: default_restart_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Model used when a request names none.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Models that get a worker at startup.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            models: default_models(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_batch_timeout() -> f64 {
    0.1
}
fn default_max_batch_size() -> usize {
    5
}
fn default_idle_backoff() -> u64 {
    100
}
fn default_restart_delay() -> u64 {
    1000
}
fn default_model() -> String {
    "qwen".to_string()
}
fn default_models() -> Vec<String> {
    vec!["qwen".to_string(), "llama-3-70b".to_string()]
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    500
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_request_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (NEURALRIPPER__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Same as [`Config::load`], reading the optional file at `path`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_string_lossy().into_owned();

        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("NEURALRIPPER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("inference.models")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batching.max_batch_size == 0 {
            return Err(ConfigError::Message(
                "batching.max_batch_size must be at least 1".to_string(),
            ));
        }
        let timeout = self.batching.batch_timeout_secs;
        if timeout <= 0.0 || !timeout.is_finite() {
            return Err(ConfigError::Message(
                "batching.batch_timeout_secs must be a positive number".to_string(),
            ));
        }
        let representable = Duration::try_from_secs_f64(timeout)
            .ok()
            .and_then(|timeout| Instant::now().checked_add(timeout))
            .is_some();
        if !representable {
            return Err(ConfigError::Message(format!(
                "batching.batch_timeout_secs is too large: {}",
                timeout
            )));
        }
        Ok(())
    }

    /// Settings for the batching engine.
    pub fn engine_config(&self) -> EngineConfig {
        let batching = &self.batching;
        EngineConfig {
            queue: BatchQueueConfig::new(
                Duration::from_secs_f64(batching.batch_timeout_secs),
                batching.max_batch_size,
            )
            .with_max_queue_depth(batching.max_queue_depth),
            idle_backoff: Duration::from_millis(batching.idle_backoff_ms),
            restart_delay: Duration::from_millis(batching.restart_delay_ms),
            cancel_on_disconnect: batching.cancel_on_disconnect,
            params: GenerationParams {
                temperature: self.inference.default_temperature,
                max_tokens: self.inference.default_max_tokens,
            },
        }
    }
}
