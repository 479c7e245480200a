//! Process configuration
//!
//! Sections mirror the crates they configure: logging, the scheduler, the KV
//! cache shape, the compute backend, the node pool and the models to preload.

use cobalt_types::{
    CobaltError, KvCacheConfig, ModelSpec, Result, SchedulerConfig, TokenId, VirtualNodeConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Log levels accepted by [`LoggingConfig`]
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration of the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub kv_cache: KvCacheConfig,
    pub backend: BackendConfig,
    pub nodes: Vec<VirtualNodeConfig>,
    pub models: Vec<ModelEntry>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty or json
    pub format: String,
}

/// Host compute backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Number of devices the backend exposes
    pub devices: usize,
    pub max_streams_per_device: usize,
}

/// A model known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_true")]
    pub preload: bool,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub num_layers: Option<usize>,
    #[serde(default)]
    pub num_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub max_sequence_length: Option<usize>,
    #[serde(default)]
    pub eos_token: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl ModelEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: None,
            preload: true,
            memory_mb: None,
            num_layers: None,
            num_heads: None,
            head_dim: None,
            vocab_size: None,
            max_sequence_length: None,
            eos_token: None,
        }
    }

    /// Model spec with unset fields taken from the defaults
    pub fn to_spec(&self) -> ModelSpec {
        let d = ModelSpec::default();
        ModelSpec {
            path: self
                .path
                .clone()
                .unwrap_or_else(|| format!("models/{}", self.id)),
            memory_mb: self.memory_mb.unwrap_or(d.memory_mb),
            num_layers: self.num_layers.unwrap_or(d.num_layers),
            num_heads: self.num_heads.unwrap_or(d.num_heads),
            head_dim: self.head_dim.unwrap_or(d.head_dim),
            vocab_size: self.vocab_size.unwrap_or(d.vocab_size),
            max_sequence_length: self.max_sequence_length.unwrap_or(d.max_sequence_length),
            eos_token: self.eos_token.map(TokenId).unwrap_or(d.eos_token),
            ..d
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            scheduler: SchedulerConfig::default(),
            kv_cache: KvCacheConfig::default(),
            backend: BackendConfig::default(),
            nodes: vec![VirtualNodeConfig::default()],
            models: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            max_streams_per_device: 64,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CobaltError::config(format!("Invalid value for {}: {}", name, value)))
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Starts from the file named by `COBALT_CONFIG` when set, otherwise from
    /// the defaults, then applies the individual `COBALT_*` overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("COBALT_CONFIG") {
            Ok(path) => Self::load_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `COBALT_*` overrides looked up through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = lookup("COBALT_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(format) = lookup("COBALT_LOG_FORMAT") {
            self.logging.format = format.to_lowercase();
        }
        if let Some(v) = lookup("COBALT_QUEUE_CAPACITY") {
            self.scheduler.queue_capacity = parse_var("COBALT_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("COBALT_STATS_INTERVAL_MS") {
            self.scheduler.stats_interval_ms = parse_var("COBALT_STATS_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("COBALT_REFERENCE_MEMORY_MB") {
            self.scheduler.reference_memory_mb = parse_var("COBALT_REFERENCE_MEMORY_MB", &v)?;
        }
        Ok(())
    }

    fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CobaltError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(CobaltError::config(format!(
                "Log level must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }
        if !["pretty", "json"].contains(&self.logging.format.as_str()) {
            return Err(CobaltError::config("Log format must be one of: pretty, json"));
        }

        self.scheduler.validate()?;
        self.kv_cache.validate()?;

        if self.backend.devices == 0 || self.backend.max_streams_per_device == 0 {
            return Err(CobaltError::config(
                "Backend needs at least one device and one stream per device",
            ));
        }

        if self.nodes.is_empty() {
            return Err(CobaltError::config("At least one compute node is required"));
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !ids.insert(node.node_id.clone()) {
                return Err(CobaltError::config(format!(
                    "Duplicate compute node id: {}",
                    node.node_id
                )));
            }
            if node.device_id as usize >= self.backend.devices {
                return Err(CobaltError::config(format!(
                    "Node {} uses device {} but the backend has {}",
                    node.node_id, node.device_id, self.backend.devices
                )));
            }
        }

        let mut models = HashSet::new();
        for model in &self.models {
            if model.id.is_empty() {
                return Err(CobaltError::config("Model id cannot be empty"));
            }
            if !models.insert(model.id.as_str()) {
                return Err(CobaltError::config(format!("Duplicate model id: {}", model.id)));
            }
            model.to_spec().validate()?;
        }
        Ok(())
    }
}
