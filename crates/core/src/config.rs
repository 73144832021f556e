use serde::Deserialize;
use std::path::Path;

/// Root telemetry configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `BEACON__`.
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub experiments: ExperimentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    /// Remote collector URL. When absent, batches go to the log collector.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    #[serde(default = "default_consent_granted")]
    pub default_granted: bool,
    #[serde(default = "default_consent_key")]
    pub storage_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    /// Persist traffic exclusions so an excluded identity stays excluded.
    #[serde(default = "default_sticky_exclusion")]
    pub sticky_exclusion: bool,
    #[serde(default = "default_min_sample_size")]
    pub default_min_sample_size: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// JSON file backing the key-value store. In-memory when absent.
    #[serde(default)]
    pub path: Option<String>,
}

// Default functions
fn default_app_id() -> String {
    "beacon-app".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_ms() -> u64 {
    30_000
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_max_pending() -> usize {
    1_000
}
fn default_idle_timeout_secs() -> u64 {
    1_800
}
fn default_consent_granted() -> bool {
    true
}
fn default_consent_key() -> String {
    "beacon.consent".to_string()
}
fn default_sticky_exclusion() -> bool {
    true
}
fn default_min_sample_size() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            default_granted: default_consent_granted(),
            storage_key: default_consent_key(),
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sticky_exclusion: default_sticky_exclusion(),
            default_min_sample_size: default_min_sample_size(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            queue: QueueConfig::default(),
            collector: CollectorConfig::default(),
            session: SessionConfig::default(),
            consent: ConsentConfig::default(),
            experiments: ExperimentConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl BeaconConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional file, then overlay environment
    /// variables (`BEACON__QUEUE__BATCH_SIZE=20`).
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BEACON")
                .separator("__")
                .try_parsing(true),
        );

        let config: BeaconConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(config::ConfigError::Message(
                "queue.batch_size must be at least 1".to_string(),
            ));
        }
        if self.queue.max_pending < self.queue.batch_size {
            return Err(config::ConfigError::Message(
                "queue.max_pending must not be smaller than queue.batch_size".to_string(),
            ));
        }
        Ok(())
    }
}
