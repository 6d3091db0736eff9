use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::anchor::retry::RetryPolicy;
use crate::audit::batch::BatchPolicy;
use crate::error::AnchorError;

pub const CONFIG_PATH_ENV: &str = "ANCHOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "anchor.toml";
pub const ENV_PREFIX: &str = "ANCHOR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server: ServerConfig,
    pub batch: BatchConfig,
    pub ledger: LedgerConfig,
    pub retry: RetryConfig,
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub max_events: usize,
    pub max_age_secs: u64,
    /// How often the age policy is checked
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Http,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub kind: LedgerKind,
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
    pub idempotency_keys: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://anchor.db".to_string(),
            server: ServerConfig::default(),
            batch: BatchConfig::default(),
            ledger: LedgerConfig::default(),
            retry: RetryConfig::default(),
            reconcile_interval_secs: 30,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        let policy = BatchPolicy::default();
        Self {
            max_events: policy.max_events,
            max_age_secs: policy.max_age.as_secs(),
            tick_interval_ms: 1000,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::Memory,
            base_url: None,
            request_timeout_secs: 30,
            idempotency_keys: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_backoff_secs: policy.initial_backoff.as_secs(),
            max_backoff_secs: policy.max_backoff.as_secs(),
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl AppConfig {
    /// Load from `$ANCHOR_CONFIG` (default `anchor.toml`, optional) with
    /// `ANCHOR__SECTION__FIELD` environment overrides
    pub fn load() -> Result<Self, AnchorError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, AnchorError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::new(path, ::config::FileFormat::Toml).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AnchorError::ConfigError(format!("Failed to load {}: {}", path, e)))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| AnchorError::ConfigError(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AnchorError> {
        if self.batch.max_events == 0 {
            return Err(AnchorError::ConfigError(
                "batch.max_events must be at least 1".to_string(),
            ));
        }
        if self.batch.max_age_secs == 0 {
            return Err(AnchorError::ConfigError(
                "batch.max_age_secs must be at least 1".to_string(),
            ));
        }
        if self.batch.tick_interval_ms == 0 || self.reconcile_interval_secs == 0 {
            return Err(AnchorError::ConfigError(
                "tick and reconcile intervals must be non-zero".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AnchorError::ConfigError(format!(
                "retry.multiplier ({}) must be at least 1.0",
                self.retry.multiplier
            )));
        }
        if self.retry.initial_backoff_secs > self.retry.max_backoff_secs {
            return Err(AnchorError::ConfigError(format!(
                "retry.initial_backoff_secs ({}) exceeds retry.max_backoff_secs ({})",
                self.retry.initial_backoff_secs, self.retry.max_backoff_secs
            )));
        }
        if self.ledger.kind == LedgerKind::Http
            && self.ledger.base_url.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(AnchorError::ConfigError(
                "ledger.base_url is required for the http ledger".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        BatchPolicy {
            max_events: self.batch.max_events,
            max_age: Duration::from_secs(self.batch.max_age_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_secs(self.retry.initial_backoff_secs),
            max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn to_toml(&self) -> Result<String, AnchorError> {
        toml::to_string_pretty(self)
            .map_err(|e| AnchorError::ConfigError(format!("Failed to render configuration: {}", e)))
    }
}
