//! Service configuration for the relay binaries.
//!
//! Loads configuration from a TOML file with environment variable
//! substitution. Relay settings (broker host, exchange, ...) are not read from
//! here at runtime; the optional `[settings]` table only seeds the setting
//! store on first boot.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${RELAY_API_KEY}"
//!
//! [redis]
//! url = "redis://localhost:6379"
//!
//! [settings]
//! host = "rabbitmq"
//! exchange = "nextcloud.events"
//! ```

use crate::settings::{is_admin_key, SettingStore, SettingsError, KEY_ENABLED};
use crate::APP_ID;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info, warn};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Initial relay settings, written to the store when not already set
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the admin and ingest endpoints
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Jobs read per stream poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            consumer_group: default_consumer_group(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_consumer_group() -> String {
    "relay_workers".to_string()
}

fn default_batch_size() -> usize {
    10
}

impl ServiceConfig {
    /// Load configuration from the default path or RELAY_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/relay.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        info!(
            seeded_settings = config.settings.len(),
            consumer_group = %config.worker.consumer_group,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate TOML text, substituting `${VAR}` references first.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let config: ServiceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(
                "redis.url must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.worker.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "worker.batch_size must be at least 1".to_string(),
            ));
        }

        for (key, value) in &self.settings {
            if !is_admin_key(key) && key != KEY_ENABLED {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown relay setting '{}'",
                    key
                )));
            }
            if value.contains("${") {
                warn!(
                    key = %key,
                    "Relay setting contains unsubstituted environment variable"
                );
            }
        }

        if matches!(self.server.api_key.as_deref(), Some(key) if key.contains("${")) {
            warn!("server.api_key contains unsubstituted environment variable");
        }

        Ok(())
    }

    /// Write `[settings]` values that the store does not have yet.
    ///
    /// Returns the number of values written.
    pub async fn seed_settings(&self, store: &dyn SettingStore) -> Result<usize, SettingsError> {
        let mut written = 0;
        for (key, value) in &self.settings {
            if store.get_value(APP_ID, key).await?.is_none() {
                store.set_value(APP_ID, key, value).await?;
                written += 1;
            }
        }
        if written > 0 {
            info!(count = written, "Seeded relay settings");
        }
        Ok(written)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
