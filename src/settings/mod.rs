//! Relay settings.
//!
//! Settings live in a per-application key/value [`SettingStore`] owned by the
//! host (or by Redis, see [`RedisSettingStore`]). The [`ConfigResolver`] reads
//! them fresh on every call, falling back to `NC_<app>_<key>` environment
//! variables and then to built-in defaults.

pub mod redis;
pub mod resolver;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

pub use self::redis::RedisSettingStore;
pub use resolver::{ConfigResolver, ConnectionOptions, EnvSource, ProcessEnv, RelaySettings};

pub const KEY_HOST: &str = "host";
pub const KEY_PORT: &str = "port";
pub const KEY_USER: &str = "user";
pub const KEY_PASSWORD: &str = "pass";
pub const KEY_VHOST: &str = "vhost";
pub const KEY_EXCHANGE: &str = "exchange";
pub const KEY_EXCHANGE_TYPE: &str = "exchange_type";
pub const KEY_ROUTING_PREFIX: &str = "routing_prefix";
pub const KEY_ENABLED: &str = "publish_enabled";

/// Key that held the enabled flag before it was renamed to [`KEY_ENABLED`].
pub const LEGACY_KEY_ENABLED: &str = "enabled";

/// Keys the admin surface may write. The enabled flag is deliberately absent.
pub const ADMIN_KEYS: [&str; 8] = [
    KEY_HOST,
    KEY_PORT,
    KEY_USER,
    KEY_PASSWORD,
    KEY_VHOST,
    KEY_EXCHANGE,
    KEY_EXCHANGE_TYPE,
    KEY_ROUTING_PREFIX,
];

/// Whether the admin surface accepts writes to `key`.
pub fn is_admin_key(key: &str) -> bool {
    ADMIN_KEYS.contains(&key)
}

/// Errors raised by a setting store backend.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("setting store connection error: {0}")]
    Connection(String),

    #[error("setting store command error: {0}")]
    Backend(String),
}

/// Scoped key/value store for application settings.
#[async_trait]
pub trait SettingStore: Send + Sync {
    /// Read `key` in `scope`; `None` when it has never been set.
    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<String>, SettingsError>;

    async fn set_value(&self, scope: &str, key: &str, value: &str) -> Result<(), SettingsError>;

    async fn delete_value(&self, scope: &str, key: &str) -> Result<(), SettingsError>;

    /// Read `key`, returning `default` when it is not set.
    async fn get_value_or(
        &self,
        scope: &str,
        key: &str,
        default: &str,
    ) -> Result<String, SettingsError> {
        Ok(self
            .get_value(scope, key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }
}

/// In-process setting store.
#[derive(Debug, Default)]
pub struct MemorySettingStore {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemorySettingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `pairs` under `scope`.
    pub fn with_values<'a>(scope: &str, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let values = pairs
            .into_iter()
            .map(|(k, v)| ((scope.to_string(), k.to_string()), v.to_string()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }
}

#[async_trait]
impl SettingStore for MemorySettingStore {
    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<String>, SettingsError> {
        let values = self
            .values
            .read()
            .map_err(|e| SettingsError::Backend(e.to_string()))?;
        Ok(values.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set_value(&self, scope: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self
            .values
            .write()
            .map_err(|e| SettingsError::Backend(e.to_string()))?;
        values.insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete_value(&self, scope: &str, key: &str) -> Result<(), SettingsError> {
        let mut values = self
            .values
            .write()
            .map_err(|e| SettingsError::Backend(e.to_string()))?;
        values.remove(&(scope.to_string(), key.to_string()));
        Ok(())
    }
}
