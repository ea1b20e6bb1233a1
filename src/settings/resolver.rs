//! Configuration resolver.
//!
//! Every read goes store -> `NC_<app>_<key>` environment variable -> default,
//! evaluated fresh each time so admin changes apply without a restart.
//!
//! The enabled flag is resolved as `publish_enabled` (store), then the legacy
//! `enabled` key (store), then the same two names in the environment, then
//! `true`.

use super::{
    SettingStore, SettingsError, KEY_ENABLED, KEY_EXCHANGE, KEY_EXCHANGE_TYPE, KEY_HOST,
    KEY_PASSWORD, KEY_PORT, KEY_ROUTING_PREFIX, KEY_USER, KEY_VHOST, LEGACY_KEY_ENABLED,
};
use crate::APP_ID;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "ncrag-app";
pub const DEFAULT_PASSWORD: &str = "ncrag-app";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_EXCHANGE: &str = "nextcloud.events";
pub const DEFAULT_EXCHANGE_TYPE: &str = "topic";
pub const DEFAULT_ROUTING_PREFIX: &str = "nextcloud";

/// Built-in default for `key`; empty for keys the relay does not know.
pub fn default_value(key: &str) -> &'static str {
    match key {
        KEY_HOST => DEFAULT_HOST,
        KEY_PORT => "5672",
        KEY_USER => DEFAULT_USER,
        KEY_PASSWORD => DEFAULT_PASSWORD,
        KEY_VHOST => DEFAULT_VHOST,
        KEY_EXCHANGE => DEFAULT_EXCHANGE,
        KEY_EXCHANGE_TYPE => DEFAULT_EXCHANGE_TYPE,
        KEY_ROUTING_PREFIX => DEFAULT_ROUTING_PREFIX,
        KEY_ENABLED | LEGACY_KEY_ENABLED => "1",
        _ => "",
    }
}

/// Name of the environment variable backing `key`.
pub fn env_var_name(key: &str) -> String {
    format!("NC_{}_{}", APP_ID, key)
}

/// Truthiness used for boolean settings.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Source of environment variables.
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Broker connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub vhost: String,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Every setting, resolved at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelaySettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip)]
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub exchange_type: String,
    pub routing_prefix: String,
}

impl RelaySettings {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            login: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
        }
    }
}

/// Resolves settings for this integration.
#[derive(Clone)]
pub struct ConfigResolver {
    store: Arc<dyn SettingStore>,
    env: Arc<dyn EnvSource>,
}

impl ConfigResolver {
    /// Resolver reading the given store and the process environment.
    pub fn new(store: Arc<dyn SettingStore>) -> Self {
        Self::with_env(store, Arc::new(ProcessEnv))
    }

    pub fn with_env(store: Arc<dyn SettingStore>, env: Arc<dyn EnvSource>) -> Self {
        Self { store, env }
    }

    pub fn store(&self) -> &Arc<dyn SettingStore> {
        &self.store
    }

    /// Explicit value for `key` from the store or the environment.
    ///
    /// A stored empty string counts as set; an empty environment variable
    /// does not.
    async fn lookup(&self, key: &str) -> Result<Option<String>, SettingsError> {
        if let Some(value) = self.store.get_value(APP_ID, key).await? {
            return Ok(Some(value));
        }
        Ok(self.env_lookup(key))
    }

    fn env_lookup(&self, key: &str) -> Option<String> {
        self.env
            .var(&env_var_name(key))
            .filter(|value| !value.is_empty())
    }

    /// Resolve `key` through store, environment and default.
    pub async fn get(&self, key: &str) -> Result<String, SettingsError> {
        Ok(self
            .lookup(key)
            .await?
            .unwrap_or_else(|| default_value(key).to_string()))
    }

    /// Whether events should be captured and published.
    pub async fn is_enabled(&self) -> Result<bool, SettingsError> {
        for key in [KEY_ENABLED, LEGACY_KEY_ENABLED] {
            if let Some(value) = self.store.get_value(APP_ID, key).await? {
                return Ok(parse_bool(&value));
            }
        }
        for key in [KEY_ENABLED, LEGACY_KEY_ENABLED] {
            if let Some(value) = self.env_lookup(key) {
                return Ok(parse_bool(&value));
            }
        }
        Ok(true)
    }

    /// Broker port; malformed values fall back to the default.
    pub async fn port(&self) -> Result<u16, SettingsError> {
        let raw = self.get(KEY_PORT).await?;
        match raw.trim().parse::<u16>() {
            Ok(port) => Ok(port),
            Err(_) => {
                warn!(value = %raw, default = DEFAULT_PORT, "Invalid broker port, using default");
                Ok(DEFAULT_PORT)
            }
        }
    }

    pub async fn connection_options(&self) -> Result<ConnectionOptions, SettingsError> {
        Ok(ConnectionOptions {
            host: self.get(KEY_HOST).await?,
            port: self.port().await?,
            login: self.get(KEY_USER).await?,
            password: self.get(KEY_PASSWORD).await?,
            vhost: self.get(KEY_VHOST).await?,
        })
    }

    /// Resolve every setting.
    pub async fn snapshot(&self) -> Result<RelaySettings, SettingsError> {
        Ok(RelaySettings {
            enabled: self.is_enabled().await?,
            host: self.get(KEY_HOST).await?,
            port: self.port().await?,
            user: self.get(KEY_USER).await?,
            password: self.get(KEY_PASSWORD).await?,
            vhost: self.get(KEY_VHOST).await?,
            exchange: self.get(KEY_EXCHANGE).await?,
            exchange_type: self.get(KEY_EXCHANGE_TYPE).await?,
            routing_prefix: self.get(KEY_ROUTING_PREFIX).await?,
        })
    }
}

/// Move a legacy `enabled` value to `publish_enabled`, then drop the legacy key.
///
/// An existing `publish_enabled` value is never overwritten. Errors are
/// logged and otherwise ignored.
pub async fn migrate_legacy_enabled(store: &dyn SettingStore) {
    if let Err(e) = try_migrate_legacy_enabled(store).await {
        warn!(error = %e, "Failed to migrate legacy enabled setting");
    }
}

async fn try_migrate_legacy_enabled(store: &dyn SettingStore) -> Result<(), SettingsError> {
    let Some(legacy) = store.get_value(APP_ID, LEGACY_KEY_ENABLED).await? else {
        return Ok(());
    };

    if store.get_value(APP_ID, KEY_ENABLED).await?.is_none() {
        let migrated = if parse_bool(&legacy) { "1" } else { "0" };
        store.set_value(APP_ID, KEY_ENABLED, migrated).await?;
        info!(legacy = %legacy, migrated = %migrated, "Migrated legacy enabled setting");
    }

    store.delete_value(APP_ID, LEGACY_KEY_ENABLED).await
}
