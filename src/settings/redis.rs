//! Redis-backed setting store.
//!
//! Each scope is one Redis hash (`settings:<scope>`), so the relay server,
//! which writes settings through the admin surface, and the workers, which
//! read them before every publish, see the same values.

use super::{SettingStore, SettingsError};
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Connection, Pool};
use tracing::{debug, error};

/// Prefix for the per-scope settings hash
pub const SETTINGS_KEY_PREFIX: &str = "settings";

/// Setting store over a Redis hash per scope.
#[derive(Clone)]
pub struct RedisSettingStore {
    pool: Pool,
}

impl RedisSettingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn hash_key(scope: &str) -> String {
        format!("{}:{}", SETTINGS_KEY_PREFIX, scope)
    }

    async fn connection(&self) -> Result<Connection, SettingsError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for settings");
            SettingsError::Connection(e.to_string())
        })
    }
}

#[async_trait]
impl SettingStore for RedisSettingStore {
    async fn get_value(&self, scope: &str, key: &str) -> Result<Option<String>, SettingsError> {
        let mut conn = self.connection().await?;

        let value: Option<String> = cmd("HGET")
            .arg(Self::hash_key(scope))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| SettingsError::Backend(e.to_string()))?;

        Ok(value)
    }

    async fn set_value(&self, scope: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut conn = self.connection().await?;

        let _: () = cmd("HSET")
            .arg(Self::hash_key(scope))
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| SettingsError::Backend(e.to_string()))?;

        debug!(scope = %scope, key = %key, "Setting stored");
        Ok(())
    }

    async fn delete_value(&self, scope: &str, key: &str) -> Result<(), SettingsError> {
        let mut conn = self.connection().await?;

        let _: () = cmd("HDEL")
            .arg(Self::hash_key(scope))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| SettingsError::Backend(e.to_string()))?;

        debug!(scope = %scope, key = %key, "Setting deleted");
        Ok(())
    }
}
