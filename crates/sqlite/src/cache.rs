use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::runtime::Runtime;
use query_orchestrator::cache::{
    CacheDriver,
    CacheSetResult,
};
use rusqlite::{
    params,
    OptionalExtension,
};
use serde_json::Value as JsonValue;

use crate::Database;

/// [`CacheDriver`] over the `cache` and `cache_locks` tables. Expired rows
/// read as missing and are deleted by [`CacheDriver::cleanup`].
pub struct SqliteCacheDriver<RT: Runtime> {
    rt: RT,
    database: Arc<Database>,
}

impl<RT: Runtime> SqliteCacheDriver<RT> {
    pub(crate) fn new(rt: RT, database: Arc<Database>) -> Self {
        Self { rt, database }
    }

    fn expires_at(&self, ttl: Duration) -> i64 {
        self.rt
            .unix_millis()
            .saturating_add(ttl.as_millis().try_into().unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl<RT: Runtime> CacheDriver for SqliteCacheDriver<RT> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        let now = self.rt.unix_millis();
        let stored: Option<String> = self.database.read(|connection| {
            Ok(connection
                .query_row(GET_VALUE, params![key, now], |row| row.get(0))
                .optional()?)
        })?;
        stored
            .map(|json_value| Ok(serde_json::from_str(&json_value)?))
            .transpose()
    }

    async fn set(
        &self,
        key: &str,
        value: JsonValue,
        expiration: Duration,
    ) -> anyhow::Result<CacheSetResult> {
        let json_value = value.to_string();
        let expires_at = self.expires_at(expiration);
        self.database.transaction(|connection| {
            connection.execute(SET_VALUE, params![key, &json_value, expires_at])?;
            Ok(())
        })?;
        Ok(CacheSetResult {
            key: key.to_owned(),
            bytes: json_value.len(),
        })
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.database.transaction(|connection| {
            connection.execute(REMOVE_VALUE, params![key])?;
            Ok(())
        })
    }

    async fn keys_starting_with(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = self.rt.unix_millis();
        self.database.read(|connection| {
            let mut stmt = connection.prepare_cached(KEYS_STARTING_WITH)?;
            let keys = stmt
                .query_map(params![prefix, now], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = self.rt.unix_millis();
        let expires_at = self.expires_at(ttl);
        self.database.transaction(|connection| {
            let held_until: Option<i64> = connection
                .query_row(GET_LOCK, params![key], |row| row.get(0))
                .optional()?;
            if held_until.is_some_and(|held_until| held_until > now) {
                return Ok(false);
            }
            connection.execute(SET_LOCK, params![key, expires_at])?;
            Ok(true)
        })
    }

    async fn free_lock(&self, key: &str) -> anyhow::Result<()> {
        self.database.transaction(|connection| {
            connection.execute(REMOVE_LOCK, params![key])?;
            Ok(())
        })
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let now = self.rt.unix_millis();
        let (values, locks) = self.database.transaction(|connection| {
            let values = connection.execute(CLEANUP_VALUES, params![now])?;
            let locks = connection.execute(CLEANUP_LOCKS, params![now])?;
            Ok((values, locks))
        })?;
        tracing::debug!("Removed {values} expired cache entries and {locks} expired locks");
        Ok(())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        self.database.read(|connection| {
            connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }
}

const GET_VALUE: &str = "SELECT json_value FROM cache WHERE key = ? AND expires_at > ?";
const SET_VALUE: &str = "INSERT OR REPLACE INTO cache VALUES (?, ?, ?)";
const REMOVE_VALUE: &str = "DELETE FROM cache WHERE key = ?";
const KEYS_STARTING_WITH: &str = r#"
SELECT key
FROM cache
WHERE substr(key, 1, length($1)) = $1 AND expires_at > $2
ORDER BY key ASC
"#;
const CLEANUP_VALUES: &str = "DELETE FROM cache WHERE expires_at <= ?";

const GET_LOCK: &str = "SELECT expires_at FROM cache_locks WHERE key = ?";
const SET_LOCK: &str = "INSERT OR REPLACE INTO cache_locks VALUES (?, ?)";
const REMOVE_LOCK: &str = "DELETE FROM cache_locks WHERE key = ?";
const CLEANUP_LOCKS: &str = "DELETE FROM cache_locks WHERE expires_at <= ?";
