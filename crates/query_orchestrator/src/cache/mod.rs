//! Key/value storage with expiry and a TTL-bounded mutual exclusion lock,
//! shared by the query cache and the pre-aggregation engine.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

pub mod local;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSetResult {
    pub key: String,
    /// Size of the serialized value.
    pub bytes: usize,
}

#[async_trait]
pub trait CacheDriver: Send + Sync {
    /// Missing and expired keys both read as `None`.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, expiration: Duration)
        -> anyhow::Result<CacheSetResult>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn keys_starting_with(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Takes the lock named `key` unless somebody else holds an unexpired one.
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    async fn free_lock(&self, key: &str) -> anyhow::Result<()>;

    /// Runs `f` only if the lock could be taken. Returns whether it ran. With
    /// `release_after` unset the lock stays held until its TTL expires, which
    /// rate-limits `f` across processes.
    async fn with_lock(
        &self,
        key: &str,
        ttl: Duration,
        release_after: bool,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<bool> {
        if !self.try_acquire_lock(key, ttl).await? {
            tracing::debug!("Lock {key} is held by somebody else");
            return Ok(false);
        }
        let result = f.await;
        if release_after {
            self.free_lock(key).await?;
        }
        result?;
        Ok(true)
    }

    async fn cleanup(&self) -> anyhow::Result<()>;

    async fn test_connection(&self) -> anyhow::Result<()>;
}

pub(crate) fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}
