use std::{
    collections::BTreeMap,
    time::Duration,
};

use async_trait::async_trait;
use common::runtime::Runtime;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    lock_key,
    CacheDriver,
    CacheSetResult,
};

struct Entry {
    value: Value,
    expires_at: i64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    locks: BTreeMap<String, i64>,
}

impl Inner {
    fn remove_expired(&mut self, now: i64) {
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.locks.retain(|_, held_until| *held_until > now);
    }
}

/// Memory-backed [`CacheDriver`]. Expiry is evaluated against the runtime's
/// clock, and expired entries are swept on every write or listing.
pub struct LocalCacheDriver<RT: Runtime> {
    rt: RT,
    inner: Mutex<Inner>,
}

impl<RT: Runtime> LocalCacheDriver<RT> {
    pub fn new(rt: RT) -> Self {
        Self {
            rt,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn expires_at(&self, ttl: Duration) -> i64 {
        self.rt
            .unix_millis()
            .saturating_add(ttl.as_millis().try_into().unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl<RT: Runtime> CacheDriver for LocalCacheDriver<RT> {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let now = self.rt.unix_millis();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.entries.remove(key);
                Ok(None)
            },
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        expiration: Duration,
    ) -> anyhow::Result<CacheSetResult> {
        let bytes = value.to_string().len();
        let expires_at = self.expires_at(expiration);
        let mut inner = self.inner.lock();
        inner.remove_expired(self.rt.unix_millis());
        inner
            .entries
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(CacheSetResult {
            key: key.to_owned(),
            bytes,
        })
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.lock().entries.remove(key);
        Ok(())
    }

    async fn keys_starting_with(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.remove_expired(self.rt.unix_millis());
        Ok(inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = self.rt.unix_millis();
        let expires_at = self.expires_at(ttl);
        let mut inner = self.inner.lock();
        let key = lock_key(key);
        match inner.locks.get(&key) {
            Some(held_until) if *held_until > now => Ok(false),
            _ => {
                inner.locks.insert(key, expires_at);
                Ok(true)
            },
        }
    }

    async fn free_lock(&self, key: &str) -> anyhow::Result<()> {
        self.inner.lock().locks.remove(&lock_key(key));
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.inner.lock().remove_expired(self.rt.unix_millis());
        Ok(())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::LocalCacheDriver;
    use crate::cache::CacheDriver;

    #[orchestrator_macro::test_runtime]
    async fn test_values_expire(rt: TestRuntime) -> anyhow::Result<()> {
        let cache = LocalCacheDriver::new(rt.clone());
        let stored = cache
            .set("SQL_QUERY_RESULT_a", json!({"n": 1}), Duration::from_secs(10))
            .await?;
        assert_eq!(stored.bytes, r#"{"n":1}"#.len());
        cache
            .set("SQL_QUERY_RESULT_b", json!(2), Duration::from_secs(30))
            .await?;
        cache.set("OTHER", json!(3), Duration::from_secs(30)).await?;

        assert_eq!(cache.get("SQL_QUERY_RESULT_a").await?, Some(json!({"n": 1})));
        assert_eq!(
            cache.keys_starting_with("SQL_QUERY_RESULT_").await?,
            vec!["SQL_QUERY_RESULT_a", "SQL_QUERY_RESULT_b"]
        );

        rt.advance_time(Duration::from_secs(11)).await;
        assert_eq!(cache.get("SQL_QUERY_RESULT_a").await?, None);
        assert_eq!(
            cache.keys_starting_with("SQL_QUERY_RESULT_").await?,
            vec!["SQL_QUERY_RESULT_b"]
        );
        cache.remove("SQL_QUERY_RESULT_b").await?;
        assert_eq!(cache.get("SQL_QUERY_RESULT_b").await?, None);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_expired_entries_are_swept_on_write(rt: TestRuntime) -> anyhow::Result<()> {
        let cache = LocalCacheDriver::new(rt.clone());
        for key in ["a", "b", "c"] {
            cache.set(key, json!(key), Duration::from_secs(10)).await?;
        }
        assert!(cache.try_acquire_lock("a", Duration::from_secs(10)).await?);
        rt.advance_time(Duration::from_secs(11)).await;

        // None of the expired keys is read again.
        cache.set("d", json!("d"), Duration::from_secs(10)).await?;
        let inner = cache.inner.lock();
        assert_eq!(inner.entries.keys().collect::<Vec<_>>(), vec!["d"]);
        assert!(inner.locks.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_with_lock(rt: TestRuntime) -> anyhow::Result<()> {
        let cache = LocalCacheDriver::new(rt.clone());
        let ttl = Duration::from_secs(60);

        assert!(cache.try_acquire_lock("drop", ttl).await?);
        let ran = cache
            .with_lock("drop", ttl, true, async { Ok::<_, anyhow::Error>(()) }.boxed())
            .await?;
        assert!(!ran);

        rt.advance_time(Duration::from_secs(61)).await;
        let mut runs = 0;
        let ran = cache
            .with_lock(
                "drop",
                ttl,
                false,
                async {
                    runs += 1;
                    Ok::<_, anyhow::Error>(())
                }
                .boxed(),
            )
            .await?;
        assert!(ran);
        assert_eq!(runs, 1);
        // Without release the lock keeps rate limiting.
        assert!(!cache.try_acquire_lock("drop", ttl).await?);

        cache.free_lock("drop").await?;
        let err = cache
            .with_lock(
                "drop",
                ttl,
                true,
                async { Err::<(), _>(anyhow::anyhow!("sweep failed")) }.boxed(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "sweep failed");
        // The lock is released even when `f` fails.
        assert!(cache.try_acquire_lock("drop", ttl).await?);
        Ok(())
    }
}
