//! In-process queue backend. All queues created through one
//! [`LocalDriverFactory`] with the same prefix share a single
//! [`LocalQueueState`], so several `QueryQueue` instances in one process behave
//! like several processes talking to a shared backend.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use common::runtime::Runtime;
use futures::{
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    millis,
    query_key_hash,
    sorted_by_score,
    AddToQueueRequest,
    AddToQueueResponse,
    CacheAndQueueDriverFactory,
    ProcessingId,
    QueryDef,
    QueryDefUpdate,
    QueryKey,
    QueryKeyHash,
    QueryKeysTuple,
    QueryStageState,
    QueueDriver,
    QueueDriverConnection,
    QueueDriverOptions,
    QueueId,
    QueueResult,
    RetrieveForProcessingResponse,
};
use crate::cache::{
    local::LocalCacheDriver,
    CacheDriver,
};

#[derive(Clone, Copy, Debug)]
struct QueueItem {
    order: i64,
    queue_id: Option<QueueId>,
}

type ScoredSet = BTreeMap<QueryKeyHash, QueueItem>;

/// Waiters subscribe to the sender before the result exists. `readers`
/// counts callers that still have to read it, `expires_at` is set together
/// with the result.
struct ResultSlot {
    sender: watch::Sender<Option<QueueResult>>,
    readers: usize,
    expires_at: Option<i64>,
}

impl ResultSlot {
    fn new() -> Self {
        Self {
            sender: watch::channel(None).0,
            readers: 0,
            expires_at: None,
        }
    }

    fn resolved(&self) -> Option<QueueResult> {
        self.sender.borrow().clone()
    }
}

pub struct LocalQueueState {
    results: BTreeMap<String, ResultSlot>,
    query_defs: BTreeMap<QueryKeyHash, QueryDef>,
    to_process: ScoredSet,
    recent: ScoredSet,
    active: ScoredSet,
    heart_beat: ScoredSet,
    processing_counter: ProcessingId,
    processing_locks: BTreeMap<QueryKeyHash, ProcessingId>,
}

impl Default for LocalQueueState {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            query_defs: BTreeMap::new(),
            to_process: BTreeMap::new(),
            recent: BTreeMap::new(),
            active: BTreeMap::new(),
            heart_beat: BTreeMap::new(),
            processing_counter: 1,
            processing_locks: BTreeMap::new(),
        }
    }
}

impl LocalQueueState {
    fn remove_query(&mut self, hash: &QueryKeyHash) -> Option<QueryDef> {
        self.active.remove(hash);
        self.heart_beat.remove(hash);
        self.to_process.remove(hash);
        self.recent.remove(hash);
        self.processing_locks.remove(hash);
        self.query_defs.remove(hash)
    }

    fn remove_expired_results(&mut self, now: i64) {
        self.results
            .retain(|_, slot| slot.expires_at.is_none_or(|expires_at| expires_at > now));
    }

    /// Counts one read of a resolved result, dropping it after the last one.
    fn read_result(&mut self, key: &str) -> Option<QueueResult> {
        let slot = self.results.get_mut(key)?;
        let result = slot.resolved()?;
        slot.readers = slot.readers.saturating_sub(1);
        if slot.readers == 0 {
            self.results.remove(key);
        }
        Some(result)
    }
}

fn ordered(set: &ScoredSet, below: Option<i64>) -> Vec<QueryKeysTuple> {
    sorted_by_score(
        set.iter()
            .filter(|(_, item)| below.is_none_or(|limit| item.order < limit))
            .map(|(hash, item)| (hash.clone(), item.order, item.queue_id)),
    )
    .into_iter()
    .map(|(hash, _, queue_id)| (hash, queue_id))
    .collect()
}

fn ordered_keys(set: &ScoredSet) -> Vec<QueryKeyHash> {
    ordered(set, None).into_iter().map(|(hash, _)| hash).collect()
}

/// Queue states by prefix.
#[derive(Clone, Default)]
pub struct LocalQueueStateRegistry {
    states: Arc<Mutex<BTreeMap<String, Arc<Mutex<LocalQueueState>>>>>,
}

impl LocalQueueStateRegistry {
    pub fn state(&self, prefix: &str) -> Arc<Mutex<LocalQueueState>> {
        self.states
            .lock()
            .entry(prefix.to_owned())
            .or_default()
            .clone()
    }
}

pub struct LocalQueueDriver<RT: Runtime> {
    rt: RT,
    options: Arc<QueueDriverOptions>,
    state: Arc<Mutex<LocalQueueState>>,
}

impl<RT: Runtime> LocalQueueDriver<RT> {
    pub fn new(rt: RT, options: QueueDriverOptions, registry: &LocalQueueStateRegistry) -> Self {
        let state = registry.state(&options.prefix);
        Self {
            rt,
            options: Arc::new(options),
            state,
        }
    }
}

#[async_trait]
impl<RT: Runtime> QueueDriver for LocalQueueDriver<RT> {
    async fn create_connection(&self) -> anyhow::Result<Arc<dyn QueueDriverConnection>> {
        Ok(Arc::new(LocalQueueDriverConnection {
            rt: self.rt.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
        }))
    }

    fn redis_hash(&self, query_key: &QueryKey) -> QueryKeyHash {
        query_key_hash(query_key, &self.options.process_uid)
    }
}

pub struct LocalQueueDriverConnection<RT: Runtime> {
    rt: RT,
    options: Arc<QueueDriverOptions>,
    state: Arc<Mutex<LocalQueueState>>,
}

#[async_trait]
impl<RT: Runtime> QueueDriverConnection for LocalQueueDriverConnection<RT> {
    async fn get_result(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueueResult>> {
        let key = self.options.result_key(hash);
        let mut state = self.state.lock();
        state.remove_expired_results(self.rt.unix_millis());
        Ok(state.read_result(&key))
    }

    async fn get_result_blocking(
        &self,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<QueueResult>> {
        let key = self.options.result_key(hash);
        let mut receiver = {
            let mut state = self.state.lock();
            state.remove_expired_results(self.rt.unix_millis());
            if let Some(result) = state.read_result(&key) {
                return Ok(Some(result));
            }
            if !state.query_defs.contains_key(hash) && !state.results.contains_key(&key) {
                return Ok(None);
            }
            state
                .results
                .entry(key.clone())
                .or_insert_with(ResultSlot::new)
                .sender
                .subscribe()
        };
        let resolved = async {
            receiver
                .wait_for(Option::is_some)
                .await
                .map(|result| result.clone())
                .ok()
                .flatten()
        };
        let result = select_biased! {
            result = resolved.fuse() => result,
            _ = self.rt.wait(self.options.continue_wait_timeout) => None,
        };
        if result.is_some() {
            self.state.lock().read_result(&key);
        }
        Ok(result)
    }

    async fn add_to_queue(
        &self,
        request: AddToQueueRequest,
    ) -> anyhow::Result<AddToQueueResponse> {
        let now = self.rt.unix_millis();
        let hash = query_key_hash(&request.query_key, &self.options.process_uid);
        let key_score = request.key_score;
        let orphaned_time = request.orphaned_time;
        let queue_id = Some(request.queue_id);

        let awaits_result = request.awaits_result;

        let mut state = self.state.lock();
        state.remove_expired_results(now);
        let key = self.options.result_key(&hash);
        let unread = state
            .results
            .get(&key)
            .filter(|slot| slot.expires_at.is_some())
            .map(|slot| slot.readers);
        match unread {
            Some(readers) if readers > 0 => {
                if let Some(slot) = state.results.get_mut(&key).filter(|_| awaits_result) {
                    slot.readers += 1;
                }
                return Ok(AddToQueueResponse {
                    added: false,
                    queue_id: None,
                    queue_size: state.to_process.len(),
                    added_to_queue_time: now,
                });
            },
            // Nobody is waiting for this one, compute it again.
            Some(_) => {
                state.results.remove(&key);
            },
            None => {},
        }
        if awaits_result {
            state.results.entry(key).or_insert_with(ResultSlot::new).readers += 1;
        }
        let def = state
            .query_defs
            .entry(hash.clone())
            .or_insert_with(|| request.into_query_def(now));
        let queue_id_of_def = def.queue_id;
        let added_to_queue_time = def.added_to_queue_time;

        let added = !state.to_process.contains_key(&hash) && !state.active.contains_key(&hash);
        if added {
            state.to_process.insert(
                hash.clone(),
                QueueItem {
                    order: key_score,
                    queue_id,
                },
            );
        }
        state.recent.insert(
            hash,
            QueueItem {
                order: orphaned_time,
                queue_id,
            },
        );
        Ok(AddToQueueResponse {
            added,
            queue_id: queue_id_of_def,
            queue_size: state.to_process.len(),
            added_to_queue_time,
        })
    }

    async fn get_to_process_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        Ok(ordered(&self.state.lock().to_process, None))
    }

    async fn get_active_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        Ok(ordered(&self.state.lock().active, None))
    }

    async fn get_orphaned_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let now = self.rt.unix_millis();
        Ok(ordered(&self.state.lock().recent, Some(now)))
    }

    async fn get_stalled_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let timeout = millis(self.options.heart_beat_timeout);
        let limit = self.rt.unix_millis() - timeout;
        Ok(ordered(&self.state.lock().heart_beat, Some(limit)))
    }

    async fn get_active_and_to_process(
        &self,
    ) -> anyhow::Result<(Vec<QueryKeysTuple>, Vec<QueryKeysTuple>)> {
        let state = self.state.lock();
        Ok((
            ordered(&state.active, None),
            ordered(&state.to_process, None),
        ))
    }

    async fn get_query_and_remove(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>> {
        let key = self.options.result_key(hash);
        let mut state = self.state.lock();
        // Waiters of a canceled query wake up without a result.
        if state.results.get(&key).is_some_and(|slot| slot.expires_at.is_none()) {
            state.results.remove(&key);
        }
        Ok(state.remove_query(hash))
    }

    async fn set_result_and_remove_query(
        &self,
        hash: &QueryKeyHash,
        result: QueueResult,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool> {
        let key = self.options.result_key(hash);
        let expires_at = self.rt.unix_millis() + millis(self.options.result_ttl());
        let mut state = self.state.lock();
        if state.processing_locks.get(hash) != Some(&processing_id) {
            return Ok(false);
        }
        state.remove_query(hash);
        let slot = state.results.entry(key).or_insert_with(ResultSlot::new);
        slot.expires_at = Some(expires_at);
        slot.sender.send_replace(Some(result));
        Ok(true)
    }

    async fn get_next_processing_id(&self) -> anyhow::Result<ProcessingId> {
        let mut state = self.state.lock();
        state.processing_counter += 1;
        Ok(state.processing_counter)
    }

    async fn get_query_stage_state(&self, only_keys: bool) -> anyhow::Result<QueryStageState> {
        let state = self.state.lock();
        Ok(QueryStageState {
            active: ordered_keys(&state.active),
            to_process: ordered_keys(&state.to_process),
            defs: if only_keys {
                BTreeMap::new()
            } else {
                state.query_defs.clone()
            },
        })
    }

    async fn get_query_def(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>> {
        Ok(self.state.lock().query_defs.get(hash).cloned())
    }

    async fn update_heart_beat(&self, hash: &QueryKeyHash) -> anyhow::Result<()> {
        let now = self.rt.unix_millis();
        if let Some(item) = self.state.lock().heart_beat.get_mut(hash) {
            item.order = now;
        }
        Ok(())
    }

    async fn retrieve_for_processing(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
    ) -> anyhow::Result<Option<RetrieveForProcessingResponse>> {
        let now = self.rt.unix_millis();
        let mut state = self.state.lock();
        if state.processing_locks.contains_key(hash) {
            return Ok(None);
        }
        state.processing_locks.insert(hash.clone(), processing_id);

        let query_def = state.query_defs.get(hash).cloned();
        let queue_id = query_def.as_ref().and_then(|def| def.queue_id);
        let added =
            state.active.len() < self.options.concurrency && !state.active.contains_key(hash);
        if added {
            state.active.insert(
                hash.clone(),
                QueueItem {
                    order: processing_id,
                    queue_id,
                },
            );
            state.to_process.remove(hash);
        }
        state.heart_beat.insert(
            hash.clone(),
            QueueItem {
                order: now,
                queue_id,
            },
        );
        Ok(Some(RetrieveForProcessingResponse {
            added,
            queue_id,
            active_keys: ordered_keys(&state.active),
            queue_size: state.to_process.len(),
            query_def,
            lock_acquired: true,
        }))
    }

    async fn free_processing_lock(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.processing_locks.get(hash) == Some(&processing_id) {
            state.processing_locks.remove(hash);
            if activated {
                state.active.remove(hash);
            }
        }
        Ok(())
    }

    async fn optimistic_query_update(
        &self,
        hash: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if state.processing_locks.get(hash) != Some(&processing_id) {
            return Ok(false);
        }
        if let Some(def) = state.query_defs.get_mut(hash) {
            def.apply(&update);
        }
        Ok(true)
    }
}

/// Memory-backed queues and cache for a single process.
pub struct LocalDriverFactory<RT: Runtime> {
    rt: RT,
    registry: LocalQueueStateRegistry,
    cache: Arc<LocalCacheDriver<RT>>,
}

impl<RT: Runtime> LocalDriverFactory<RT> {
    pub fn new(rt: RT) -> Self {
        let cache = Arc::new(LocalCacheDriver::new(rt.clone()));
        Self {
            rt,
            registry: LocalQueueStateRegistry::default(),
            cache,
        }
    }
}

impl<RT: Runtime> CacheAndQueueDriverFactory for LocalDriverFactory<RT> {
    fn queue_driver(&self, options: QueueDriverOptions) -> anyhow::Result<Arc<dyn QueueDriver>> {
        Ok(Arc::new(LocalQueueDriver::new(
            self.rt.clone(),
            options,
            &self.registry,
        )))
    }

    fn cache_driver(&self) -> anyhow::Result<Arc<dyn CacheDriver>> {
        Ok(self.cache.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::runtime::Runtime;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::{
        LocalQueueDriver,
        LocalQueueStateRegistry,
    };
    use crate::queue::{
        AddToQueueRequest,
        JobKind,
        QueryDefUpdate,
        QueueDriver,
        QueueDriverOptions,
        QueueResult,
    };

    fn options(concurrency: usize) -> QueueDriverOptions {
        QueueDriverOptions {
            prefix: "SQL_QUERY_test".to_owned(),
            concurrency,
            continue_wait_timeout: Duration::from_secs(5),
            orphaned_timeout: Duration::from_secs(120),
            heart_beat_timeout: Duration::from_secs(120),
            process_uid: "uid".to_owned(),
        }
    }

    fn request(key: &str, key_score: i64, orphaned_time: i64) -> AddToQueueRequest {
        AddToQueueRequest {
            key_score,
            query_key: json!(key),
            orphaned_time,
            query_handler: JobKind::Query,
            query: json!({"sql": key}),
            priority: 0,
            queue_id: key_score,
            stage_query_key: None,
            request_id: None,
            awaits_result: true,
        }
    }

    #[orchestrator_macro::test_runtime]
    async fn test_add_is_idempotent(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let conn = driver.create_connection().await?;
        let now = rt.unix_millis();

        let first = conn.add_to_queue(request("a", 10, now + 1000)).await?;
        assert!(first.added);
        assert_eq!(first.queue_size, 1);
        let second = conn.add_to_queue(request("a", 5, now + 5000)).await?;
        assert!(!second.added);
        assert_eq!(second.queue_size, 1);
        assert_eq!(second.queue_id, Some(10));

        // Re-adding refreshes the orphan deadline but not the score.
        rt.advance_time(Duration::from_secs(2)).await;
        assert!(conn.get_orphaned_queries().await?.is_empty());
        let to_process = conn.get_to_process_queries().await?;
        assert_eq!(to_process, vec![(driver.redis_hash(&json!("a")), Some(10))]);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_dispatch_order_and_concurrency(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(1), &registry);
        let conn = driver.create_connection().await?;
        let orphaned = rt.unix_millis() + 100_000;
        conn.add_to_queue(request("low", 300, orphaned)).await?;
        conn.add_to_queue(request("high", 100, orphaned)).await?;
        conn.add_to_queue(request("mid", 200, orphaned)).await?;
        let keys: Vec<_> = conn
            .get_to_process_queries()
            .await?
            .into_iter()
            .map(|(hash, _)| hash.to_string())
            .collect();
        assert_eq!(keys, vec!["high", "mid", "low"]);

        let high = driver.redis_hash(&json!("high"));
        let mid = driver.redis_hash(&json!("mid"));
        let pid = conn.get_next_processing_id().await?;
        let retrieved = conn.retrieve_for_processing(&high, pid).await?.unwrap();
        assert!(retrieved.added);
        assert!(retrieved.lock_acquired);
        assert_eq!(retrieved.queue_size, 2);

        // The lock is exclusive.
        assert!(conn.retrieve_for_processing(&high, pid + 1).await?.is_none());

        // Concurrency 1: the second query locks but doesn't activate.
        let pid2 = conn.get_next_processing_id().await?;
        let retrieved = conn.retrieve_for_processing(&mid, pid2).await?.unwrap();
        assert!(!retrieved.added);
        assert_eq!(retrieved.active_keys, vec![high.clone()]);
        conn.free_processing_lock(&mid, pid2, false).await?;
        assert_eq!(conn.get_active_queries().await?.len(), 1);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_result_requires_processing_lock(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let conn = driver.create_connection().await?;
        conn.add_to_queue(request("a", 1, rt.unix_millis() + 100_000))
            .await?;
        let hash = driver.redis_hash(&json!("a"));
        let pid = conn.get_next_processing_id().await?;
        conn.retrieve_for_processing(&hash, pid).await?;
        // A second caller joins the running query.
        let joined = conn
            .add_to_queue(request("a", 2, rt.unix_millis() + 100_000))
            .await?;
        assert!(!joined.added);

        assert!(
            conn.optimistic_query_update(
                &hash,
                QueryDefUpdate {
                    start_query_time: Some(42),
                    cancel_handler: None,
                },
                pid,
            )
            .await?
        );
        assert_eq!(
            conn.get_query_def(&hash).await?.unwrap().start_query_time,
            Some(42)
        );

        let stolen = conn
            .set_result_and_remove_query(&hash, QueueResult::Result(json!(1)), pid + 100)
            .await?;
        assert!(!stolen);
        assert!(
            conn.set_result_and_remove_query(&hash, QueueResult::Result(json!([{"n": 1}])), pid)
                .await?
        );
        assert!(conn.get_query_def(&hash).await?.is_none());
        assert!(conn.get_active_queries().await?.is_empty());
        let done = Some(QueueResult::Result(json!([{"n": 1}])));
        assert_eq!(conn.get_result(&hash).await?, done);
        // A caller arriving after the query finished joins it while the result
        // is still being read.
        let late = conn
            .add_to_queue(request("a", 3, rt.unix_millis() + 100_000))
            .await?;
        assert!(!late.added);
        assert!(conn.get_query_def(&hash).await?.is_none());
        assert_eq!(conn.get_result_blocking(&hash).await?, done);
        assert_eq!(conn.get_result_blocking(&hash).await?, done);

        // Every caller has read it: the next one computes it again.
        assert_eq!(conn.get_result(&hash).await?, None);
        assert!(
            conn.add_to_queue(request("a", 4, rt.unix_millis() + 100_000))
                .await?
                .added
        );
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_unread_result_expires(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let conn = driver.create_connection().await?;
        conn.add_to_queue(request("a", 1, rt.unix_millis() + 100_000))
            .await?;
        let hash = driver.redis_hash(&json!("a"));
        let pid = conn.get_next_processing_id().await?;
        conn.retrieve_for_processing(&hash, pid).await?;
        assert!(
            conn.set_result_and_remove_query(&hash, QueueResult::Result(json!(1)), pid)
                .await?
        );

        // The caller that enqueued it never comes back for it.
        rt.advance_time(Duration::from_secs(60)).await;
        let job = AddToQueueRequest {
            awaits_result: false,
            ..request("a", 2, rt.unix_millis() + 100_000)
        };
        assert!(!conn.add_to_queue(job.clone()).await?.added);

        rt.advance_time(Duration::from_secs(61)).await;
        assert_eq!(conn.get_result(&hash).await?, None);
        assert!(conn.add_to_queue(job).await?.added);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_blocking_wait(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let conn = driver.create_connection().await?;
        let hash = driver.redis_hash(&json!("a"));

        // Unknown queries don't block.
        assert_eq!(conn.get_result_blocking(&hash).await?, None);

        conn.add_to_queue(request("a", 1, rt.unix_millis() + 100_000))
            .await?;
        let start = rt.unix_millis();
        assert_eq!(conn.get_result_blocking(&hash).await?, None);
        assert_eq!(rt.unix_millis() - start, 5000);

        let writer = driver.create_connection().await?;
        let pid = writer.get_next_processing_id().await?;
        writer.retrieve_for_processing(&hash, pid).await?;
        let waiter = {
            let conn = conn.clone();
            let hash = hash.clone();
            async move { conn.get_result_blocking(&hash).await }
        };
        let setter = async {
            rt.wait(Duration::from_secs(1)).await;
            writer
                .set_result_and_remove_query(&hash, QueueResult::Result(json!("done")), pid)
                .await
        };
        let (result, stored) = futures::join!(waiter, setter);
        assert!(stored?);
        assert_eq!(result?, Some(QueueResult::Result(json!("done"))));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_orphaned_and_stalled(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let driver = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let conn = driver.create_connection().await?;
        let now = rt.unix_millis();
        conn.add_to_queue(request("orphan", 1, now + 10_000)).await?;
        conn.add_to_queue(request("running", 2, now + 1_000_000))
            .await?;
        let running = driver.redis_hash(&json!("running"));
        let pid = conn.get_next_processing_id().await?;
        conn.retrieve_for_processing(&running, pid).await?;

        rt.advance_time(Duration::from_secs(11)).await;
        let orphaned = conn.get_orphaned_queries().await?;
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].0.as_str(), "orphan");
        assert!(conn.get_stalled_queries().await?.is_empty());

        rt.advance_time(Duration::from_secs(120)).await;
        assert_eq!(conn.get_stalled_queries().await?[0].0, running);
        conn.update_heart_beat(&running).await?;
        assert!(conn.get_stalled_queries().await?.is_empty());

        let to_cancel = conn.get_queries_to_cancel().await?;
        assert_eq!(to_cancel.len(), 1);
        let def = conn.get_query_and_remove(&to_cancel[0].0).await?.unwrap();
        assert_eq!(def.query, json!({"sql": "orphan"}));
        assert!(conn.get_queries_to_cancel().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_prefixes_share_state(rt: TestRuntime) -> anyhow::Result<()> {
        let registry = LocalQueueStateRegistry::default();
        let a = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let b = LocalQueueDriver::new(rt.clone(), options(2), &registry);
        let mut other = options(2);
        other.prefix = "other".to_owned();
        let c = LocalQueueDriver::new(rt.clone(), other, &registry);

        a.create_connection()
            .await?
            .add_to_queue(request("q", 1, rt.unix_millis() + 1000))
            .await?;
        assert_eq!(b.create_connection().await?.get_to_process_queries().await?.len(), 1);
        assert!(c.create_connection().await?.get_to_process_queries().await?.is_empty());
        Ok(())
    }
}
