//! Queue data model and the persistence contract every queue backend
//! implements.
//!
//! A queue backend keeps, per key prefix:
//!
//! * the def of every queued query, keyed by [`QueryKeyHash`];
//! * four ordered sets: `to_process` (score = insertion time plus a priority
//!   offset), `active` (score = processing id), `heart_beat` (score = last
//!   heartbeat in ms) and `recent` (score = time at which the query becomes
//!   orphaned);
//! * a processing lock per hash and a monotonically increasing processing
//!   counter;
//! * the stored result of every finished query until a waiter picks it up.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use sha2::{
    Digest,
    Sha256,
};

use crate::cache::CacheDriver;

pub mod local;
pub mod query_queue;

pub use self::query_queue::QueryQueue;

/// Deterministically serializable identity of a queued computation.
pub type QueryKey = Value;

pub type ProcessingId = i64;
pub type QueueId = i64;

/// `(hash, queue id)` pairs as returned by the queue membership listings.
pub type QueryKeysTuple = (QueryKeyHash, Option<QueueId>);

/// Keys shorter than this are stored verbatim instead of being hashed.
const MAX_UNHASHED_KEY_LEN: usize = 256;

/// Stable, length-bounded digest of a [`QueryKey`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKeyHash(String);

impl QueryKeyHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Persistent keys carry the id of the process that owns them after an
    /// `@`. Only that process may pick them up.
    pub fn owner_process(&self) -> Option<&str> {
        self.0.split_once('@').map(|(_, uid)| uid)
    }
}

impl fmt::Display for QueryKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex SHA-256 of `value`'s JSON text, cut to 32 characters.
pub fn digest_hex(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(32);
    hex
}

pub fn is_persistent(query_key: &QueryKey) -> bool {
    query_key
        .get("persistent")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Hashes a query key the way every backend must, so that hashes computed by
/// different processes agree.
pub fn query_key_hash(query_key: &QueryKey, process_uid: &str) -> QueryKeyHash {
    let hash = match query_key {
        Value::String(s) if s.len() < MAX_UNHASHED_KEY_LEN => s.clone(),
        _ => digest_hex(query_key),
    };
    if is_persistent(query_key) {
        QueryKeyHash(format!("{hash}@{process_uid}"))
    } else {
        QueryKeyHash(hash)
    }
}

/// Selects the handler a queued query runs through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Query,
    Stream,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Query => "query",
            JobKind::Stream => "stream",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDef {
    pub query_handler: JobKind,
    pub query: Value,
    pub query_key: QueryKey,
    #[serde(default)]
    pub stage_query_key: Option<QueryKey>,
    pub priority: i64,
    #[serde(default)]
    pub request_id: Option<String>,
    pub added_to_queue_time: i64,
    #[serde(default)]
    pub queue_id: Option<QueueId>,
    #[serde(default)]
    pub start_query_time: Option<i64>,
    #[serde(default)]
    pub cancel_handler: Option<Value>,
}

impl QueryDef {
    pub fn apply(&mut self, update: &QueryDefUpdate) {
        if let Some(start_query_time) = update.start_query_time {
            self.start_query_time = Some(start_query_time);
        }
        if let Some(cancel_handler) = &update.cancel_handler {
            self.cancel_handler = Some(cancel_handler.clone());
        }
    }
}

/// Fields a running query may change on its def.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryDefUpdate {
    pub start_query_time: Option<i64>,
    pub cancel_handler: Option<Value>,
}

/// What a finished query leaves behind for its waiters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueResult {
    Result(Value),
    Error(ErrorMetadata),
    /// Stream jobs hand their rows to the waiter directly.
    StreamResult,
}

impl QueueResult {
    pub fn into_result(self) -> anyhow::Result<Option<Value>> {
        match self {
            QueueResult::Result(value) => Ok(Some(value)),
            QueueResult::Error(e) => Err(anyhow::Error::from(e)),
            QueueResult::StreamResult => Ok(None),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddToQueueRequest {
    pub key_score: i64,
    pub query_key: QueryKey,
    pub orphaned_time: i64,
    pub query_handler: JobKind,
    pub query: Value,
    pub priority: i64,
    pub queue_id: QueueId,
    pub stage_query_key: Option<QueryKey>,
    pub request_id: Option<String>,
    /// The caller will read the result, so it's kept until it has.
    pub awaits_result: bool,
}

impl AddToQueueRequest {
    pub fn into_query_def(self, added_to_queue_time: i64) -> QueryDef {
        QueryDef {
            query_handler: self.query_handler,
            query: self.query,
            query_key: self.query_key,
            stage_query_key: self.stage_query_key,
            priority: self.priority,
            request_id: self.request_id,
            added_to_queue_time,
            queue_id: Some(self.queue_id),
            start_query_time: None,
            cancel_handler: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddToQueueResponse {
    pub added: bool,
    pub queue_id: Option<QueueId>,
    pub queue_size: usize,
    pub added_to_queue_time: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrieveForProcessingResponse {
    pub added: bool,
    pub queue_id: Option<QueueId>,
    pub active_keys: Vec<QueryKeyHash>,
    pub queue_size: usize,
    pub query_def: Option<QueryDef>,
    pub lock_acquired: bool,
}

/// Snapshot used to compute the stage of a query: active hashes, to-process
/// hashes (both in dispatch order) and, unless only keys were requested, every
/// def in the queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryStageState {
    pub active: Vec<QueryKeyHash>,
    pub to_process: Vec<QueryKeyHash>,
    pub defs: std::collections::BTreeMap<QueryKeyHash, QueryDef>,
}

#[derive(Clone, Debug)]
pub struct QueueDriverOptions {
    pub prefix: String,
    pub concurrency: usize,
    pub continue_wait_timeout: Duration,
    pub orphaned_timeout: Duration,
    pub heart_beat_timeout: Duration,
    pub process_uid: String,
}

impl QueueDriverOptions {
    pub fn result_key(&self, hash: &QueryKeyHash) -> String {
        format!("{}_{}_RESULT", self.prefix, hash)
    }

    pub fn lock_key(&self, hash: &QueryKeyHash) -> String {
        format!("{}_{}_LOCK", self.prefix, hash)
    }

    /// Key of one of the queue-wide structures: `QUEUE`, `ACTIVE`, `RECENT`,
    /// `HEART_BEAT`, `QUERIES` or `PROCESSING_COUNTER`.
    pub fn queue_key(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    /// Upper bound on how long a finished result waits for callers that
    /// joined the query but stopped polling.
    pub fn result_ttl(&self) -> Duration {
        self.orphaned_timeout
    }
}

/// One session with a queue backend. Every method is atomic with respect to
/// other connections on the same prefix.
#[async_trait]
pub trait QueueDriverConnection: Send + Sync {
    /// Result of a finished query, if it is already available. A result stays
    /// until every caller that enqueued it with `awaits_result` has read it,
    /// or until [`QueueDriverOptions::result_ttl`] passes.
    async fn get_result(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueueResult>>;

    /// Waits up to the continue-wait timeout for a result. Returns `None`
    /// straight away if the hash is neither queued nor finished. Like
    /// [`Self::get_result`] this leaves the result for other waiters.
    async fn get_result_blocking(&self, hash: &QueryKeyHash)
        -> anyhow::Result<Option<QueueResult>>;

    /// Enqueues a query unless it is already queued or running, or it has a
    /// result that other callers are still reading. In all of those cases
    /// `added` is false and the caller joins the existing query.
    async fn add_to_queue(&self, request: AddToQueueRequest)
        -> anyhow::Result<AddToQueueResponse>;

    async fn get_to_process_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>>;

    async fn get_active_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>>;

    async fn get_orphaned_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>>;

    async fn get_stalled_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>>;

    async fn get_queries_to_cancel(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let mut stalled = self.get_stalled_queries().await?;
        stalled.extend(self.get_orphaned_queries().await?);
        Ok(stalled)
    }

    async fn get_active_and_to_process(
        &self,
    ) -> anyhow::Result<(Vec<QueryKeysTuple>, Vec<QueryKeysTuple>)>;

    async fn get_query_and_remove(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>>;

    async fn cancel_query(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>> {
        self.get_query_and_remove(hash).await
    }

    /// Compare-and-swap on the processing lock: stores `result`, wakes the
    /// waiters and removes every trace of the query, but only if `processing_id`
    /// still holds the lock.
    async fn set_result_and_remove_query(
        &self,
        hash: &QueryKeyHash,
        result: QueueResult,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool>;

    async fn get_next_processing_id(&self) -> anyhow::Result<ProcessingId>;

    async fn get_query_stage_state(&self, only_keys: bool) -> anyhow::Result<QueryStageState>;

    async fn get_query_def(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>>;

    async fn update_heart_beat(&self, hash: &QueryKeyHash) -> anyhow::Result<()>;

    /// Returns `None` if another processor holds the lock.
    async fn retrieve_for_processing(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
    ) -> anyhow::Result<Option<RetrieveForProcessingResponse>>;

    async fn free_processing_lock(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> anyhow::Result<()>;

    /// Merges `update` into the def if `processing_id` holds the lock.
    /// Backends that cannot read and write the def atomically swap it under
    /// [`retry`].
    async fn optimistic_query_update(
        &self,
        hash: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool>;

    async fn release(&self) {}
}

#[async_trait]
pub trait QueueDriver: Send + Sync {
    async fn create_connection(&self) -> anyhow::Result<Arc<dyn QueueDriverConnection>>;

    async fn release(&self, connection: Arc<dyn QueueDriverConnection>) {
        connection.release().await;
    }

    fn redis_hash(&self, query_key: &QueryKey) -> QueryKeyHash;
}

/// Backend selection for every queue and cache created by one orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CacheAndQueueDriver {
    /// Single-process state kept in memory.
    #[default]
    Memory,
    /// State shared between processes through a SQLite database file.
    Sqlite { path: String },
}

/// Produces the queue and cache backends of one orchestrator. Queues sharing a
/// prefix must observe the same state.
pub trait CacheAndQueueDriverFactory: Send + Sync {
    fn queue_driver(&self, options: QueueDriverOptions) -> anyhow::Result<Arc<dyn QueueDriver>>;

    fn cache_driver(&self) -> anyhow::Result<Arc<dyn CacheDriver>>;
}

/// Attempts of one optimistic def update before it fails as a conflict.
pub const OPTIMISTIC_UPDATE_ATTEMPTS: usize = 10;

/// Runs a compare-and-swap step until it stops conflicting. `f` returns
/// `Ok(None)` on a conflict.
pub async fn retry<T, F, Fut>(hash: &QueryKeyHash, attempts: usize, mut f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    for _ in 0..attempts {
        if let Some(result) = f().await? {
            return Ok(result);
        }
    }
    anyhow::bail!(ErrorMetadata::concurrent_update_conflict(format!(
        "Can't update {hash} with {attempts} attempts"
    )))
}

pub(crate) fn millis(duration: Duration) -> i64 {
    duration.as_millis().try_into().unwrap_or(i64::MAX)
}

/// Dispatch order: lowest score first, ties broken by hash.
pub(crate) fn sorted_by_score<I>(items: I) -> Vec<(QueryKeyHash, i64, Option<QueueId>)>
where
    I: IntoIterator<Item = (QueryKeyHash, i64, Option<QueueId>)>,
{
    let mut items: Vec<_> = items.into_iter().collect();
    items.sort_by(|(a_hash, a, _), (b_hash, b, _)| a.cmp(b).then_with(|| a_hash.cmp(b_hash)));
    items
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::{
        query_key_hash,
        retry,
        QueryKeyHash,
        QueueResult,
    };

    #[test]
    fn test_short_string_keys_pass_through() {
        assert_eq!(query_key_hash(&json!("select 1"), "uid").as_str(), "select 1");
    }

    #[test]
    fn test_composite_keys_are_hashed() {
        let key = json!(["SELECT * FROM orders WHERE id = ?", [1], []]);
        let hash = query_key_hash(&key, "uid");
        assert_eq!(hash.as_str().len(), 32);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, query_key_hash(&key, "other"));
        assert_ne!(hash, query_key_hash(&json!(["SELECT 2", [], []]), "uid"));

        let long = json!("x".repeat(300));
        assert_eq!(query_key_hash(&long, "uid").as_str().len(), 32);
    }

    #[test]
    fn test_persistent_keys_are_owned_by_process() {
        let key = json!({"query": "SELECT 1", "persistent": true});
        let hash = query_key_hash(&key, "process-a");
        assert_eq!(hash.owner_process(), Some("process-a"));
        assert!(hash.as_str().ends_with("@process-a"));
        assert_eq!(query_key_hash(&json!("a"), "p").owner_process(), None);
    }

    #[test]
    fn test_error_results_become_errors() {
        let err = QueueResult::Error(errors::ErrorMetadata::bad_request("Boom", "boom"))
            .into_result()
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.msg(), "boom");
    }

    #[orchestrator_macro::test_runtime]
    async fn test_retry_gives_up_with_conflict(_rt: TestRuntime) -> anyhow::Result<()> {
        let hash = QueryKeyHash::new("h");
        let mut attempts = 0;
        let err = retry(&hash, 10, || {
            attempts += 1;
            async { Ok::<Option<()>, anyhow::Error>(None) }
        })
        .await
        .unwrap_err();
        assert_eq!(attempts, 10);
        assert!(err.is_concurrent_update_conflict());
        assert_eq!(err.msg(), "Can't update h with 10 attempts");

        let mut calls = 0;
        let value = retry(&hash, 10, || {
            calls += 1;
            let done = calls == 3;
            async move { Ok(done.then_some(calls)) }
        })
        .await?;
        assert_eq!(value, 3);
        Ok(())
    }
}
