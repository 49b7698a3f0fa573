//! Priority queue with at-most-once execution per query key, built on top of a
//! [`QueueDriver`]. Any number of processes may share one backend: a query is
//! enqueued once no matter how many callers ask for it, one process claims it
//! through the processing lock, and every waiter receives the stored result.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicI64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    knobs::{
        QUEUE_CONCURRENCY,
        QUEUE_CONTINUE_WAIT_TIMEOUT,
        QUEUE_EXECUTION_TIMEOUT,
        QUEUE_HEART_BEAT_INTERVAL,
        QUEUE_ORPHANED_TIMEOUT,
    },
    runtime::{
        Runtime,
        WithTimeout,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::{
    future::{
        BoxFuture,
        Shared,
    },
    pin_mut,
    select_biased,
    stream::BoxStream,
    Future,
    FutureExt,
    StreamExt,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{
    mpsc,
    oneshot,
};

use super::{
    millis,
    AddToQueueRequest,
    CacheAndQueueDriverFactory,
    JobKind,
    ProcessingId,
    QueryDef,
    QueryDefUpdate,
    QueryKey,
    QueryKeyHash,
    QueryStageState,
    QueueDriver,
    QueueDriverConnection,
    QueueDriverOptions,
    QueueResult,
};
use crate::metrics::{
    log_queue_added,
    log_queue_orphaned,
    log_queue_orphaned_result,
    log_queue_skipped,
    log_queue_stalled,
    log_queue_state,
    log_queue_wait,
    queue_execute_timer,
};

pub const MIN_PRIORITY: i64 = -10000;
pub const MAX_PRIORITY: i64 = 10000;

/// Rows buffered between a stream job and its consumer before the job has to
/// wait.
const STREAM_BUFFER_ROWS: usize = 1024;

#[derive(Clone, Debug)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub continue_wait_timeout: Duration,
    pub execution_timeout: Duration,
    pub orphaned_timeout: Duration,
    pub heart_beat_interval: Duration,
    /// Run handlers inline instead of going through the backend.
    pub skip_queue: bool,
    /// Owner id of persistent keys. A random id is generated when unset.
    pub process_uid: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: *QUEUE_CONCURRENCY,
            continue_wait_timeout: *QUEUE_CONTINUE_WAIT_TIMEOUT,
            execution_timeout: *QUEUE_EXECUTION_TIMEOUT,
            orphaned_timeout: *QUEUE_ORPHANED_TIMEOUT,
            heart_beat_interval: *QUEUE_HEART_BEAT_INTERVAL,
            skip_queue: false,
            process_uid: None,
        }
    }
}

/// Per-call overrides of [`QueryQueue::execute_in_queue`].
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub stage_query_key: Option<QueryKey>,
    pub request_id: Option<String>,
    /// Enqueue even if a result is stored. A no-op if the key is already
    /// queued.
    pub force_build: bool,
    /// Enqueue and return without waiting for the result.
    pub is_job: bool,
    pub orphaned_timeout: Option<Duration>,
}

/// Receiving end of a stream job.
pub type QueryStream = BoxStream<'static, anyhow::Result<Value>>;

/// Sending end of a stream job, handed to the [`JobHandler`].
#[derive(Clone)]
pub struct StreamSink {
    sender: mpsc::Sender<Result<Value, ErrorMetadata>>,
}

impl StreamSink {
    /// Waits while the consumer is behind. Fails once it has gone away.
    pub async fn send(&self, row: Value) -> anyhow::Result<()> {
        self.sender
            .send(Ok(row))
            .await
            .map_err(|_| anyhow::anyhow!("Stream consumer has gone away"))
    }

    async fn fail(&self, error: ErrorMetadata) {
        // The consumer may be gone already, in which case nobody cares.
        let _ = self.sender.send(Err(error)).await;
    }
}

enum CancelRegistration {
    Queue {
        connection: Arc<dyn QueueDriverConnection>,
        hash: QueryKeyHash,
        processing_id: ProcessingId,
    },
    Inline(Arc<Mutex<Option<Value>>>),
}

/// What a running job can reach of the queue.
pub struct JobContext {
    registration: CancelRegistration,
    sink: Option<StreamSink>,
}

impl JobContext {
    /// Stores the token `JobHandler::cancel` needs to stop this job. It goes
    /// into the def, so any process can cancel the job.
    pub async fn set_cancel_handler(&self, cancel_handler: Value) {
        match &self.registration {
            CancelRegistration::Queue {
                connection,
                hash,
                processing_id,
            } => {
                let update = QueryDefUpdate {
                    cancel_handler: Some(cancel_handler),
                    ..Default::default()
                };
                if let Err(e) = connection
                    .optimistic_query_update(hash, update, *processing_id)
                    .await
                {
                    tracing::error!("Error while query update of {hash}: {e:#}");
                }
            },
            CancelRegistration::Inline(slot) => *slot.lock() = Some(cancel_handler),
        }
    }

    /// Present for [`JobKind::Stream`] jobs only.
    pub fn sink(&self) -> Option<&StreamSink> {
        self.sink.as_ref()
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, query: Value, context: JobContext) -> anyhow::Result<Value>;

    /// Stops a job that was removed from the queue. `query.cancel_handler`
    /// holds whatever the job registered, if anything.
    async fn cancel(&self, query: &QueryDef) -> anyhow::Result<()>;
}

/// Progress of a queued query as shown to polling clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStage {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueStatus {
    Orphaned,
    Stalled,
    Active,
    ToProcess,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedQuery {
    pub query_key_hash: QueryKeyHash,
    pub def: Option<QueryDef>,
    pub status: Vec<QueueStatus>,
}

type ReconcileRun = Shared<BoxFuture<'static, Result<(), ErrorMetadata>>>;

#[derive(Default)]
struct ReconcileState {
    in_flight: Option<ReconcileRun>,
    again: bool,
}

struct QueueInner<RT: Runtime> {
    rt: RT,
    prefix: String,
    options: QueueOptions,
    process_uid: String,
    handlers: BTreeMap<JobKind, Arc<dyn JobHandler>>,
    driver: Arc<dyn QueueDriver>,
    next_queue_id: AtomicI64,
    reconcile: Mutex<ReconcileState>,
    streams: Mutex<BTreeMap<QueryKeyHash, StreamSink>>,
}

#[derive(Clone)]
pub struct QueryQueue<RT: Runtime> {
    inner: Arc<QueueInner<RT>>,
}

impl<RT: Runtime> QueryQueue<RT> {
    pub fn new(
        rt: RT,
        prefix: impl Into<String>,
        options: QueueOptions,
        handlers: BTreeMap<JobKind, Arc<dyn JobHandler>>,
        factory: &dyn CacheAndQueueDriverFactory,
    ) -> anyhow::Result<Self> {
        let prefix = prefix.into();
        let process_uid = options
            .process_uid
            .clone()
            .unwrap_or_else(|| rt.new_uuid_v4().to_string());
        let driver = factory.queue_driver(QueueDriverOptions {
            prefix: prefix.clone(),
            concurrency: options.concurrency,
            continue_wait_timeout: options.continue_wait_timeout,
            orphaned_timeout: options.orphaned_timeout,
            heart_beat_timeout: options.heart_beat_interval * 4,
            process_uid: process_uid.clone(),
        })?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                rt,
                prefix,
                options,
                process_uid,
                handlers,
                driver,
                next_queue_id: AtomicI64::new(0),
                reconcile: Mutex::new(ReconcileState::default()),
                streams: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn concurrency(&self) -> usize {
        self.inner.options.concurrency
    }

    pub fn redis_hash(&self, query_key: &QueryKey) -> QueryKeyHash {
        self.inner.driver.redis_hash(query_key)
    }

    /// Enqueues `query` under `query_key` unless it is already queued and
    /// waits for its result. `Ok(None)` is returned for jobs and for forced
    /// builds that were already queued. Raises ContinueWait if the result
    /// isn't ready within the continue-wait timeout.
    pub async fn execute_in_queue(
        &self,
        kind: JobKind,
        query_key: QueryKey,
        query: Value,
        priority: Option<i64>,
        options: ExecuteOptions,
    ) -> anyhow::Result<Option<Value>> {
        if kind == JobKind::Stream {
            anyhow::bail!(ErrorMetadata::bad_request(
                "StreamJobNotAllowed",
                "Stream jobs are started with execute_stream_in_queue"
            ));
        }
        if self.inner.options.skip_queue {
            return self
                .inner
                .process_query_skip_queue(kind, query_key, query, options.request_id)
                .await
                .map(Some);
        }
        self.inner
            .execute_in_queue(kind, query_key, query, priority, options)
            .await
    }

    /// Starts a stream job owned by this process and returns its rows as they
    /// are produced.
    pub async fn execute_stream_in_queue(
        &self,
        query_key: QueryKey,
        query: Value,
        priority: Option<i64>,
        request_id: Option<String>,
    ) -> anyhow::Result<QueryStream> {
        let query_key = persistent_key(query_key);
        let hash = self.redis_hash(&query_key);
        let (sender, mut receiver) = mpsc::channel(STREAM_BUFFER_ROWS);
        {
            let mut streams = self.inner.streams.lock();
            if streams.contains_key(&hash) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "StreamAlreadyConsumed",
                    format!("Stream {hash} already has a consumer")
                ));
            }
            streams.insert(hash.clone(), StreamSink { sender });
        }
        let options = ExecuteOptions {
            request_id,
            is_job: true,
            ..Default::default()
        };
        if let Err(e) = self
            .inner
            .execute_in_queue(JobKind::Stream, query_key, query, priority, options)
            .await
        {
            self.inner.streams.lock().remove(&hash);
            return Err(e);
        }
        let rows = futures::stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(|row| row.map_err(anyhow::Error::from));
        Ok(rows.boxed())
    }

    /// Cancels stalled and orphaned queries and dispatches queued ones.
    /// Concurrent calls share one run.
    pub async fn reconcile_queue(&self) -> anyhow::Result<()> {
        self.inner.reconcile_queue().await
    }

    /// Every query known to the backend with the states it is in.
    pub async fn get_queries(&self) -> anyhow::Result<Vec<QueuedQuery>> {
        let connection = self.inner.driver.create_connection().await?;
        let result = get_queries(connection.as_ref()).await;
        self.inner.driver.release(connection).await;
        result
    }

    /// Removes the query from the queue and stops it if it is running.
    /// Returns whether the query existed.
    pub async fn cancel_query(&self, hash: &QueryKeyHash) -> anyhow::Result<bool> {
        let connection = self.inner.driver.create_connection().await?;
        let query = connection.cancel_query(hash).await;
        self.inner.driver.release(connection).await;
        let Some(query) = query? else {
            return Ok(false);
        };
        tracing::info!(
            "Cancelling query manual {} {hash} request_id={:?}",
            self.inner.prefix,
            query.request_id
        );
        self.inner.process_cancel(hash, &query).await;
        Ok(true)
    }

    pub async fn fetch_query_stage_state(&self) -> anyhow::Result<QueryStageState> {
        let connection = self.inner.driver.create_connection().await?;
        let result = connection.get_query_stage_state(false).await;
        self.inner.driver.release(connection).await;
        result
    }

    /// Stage of the first queued query whose stage key is `stage_query_key`,
    /// optionally restricted to one priority. `state` lets several lookups
    /// share one snapshot.
    pub async fn get_query_stage(
        &self,
        stage_query_key: &QueryKey,
        priority_filter: Option<i64>,
        state: Option<&QueryStageState>,
    ) -> anyhow::Result<Option<QueryStage>> {
        let fetched;
        let state = match state {
            Some(state) => state,
            None => {
                fetched = self.fetch_query_stage_state().await?;
                &fetched
            },
        };
        let stage_hash = self.redis_hash(stage_query_key);
        let matches_priority =
            |def: &QueryDef| priority_filter.is_none_or(|priority| def.priority == priority);
        let Some(query) = state.defs.values().find(|def| {
            def.stage_query_key
                .as_ref()
                .is_some_and(|key| self.redis_hash(key) == stage_hash)
                && matches_priority(def)
        }) else {
            return Ok(None);
        };
        let query_hash = self.redis_hash(&query.query_key);
        if state.active.contains(&query_hash) {
            let now = self.inner.rt.unix_millis();
            return Ok(Some(QueryStage {
                stage: "Executing query".to_owned(),
                time_elapsed: query.start_query_time.map(|start| now - start),
            }));
        }
        let position = state
            .to_process
            .iter()
            .filter(|hash| state.defs.get(*hash).is_some_and(matches_priority))
            .position(|hash| *hash == query_hash);
        Ok(position.map(|index| QueryStage {
            stage: format!("#{} in queue", index + 1),
            time_elapsed: None,
        }))
    }

    /// Waits for the in-flight reconciliation and drops open streams. Returns
    /// whether a reconciliation was running.
    pub async fn shutdown(&self) -> anyhow::Result<bool> {
        let in_flight = self.inner.reconcile.lock().in_flight.clone();
        self.inner.streams.lock().clear();
        match in_flight {
            Some(run) => {
                run.await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

fn persistent_key(query_key: QueryKey) -> QueryKey {
    match query_key {
        Value::Object(mut key) => {
            key.insert("persistent".to_owned(), Value::Bool(true));
            Value::Object(key)
        },
        key => serde_json::json!({ "key": key, "persistent": true }),
    }
}

async fn get_queries(connection: &dyn QueueDriverConnection) -> anyhow::Result<Vec<QueuedQuery>> {
    let listings = [
        (QueueStatus::Orphaned, connection.get_orphaned_queries().await?),
        (QueueStatus::Stalled, connection.get_stalled_queries().await?),
        (QueueStatus::Active, connection.get_active_queries().await?),
        (QueueStatus::ToProcess, connection.get_to_process_queries().await?),
    ];
    let mut queries: BTreeMap<QueryKeyHash, QueuedQuery> = BTreeMap::new();
    for (status, hashes) in listings {
        for (hash, _) in hashes {
            if let Some(query) = queries.get_mut(&hash) {
                query.status.push(status);
                continue;
            }
            let def = connection.get_query_def(&hash).await?;
            queries.insert(
                hash.clone(),
                QueuedQuery {
                    query_key_hash: hash,
                    def,
                    status: vec![status],
                },
            );
        }
    }
    Ok(queries.into_values().collect())
}

impl<RT: Runtime> QueueInner<RT> {
    fn handler(&self, kind: JobKind) -> anyhow::Result<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::bad_request(
                "MissingQueueHandler",
                format!("No {} handler is registered in {}", kind.as_str(), self.prefix)
            ))
        })
    }

    async fn execute_in_queue(
        self: &Arc<Self>,
        kind: JobKind,
        query_key: QueryKey,
        query: Value,
        priority: Option<i64>,
        options: ExecuteOptions,
    ) -> anyhow::Result<Option<Value>> {
        let priority = priority.unwrap_or(0);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidQueuePriority",
                format!("Priority should be between {MIN_PRIORITY} and {MAX_PRIORITY}")
            ));
        }
        let connection = self.driver.create_connection().await?;
        let result = self
            .enqueue_and_wait(&connection, kind, query_key, query, priority, options)
            .await;
        self.driver.release(connection).await;
        result
    }

    async fn enqueue_and_wait(
        self: &Arc<Self>,
        connection: &Arc<dyn QueueDriverConnection>,
        kind: JobKind,
        query_key: QueryKey,
        query: Value,
        priority: i64,
        options: ExecuteOptions,
    ) -> anyhow::Result<Option<Value>> {
        let hash = self.driver.redis_hash(&query_key);
        if !options.force_build {
            match connection.get_result(&hash).await? {
                Some(QueueResult::StreamResult) | None => {},
                Some(result) => return result.into_result(),
            }
        } else if connection.get_query_def(&hash).await?.is_some() {
            return Ok(None);
        }

        let time = self.rt.unix_millis();
        let orphaned_timeout = options
            .orphaned_timeout
            .unwrap_or(self.options.orphaned_timeout);
        let request_id = options.request_id.clone();
        let response = connection
            .add_to_queue(AddToQueueRequest {
                key_score: time + (MAX_PRIORITY - priority) * 100_000_000_000_000,
                query_key,
                orphaned_time: time + millis(orphaned_timeout),
                query_handler: kind,
                query,
                priority,
                queue_id: self.next_queue_id.fetch_add(1, Ordering::SeqCst) + 1,
                stage_query_key: options.stage_query_key,
                request_id: options.request_id,
                awaits_result: !options.is_job,
            })
            .await?;
        if response.added {
            log_queue_added();
            tracing::info!(
                "Added to queue {} {hash} request_id={request_id:?} priority={priority} \
                 queue_size={}",
                self.prefix,
                response.queue_size
            );
        }

        self.reconcile_queue().await?;

        if options.is_job {
            return Ok(None);
        }
        tracing::debug!(
            "Waiting for query {} {hash} request_id={request_id:?}",
            self.prefix
        );
        if let Some(result) = connection.get_result_blocking(&hash).await? {
            return result.into_result();
        }
        // The query may have finished between enqueueing and subscribing.
        match connection.get_result(&hash).await? {
            Some(result) => result.into_result(),
            None => anyhow::bail!(ErrorMetadata::continue_wait()),
        }
    }

    fn reconcile_queue(self: &Arc<Self>) -> BoxFuture<'static, anyhow::Result<()>> {
        let run = {
            let mut state = self.reconcile.lock();
            match state.in_flight.clone() {
                Some(run) => {
                    state.again = true;
                    run
                },
                None => {
                    state.again = false;
                    let (sender, receiver) = oneshot::channel();
                    let inner = self.clone();
                    // The run continues even if the caller that started it goes away.
                    let _handle = self.rt.spawn("reconcile_queue", async move {
                        let _ = sender.send(inner.reconcile_until_settled().await);
                    });
                    let run: ReconcileRun = receiver
                        .map(|result| {
                            result.unwrap_or_else(|_| {
                                Err(ErrorMetadata::operational_internal_server_error())
                            })
                        })
                        .boxed()
                        .shared();
                    state.in_flight = Some(run.clone());
                    run
                },
            }
        };
        async move { run.await.map_err(anyhow::Error::from) }.boxed()
    }

    async fn reconcile_until_settled(self: Arc<Self>) -> Result<(), ErrorMetadata> {
        loop {
            let result = self.reconcile_queue_impl().await;
            let mut state = self.reconcile.lock();
            if let Err(e) = result {
                state.in_flight = None;
                tracing::error!("Queue storage error in {}: {e:#}", self.prefix);
                return Err(e.error_metadata());
            }
            if !state.again {
                state.in_flight = None;
                return Ok(());
            }
            state.again = false;
        }
    }

    async fn reconcile_queue_impl(self: &Arc<Self>) -> anyhow::Result<()> {
        let connection = self.driver.create_connection().await?;
        let result = self.reconcile_with_connection(connection.as_ref()).await;
        self.driver.release(connection).await;
        result
    }

    async fn reconcile_with_connection(
        self: &Arc<Self>,
        connection: &dyn QueueDriverConnection,
    ) -> anyhow::Result<()> {
        let stalled = connection.get_stalled_queries().await?;
        let orphaned = connection.get_orphaned_queries().await?;
        let to_cancel = stalled
            .into_iter()
            .map(|(hash, _)| (hash, true))
            .chain(orphaned.into_iter().map(|(hash, _)| (hash, false)));
        for (hash, is_stalled) in to_cancel {
            let Some(query) = connection.get_query_and_remove(&hash).await? else {
                continue;
            };
            if is_stalled {
                log_queue_stalled();
            } else {
                log_queue_orphaned();
            }
            tracing::info!(
                "Removing orphaned query {} {hash} request_id={:?} stalled={is_stalled}",
                self.prefix,
                query.request_id
            );
            self.process_cancel(&hash, &query).await;
        }

        let (active, to_process) = connection.get_active_and_to_process().await?;
        let dispatch: Vec<QueryKeyHash> = to_process
            .into_iter()
            .map(|(hash, _)| hash)
            .filter(|hash| !active.iter().any(|(active_hash, _)| active_hash == hash))
            .filter(|hash| {
                hash.owner_process()
                    .is_none_or(|owner| owner == self.process_uid)
            })
            .take(self.options.concurrency)
            .collect();
        for hash in dispatch {
            let _handle = self
                .rt
                .spawn("process_query", self.clone().process_query(hash));
        }
        Ok(())
    }

    fn process_query(self: Arc<Self>, hash: QueryKeyHash) -> BoxFuture<'static, ()> {
        async move {
            let result = async {
                let connection = self.driver.create_connection().await?;
                let result = self.process_with_connection(&connection, &hash).await;
                self.driver.release(connection).await;
                result
            }
            .await;
            if let Err(e) = result {
                tracing::error!("Queue storage error in {} {hash}: {e:#}", self.prefix);
            }
        }
        .boxed()
    }

    async fn process_with_connection(
        self: &Arc<Self>,
        connection: &Arc<dyn QueueDriverConnection>,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<()> {
        let processing_id = connection.get_next_processing_id().await?;
        let retrieved = connection
            .retrieve_for_processing(hash, processing_id)
            .await?;
        let (added, activated, lock_acquired, query) = match retrieved {
            Some(retrieved) => {
                log_queue_state(retrieved.queue_size, retrieved.active_keys.len());
                let query = match retrieved.query_def {
                    Some(query) => Some(query),
                    None => connection.get_query_def(hash).await?,
                };
                (
                    retrieved.added,
                    retrieved.active_keys.contains(hash),
                    retrieved.lock_acquired,
                    query,
                )
            },
            None => (false, false, false, None),
        };

        match query {
            Some(query) if added && activated && lock_acquired => {
                self.run_query(connection, hash, query, processing_id)
                    .await?;
                self.reconcile_queue().await
            },
            _ => {
                log_queue_skipped();
                tracing::debug!(
                    "Skip processing {} {hash} processing_id={processing_id} added={added} \
                     activated={activated} lock_acquired={lock_acquired}",
                    self.prefix
                );
                connection
                    .free_processing_lock(hash, processing_id, activated)
                    .await
            },
        }
    }

    async fn run_query(
        self: &Arc<Self>,
        connection: &Arc<dyn QueueDriverConnection>,
        hash: &QueryKeyHash,
        query: QueryDef,
        processing_id: ProcessingId,
    ) -> anyhow::Result<()> {
        let start_query_time = self.rt.unix_millis();
        let time_in_queue = start_query_time - query.added_to_queue_time;
        log_queue_wait(time_in_queue);
        tracing::info!(
            "Performing query {} {hash} processing_id={processing_id} request_id={:?} \
             time_in_queue={time_in_queue}",
            self.prefix,
            query.request_id
        );
        connection
            .optimistic_query_update(
                hash,
                QueryDefUpdate {
                    start_query_time: Some(start_query_time),
                    ..Default::default()
                },
                processing_id,
            )
            .await?;

        let sink = match query.query_handler {
            JobKind::Query => None,
            JobKind::Stream => self.streams.lock().get(hash).cloned(),
        };
        let context = JobContext {
            registration: CancelRegistration::Queue {
                connection: connection.clone(),
                hash: hash.clone(),
                processing_id,
            },
            sink: sink.clone(),
        };
        let timer = queue_execute_timer();
        let execution = async {
            let handler = self.handler(query.query_handler)?;
            match query.query_handler {
                JobKind::Query => {
                    self.rt
                        .with_timeout(
                            "Query execution",
                            self.options.execution_timeout,
                            handler.execute(query.query.clone(), context),
                        )
                        .await
                },
                JobKind::Stream => handler.execute(query.query.clone(), context).await,
            }
        };
        let result = self
            .with_heart_beat(connection.as_ref(), hash, execution)
            .await;
        let duration = self.rt.unix_millis() - start_query_time;

        let result = match result {
            Ok(value) => {
                timer.finish();
                tracing::info!(
                    "Performing query completed {} {hash} processing_id={processing_id} \
                     request_id={:?} duration={duration}",
                    self.prefix,
                    query.request_id
                );
                match query.query_handler {
                    JobKind::Query => QueueResult::Result(value),
                    JobKind::Stream => QueueResult::StreamResult,
                }
            },
            Err(e) => {
                timer.finish_with(e.metric_status_tag_value());
                if e.should_log_as_error() {
                    tracing::error!(
                        "Error while querying {} {hash} request_id={:?} duration={duration}: \
                         {e:#}",
                        self.prefix,
                        query.request_id
                    );
                } else {
                    tracing::warn!(
                        "Error while querying {} {hash} request_id={:?} duration={duration}: \
                         {e:#}",
                        self.prefix,
                        query.request_id
                    );
                }
                if let Some(sink) = &sink {
                    sink.fail(e.error_metadata()).await;
                }
                if e.is_timeout() {
                    if let Some(query) = connection.get_query_def(hash).await? {
                        tracing::info!(
                            "Cancelling query due to timeout {} {hash} request_id={:?}",
                            self.prefix,
                            query.request_id
                        );
                        self.process_cancel(hash, &query).await;
                    }
                }
                QueueResult::Error(e.error_metadata())
            },
        };
        if query.query_handler == JobKind::Stream {
            self.streams.lock().remove(hash);
        }

        if !connection
            .set_result_and_remove_query(hash, result, processing_id)
            .await?
        {
            log_queue_orphaned_result();
            tracing::warn!(
                "Orphaned execution result {} {hash} processing_id={processing_id} \
                 request_id={:?}",
                self.prefix,
                query.request_id
            );
        }
        Ok(())
    }

    /// Drives `execution` while refreshing the heartbeat of `hash` every
    /// interval.
    async fn with_heart_beat(
        &self,
        connection: &dyn QueueDriverConnection,
        hash: &QueryKeyHash,
        execution: impl Future<Output = anyhow::Result<Value>>,
    ) -> anyhow::Result<Value> {
        let execution = execution.fuse();
        pin_mut!(execution);
        loop {
            select_biased! {
                result = execution => return result,
                _ = self.rt.wait(self.options.heart_beat_interval) => {
                    if let Err(e) = connection.update_heart_beat(hash).await {
                        tracing::error!("Queue storage error in {} {hash}: {e:#}", self.prefix);
                    }
                },
            }
        }
    }

    async fn process_query_skip_queue(
        &self,
        kind: JobKind,
        query_key: QueryKey,
        query: Value,
        request_id: Option<String>,
    ) -> anyhow::Result<Value> {
        let handler = self.handler(kind)?;
        let start_query_time = self.rt.unix_millis();
        tracing::info!(
            "Performing query {} request_id={request_id:?} time_in_queue=0",
            self.prefix
        );
        let cancel_handler = Arc::new(Mutex::new(None));
        let context = JobContext {
            registration: CancelRegistration::Inline(cancel_handler.clone()),
            sink: None,
        };
        let result = self
            .rt
            .with_timeout(
                "Query execution",
                self.options.execution_timeout,
                handler.execute(query.clone(), context),
            )
            .await;
        let duration = self.rt.unix_millis() - start_query_time;
        match &result {
            Ok(_) => tracing::info!(
                "Performing query completed {} request_id={request_id:?} duration={duration}",
                self.prefix
            ),
            Err(e) => {
                tracing::warn!(
                    "Error while querying {} request_id={request_id:?} duration={duration}: \
                     {e:#}",
                    self.prefix
                );
                let cancel_handler = cancel_handler.lock().take();
                if e.is_timeout() && cancel_handler.is_some() {
                    tracing::info!(
                        "Cancelling query due to timeout {} request_id={request_id:?}",
                        self.prefix
                    );
                    let hash = self.driver.redis_hash(&query_key);
                    let query = QueryDef {
                        query_handler: kind,
                        query,
                        query_key,
                        stage_query_key: None,
                        priority: 0,
                        request_id,
                        added_to_queue_time: start_query_time,
                        queue_id: None,
                        start_query_time: Some(start_query_time),
                        cancel_handler,
                    };
                    self.process_cancel(&hash, &query).await;
                }
            },
        }
        result
    }

    /// Runs the cancel handler of a removed query. Failures are only logged:
    /// the query is gone from the queue either way.
    async fn process_cancel(&self, hash: &QueryKeyHash, query: &QueryDef) {
        if query.query_handler == JobKind::Stream {
            // Closes the consumer's end.
            self.streams.lock().remove(hash);
        }
        let Some(handler) = self.handlers.get(&query.query_handler) else {
            tracing::warn!(
                "No cancel handler for {} in {}",
                query.query_handler.as_str(),
                self.prefix
            );
            return;
        };
        if let Err(e) = handler.cancel(query).await {
            tracing::error!(
                "Error while cancel {} {hash} request_id={:?}: {e:#}",
                self.prefix,
                query.request_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use common::runtime::Runtime;
    use errors::ErrorMetadataAnyhowExt;
    use futures::{
        future::join_all,
        StreamExt,
    };
    use maplit::btreemap;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::{
        json,
        Value,
    };

    use super::{
        ExecuteOptions,
        JobContext,
        JobHandler,
        QueryQueue,
        QueryStage,
        QueueOptions,
        QueueStatus,
    };
    use crate::queue::{
        local::LocalDriverFactory,
        AddToQueueRequest,
        CacheAndQueueDriverFactory,
        JobKind,
        QueryDef,
        QueueDriverOptions,
    };

    #[derive(Default)]
    struct Recorded {
        executed: Vec<Value>,
        canceled: Vec<QueryDef>,
    }

    /// Echoes `query["result"]` after sleeping `query["sleep_ms"]`, or fails
    /// with `query["error"]`.
    #[derive(Default)]
    struct EchoHandler {
        recorded: Mutex<Recorded>,
    }

    impl EchoHandler {
        fn executed(&self) -> Vec<Value> {
            self.recorded.lock().executed.clone()
        }

        fn canceled(&self) -> Vec<QueryDef> {
            self.recorded.lock().canceled.clone()
        }
    }

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn execute(&self, query: Value, context: JobContext) -> anyhow::Result<Value> {
            self.recorded.lock().executed.push(query.clone());
            context.set_cancel_handler(json!({"cancel": query["name"]})).await;
            if let Some(sleep_ms) = query["sleep_ms"].as_u64() {
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            if let Some(sink) = context.sink() {
                for row in query["rows"].as_array().cloned().unwrap_or_default() {
                    sink.send(row).await?;
                }
            }
            if let Some(error) = query["error"].as_str() {
                anyhow::bail!("{error}");
            }
            Ok(query["result"].clone())
        }

        async fn cancel(&self, query: &QueryDef) -> anyhow::Result<()> {
            self.recorded.lock().canceled.push(query.clone());
            Ok(())
        }
    }

    fn new_queue(
        rt: &TestRuntime,
        factory: &LocalDriverFactory<TestRuntime>,
        options: QueueOptions,
    ) -> anyhow::Result<(QueryQueue<TestRuntime>, Arc<EchoHandler>)> {
        let handler = Arc::new(EchoHandler::default());
        let handlers: BTreeMap<JobKind, Arc<dyn JobHandler>> = btreemap! {
            JobKind::Query => handler.clone() as Arc<dyn JobHandler>,
            JobKind::Stream => handler.clone() as Arc<dyn JobHandler>,
        };
        let queue = QueryQueue::new(rt.clone(), "SQL_QUERY_test", options, handlers, factory)?;
        Ok((queue, handler))
    }

    fn test_options(concurrency: usize) -> QueueOptions {
        QueueOptions {
            concurrency,
            continue_wait_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(600),
            orphaned_timeout: Duration::from_secs(120),
            heart_beat_interval: Duration::from_secs(30),
            skip_queue: false,
            process_uid: Some("process-a".to_owned()),
        }
    }

    #[orchestrator_macro::test_runtime]
    async fn test_concurrent_callers_share_one_execution(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(2))?;
        // The handler finishes right away, before most callers start waiting.
        let query = json!({"name": "q", "result": [{"n": 1}]});
        let calls = (0..5).map(|_| {
            queue.execute_in_queue(
                JobKind::Query,
                json!(["SELECT 1", []]),
                query.clone(),
                Some(0),
                ExecuteOptions::default(),
            )
        });
        let results = join_all(calls).await;
        for result in results {
            assert_eq!(result?, Some(json!([{"n": 1}])));
        }
        assert_eq!(handler.executed().len(), 1);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_result_is_dropped_once_every_caller_read_it(
        rt: TestRuntime,
    ) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(2))?;
        let query = json!({"name": "q", "result": 1});
        let execute = || {
            queue.execute_in_queue(
                JobKind::Query,
                json!("q"),
                query.clone(),
                None,
                ExecuteOptions::default(),
            )
        };
        let (first, second) = futures::join!(execute(), execute());
        assert_eq!(first?, Some(json!(1)));
        assert_eq!(second?, Some(json!(1)));
        assert_eq!(handler.executed().len(), 1);

        // Both callers read it, so a new request runs the query again.
        assert_eq!(execute().await?, Some(json!(1)));
        assert_eq!(handler.executed().len(), 2);
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_higher_priority_runs_first(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;

        // Occupies the only slot so the others pile up in the queue.
        let blocker = json!({"name": "blocker", "sleep_ms": 1000, "result": 0});
        let job = ExecuteOptions {
            is_job: true,
            ..Default::default()
        };
        queue
            .execute_in_queue(JobKind::Query, json!("blocker"), blocker, Some(0), job.clone())
            .await?;
        for (name, priority) in [("low", -10), ("mid", 0), ("high", 10)] {
            queue
                .execute_in_queue(
                    JobKind::Query,
                    json!(name),
                    json!({"name": name, "result": name}),
                    Some(priority),
                    job.clone(),
                )
                .await?;
        }

        // Sleeping lets every spawned task run before the clock moves on.
        rt.wait(Duration::from_secs(5)).await;
        let order: Vec<Value> = handler
            .executed()
            .into_iter()
            .map(|query| query["name"].clone())
            .collect();
        assert_eq!(order, vec![json!("blocker"), json!("high"), json!("mid"), json!("low")]);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_add_then_readd_then_consume(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;
        let query = json!({"name": "q1", "sleep_ms": 10_000, "result": "done"});

        // The first waiter gives up before the query is done.
        let err = queue
            .execute_in_queue(
                JobKind::Query,
                json!("q1"),
                query.clone(),
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_continue_wait());
        assert!(!err.should_log_as_error());

        // Re-adding joins the running query instead of enqueueing it again.
        rt.wait(Duration::from_secs(1)).await;
        let result = queue
            .execute_in_queue(
                JobKind::Query,
                json!("q1"),
                query,
                None,
                ExecuteOptions::default(),
            )
            .await?;
        assert_eq!(result, Some(json!("done")));
        assert_eq!(handler.executed().len(), 1);
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_errors_reach_waiters(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, _handler) = new_queue(&rt, &factory, test_options(1))?;
        let err = queue
            .execute_in_queue(
                JobKind::Query,
                json!("broken"),
                json!({"error": "relation \"orders\" does not exist"}),
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.msg().contains("relation \"orders\" does not exist"));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_invalid_priority(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;
        let err = queue
            .execute_in_queue(
                JobKind::Query,
                json!("q"),
                json!({}),
                Some(10001),
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.msg(), "Priority should be between -10000 and 10000");
        assert!(handler.executed().is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_orphaned_query_is_canceled_once(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;
        let job = ExecuteOptions {
            is_job: true,
            ..Default::default()
        };
        queue
            .execute_in_queue(
                JobKind::Query,
                json!("long"),
                json!({"name": "long", "sleep_ms": 200_000, "result": 1}),
                None,
                job,
            )
            .await?;
        rt.wait(Duration::from_secs(1)).await;
        assert_eq!(handler.executed().len(), 1);

        // Nobody polls for it past the orphaned timeout.
        rt.wait(Duration::from_secs(121)).await;
        queue.reconcile_queue().await?;
        queue.reconcile_queue().await?;

        let canceled = handler.canceled();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].cancel_handler, Some(json!({"cancel": "long"})));
        assert!(canceled[0].start_query_time.is_some());
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_stalled_active_query_is_reclaimed(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;

        // Another process claims the query and dies without heartbeating.
        let driver = factory.queue_driver(QueueDriverOptions {
            prefix: "SQL_QUERY_test".to_owned(),
            concurrency: 1,
            continue_wait_timeout: Duration::from_secs(5),
            orphaned_timeout: Duration::from_secs(3600),
            heart_beat_timeout: Duration::from_secs(120),
            process_uid: "process-b".to_owned(),
        })?;
        let connection = driver.create_connection().await?;
        let now = rt.unix_millis();
        connection
            .add_to_queue(AddToQueueRequest {
                key_score: now,
                query_key: json!("stuck"),
                orphaned_time: now + 3_600_000,
                query_handler: JobKind::Query,
                query: json!({"name": "stuck"}),
                priority: 0,
                queue_id: 1,
                stage_query_key: None,
                request_id: None,
                awaits_result: false,
            })
            .await?;
        let hash = queue.redis_hash(&json!("stuck"));
        let processing_id = connection.get_next_processing_id().await?;
        let retrieved = connection
            .retrieve_for_processing(&hash, processing_id)
            .await?
            .expect("lock is free");
        assert!(retrieved.added);

        let statuses: Vec<Vec<QueueStatus>> = queue
            .get_queries()
            .await?
            .into_iter()
            .map(|query| query.status)
            .collect();
        assert_eq!(statuses, vec![vec![QueueStatus::Active]]);

        rt.wait(Duration::from_secs(121)).await;
        let statuses: Vec<Vec<QueueStatus>> = queue
            .get_queries()
            .await?
            .into_iter()
            .map(|query| query.status)
            .collect();
        assert_eq!(
            statuses,
            vec![vec![QueueStatus::Stalled, QueueStatus::Active]]
        );

        queue.reconcile_queue().await?;
        assert_eq!(handler.canceled().len(), 1);
        assert!(handler.executed().is_empty());
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_timeout_cancels_query(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(
            &rt,
            &factory,
            QueueOptions {
                execution_timeout: Duration::from_secs(3),
                ..test_options(1)
            },
        )?;
        let err = queue
            .execute_in_queue(
                JobKind::Query,
                json!("slow"),
                json!({"name": "slow", "sleep_ms": 60_000, "result": 1}),
                None,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:#}");
        let canceled = handler.canceled();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].cancel_handler, Some(json!({"cancel": "slow"})));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_force_build_and_jobs(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;
        let query = json!({"name": "build", "sleep_ms": 1000, "result": 1});
        let forced = ExecuteOptions {
            force_build: true,
            is_job: true,
            ..Default::default()
        };
        assert_eq!(
            queue
                .execute_in_queue(JobKind::Query, json!("build"), query.clone(), None, forced.clone())
                .await?,
            None
        );
        // Already queued: the forced build is a no-op.
        assert_eq!(
            queue
                .execute_in_queue(JobKind::Query, json!("build"), query, None, forced)
                .await?,
            None
        );
        rt.wait(Duration::from_secs(5)).await;
        assert_eq!(handler.executed().len(), 1);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_query_stage(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, _handler) = new_queue(&rt, &factory, test_options(1))?;
        let job = |stage: &str| ExecuteOptions {
            is_job: true,
            stage_query_key: Some(json!(stage)),
            ..Default::default()
        };
        for name in ["running", "first", "second"] {
            if name == "first" {
                rt.wait(Duration::from_secs(1)).await;
            }
            queue
                .execute_in_queue(
                    JobKind::Query,
                    json!(name),
                    json!({"name": name, "sleep_ms": 10_000, "result": 1}),
                    Some(0),
                    job(name),
                )
                .await?;
        }
        let state = queue.fetch_query_stage_state().await?;
        assert_eq!(state.active.len(), 1);
        assert_eq!(
            queue.get_query_stage(&json!("second"), None, Some(&state)).await?,
            Some(QueryStage {
                stage: "#2 in queue".to_owned(),
                time_elapsed: None,
            })
        );
        assert_eq!(
            queue.get_query_stage(&json!("first"), Some(0), Some(&state)).await?,
            Some(QueryStage {
                stage: "#1 in queue".to_owned(),
                time_elapsed: None,
            })
        );
        assert_eq!(queue.get_query_stage(&json!("first"), Some(5), Some(&state)).await?, None);
        let running = queue
            .get_query_stage(&json!("running"), None, Some(&state))
            .await?
            .expect("running query has a stage");
        assert_eq!(running.stage, "Executing query");
        assert!(running.time_elapsed.is_some_and(|elapsed| elapsed >= 1000));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_manual_cancel(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(&rt, &factory, test_options(1))?;
        queue
            .execute_in_queue(
                JobKind::Query,
                json!("to-cancel"),
                json!({"name": "to-cancel", "sleep_ms": 10_000, "result": 1}),
                None,
                ExecuteOptions {
                    is_job: true,
                    ..Default::default()
                },
            )
            .await?;
        let hash = queue.redis_hash(&json!("to-cancel"));
        assert!(queue.cancel_query(&hash).await?);
        assert!(!queue.cancel_query(&hash).await?);
        assert_eq!(handler.canceled().len(), 1);
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_stream_rows_reach_consumer(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, _handler) = new_queue(&rt, &factory, test_options(1))?;
        let rows = queue
            .execute_stream_in_queue(
                json!({"query": "SELECT * FROM orders"}),
                json!({"rows": [{"id": 1}, {"id": 2}], "result": null}),
                None,
                Some("req-1".to_owned()),
            )
            .await?;
        let rows: Vec<Value> = rows
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<anyhow::Result<_>>()?;
        assert_eq!(rows, vec![json!({"id": 1}), json!({"id": 2})]);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_skip_queue_runs_inline(rt: TestRuntime) -> anyhow::Result<()> {
        let factory = LocalDriverFactory::new(rt.clone());
        let (queue, handler) = new_queue(
            &rt,
            &factory,
            QueueOptions {
                skip_queue: true,
                ..test_options(1)
            },
        )?;
        let start = rt.unix_millis();
        let result = queue
            .execute_in_queue(
                JobKind::Query,
                json!("inline"),
                json!({"result": 7}),
                None,
                ExecuteOptions::default(),
            )
            .await?;
        assert_eq!(result, Some(json!(7)));
        assert_eq!(handler.executed().len(), 1);
        assert_eq!(rt.unix_millis(), start);
        assert!(queue.get_queries().await?.is_empty());
        Ok(())
    }
}
