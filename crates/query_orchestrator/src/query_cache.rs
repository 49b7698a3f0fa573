//! Memoized SQL execution on top of [`QueryQueue`] and a [`CacheDriver`].
//!
//! A result is stored with the time it was computed and a renewal key, a
//! snapshot of the refresh-key query results it was computed under. Reads
//! serve the stored value until it is older than the renewal threshold or the
//! refresh keys move, and then recompute through the queue, either blocking
//! or in the background.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    errors::report_error,
    knobs::{
        DEFAULT_QUEUE_PRIORITY,
        QUERY_CACHE_EXPIRE,
        QUERY_CACHE_MAX_ENTRIES,
        QUERY_RENEWAL_THRESHOLD,
        REFRESH_KEY_RENEWAL_THRESHOLD,
    },
    runtime::Runtime,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::{
    future::{
        try_join_all,
        BoxFuture,
    },
    TryStreamExt,
};
use lru::LruCache;
use maplit::btreemap;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value,
};

use crate::{
    cache::CacheDriver,
    driver::{
        DriverFactory,
        QueryHandleRegistry,
        QueryOptions,
        TableData,
    },
    metrics::{
        log_cache_hit,
        log_cache_miss,
        log_cache_renewal,
    },
    pre_aggregations::{
        LambdaQuery,
        PreAggregationDescription,
    },
    queue::{
        digest_hex,
        query_queue::{
            ExecuteOptions,
            JobContext,
            JobHandler,
            QueryStream,
            QueueOptions,
        },
        CacheAndQueueDriverFactory,
        JobKind,
        QueryDef,
        QueryQueue,
    },
};

pub const DEFAULT_DATA_SOURCE: &str = "default";

/// LRU entries are only kept while they have more than this left before
/// their renewal threshold.
const IN_MEMORY_CACHE_DISABLE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Per-query overrides carried next to the SQL of a refresh-key or range
/// query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyQueryOptions {
    /// In seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_threshold: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub incremental: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_window_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_threshold_outside_update_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
}

/// SQL text with its positional parameters. Serialized as `[sql, params]`,
/// or `[sql, params, options]` when options are set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "QueryWithParamsRepr", into = "QueryWithParamsRepr")]
pub struct QueryWithParams {
    pub sql: String,
    pub params: Vec<Value>,
    pub options: KeyQueryOptions,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum QueryWithParamsRepr {
    WithOptions(String, Vec<Value>, KeyQueryOptions),
    Pair(String, Vec<Value>),
    Sql(String),
}

impl From<QueryWithParamsRepr> for QueryWithParams {
    fn from(repr: QueryWithParamsRepr) -> Self {
        match repr {
            QueryWithParamsRepr::WithOptions(sql, params, options) => Self {
                sql,
                params,
                options,
            },
            QueryWithParamsRepr::Pair(sql, params) => Self::new(sql, params),
            QueryWithParamsRepr::Sql(sql) => Self::new(sql, vec![]),
        }
    }
}

impl From<QueryWithParams> for QueryWithParamsRepr {
    fn from(query: QueryWithParams) -> Self {
        if query.options == KeyQueryOptions::default() {
            QueryWithParamsRepr::Pair(query.sql, query.params)
        } else {
            QueryWithParamsRepr::WithOptions(query.sql, query.params, query.options)
        }
    }
}

impl QueryWithParams {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            options: KeyQueryOptions::default(),
        }
    }

    /// `[sql, params]`, the cache key of this query.
    pub fn key(&self) -> Value {
        json!([self.sql, self.params])
    }

    pub fn with_table_names_replaced(&self, tables: &[(String, String)]) -> Self {
        Self {
            sql: replace_pre_aggregation_table_names(&self.sql, tables),
            ..self.clone()
        }
    }
}

/// One query as handed to the orchestrator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryBody {
    pub query: String,
    pub values: Vec<Value>,
    pub data_source: Option<String>,
    pub request_id: Option<String>,
    pub queue_priority: Option<i64>,
    /// Run against the external pre-aggregation store.
    pub external: bool,
    /// Stream the rows instead of caching them.
    pub persistent: bool,
    pub force_no_cache: bool,
    /// Block until the refresh keys and the result are renewed.
    pub renew_query: bool,
    pub use_in_memory_cache: bool,
    /// In seconds.
    pub expire: Option<u64>,
    /// In seconds.
    pub renewal_threshold: Option<u64>,
    pub cache_key_queries: Vec<QueryWithParams>,
    /// Extra component of the cache key that forces a new entry when changed.
    pub invalidate: Option<Value>,
    pub pre_aggregations: Vec<PreAggregationDescription>,
    pub force_build_pre_aggregations: bool,
    /// Fire pre-aggregation builds without waiting for them.
    pub is_job: bool,
    /// In seconds.
    pub orphaned_timeout: Option<u64>,
    /// Keyed by pre-aggregation id.
    pub lambda_queries: BTreeMap<String, LambdaQuery>,
}

impl QueryBody {
    pub fn data_source(&self) -> &str {
        self.data_source.as_deref().unwrap_or(DEFAULT_DATA_SOURCE)
    }
}

/// `[sql, params, pre-aggregation load SQLs]`, plus the invalidate marker if
/// any.
pub fn query_cache_key(body: &QueryBody) -> Value {
    let load_sqls: Vec<&QueryWithParams> = body
        .pre_aggregations
        .iter()
        .map(|p| &p.load_sql)
        .collect();
    let mut key = vec![json!(body.query), json!(body.values), json!(load_sqls)];
    if let Some(invalidate) = &body.invalidate {
        key.push(invalidate.clone());
    }
    Value::Array(key)
}

/// Replaces every occurrence of each logical table name with its target.
pub fn replace_pre_aggregation_table_names(sql: &str, tables: &[(String, String)]) -> String {
    tables
        .iter()
        .fold(sql.to_owned(), |sql, (table_name, target_table_name)| {
            sql.replace(table_name.as_str(), target_table_name)
        })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Unix millis of the computation.
    pub time: i64,
    pub result: Value,
    pub renewal_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CachedQueryResult {
    pub data: Value,
    /// Unix millis of the stored entry, if there is one.
    pub last_refresh_time: Option<i64>,
    pub refresh_key_values: Vec<Value>,
}

#[derive(Clone, Debug, Default)]
pub struct CacheQueryOptions {
    pub renewal_threshold: Option<Duration>,
    /// Recompute when the stored entry was computed under a different key.
    pub renewal_key: Option<Value>,
    pub priority: Option<i64>,
    pub external: bool,
    pub request_id: Option<String>,
    pub data_source: Option<String>,
    pub wait_for_renew: bool,
    pub force_no_cache: bool,
    pub use_in_memory_cache: bool,
}

#[derive(Clone, Debug, Default)]
pub struct RenewQueryOptions {
    pub external: bool,
    pub request_id: Option<String>,
    pub data_source: Option<String>,
    pub priority: Option<i64>,
    /// Serve stale refresh keys while they renew in the background.
    pub skip_refresh_key_wait_for_renew: bool,
    pub use_in_memory_cache: bool,
}

#[derive(Clone, Debug)]
pub struct QueryCacheOptions {
    /// Overrides the per-query refresh-key thresholds.
    pub refresh_key_renewal_threshold: Option<Duration>,
    /// Serve whatever is cached and leave renewal to the renew cycle.
    pub background_renew: bool,
    pub queue_options: QueueOptions,
    pub external_queue_options: QueueOptions,
    pub max_in_memory_entries: usize,
}

impl Default for QueryCacheOptions {
    fn default() -> Self {
        Self {
            refresh_key_renewal_threshold: None,
            background_renew: false,
            queue_options: QueueOptions::default(),
            external_queue_options: QueueOptions::default(),
            max_in_memory_entries: *QUERY_CACHE_MAX_ENTRIES,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqlQueuePayload {
    query_key: Value,
    query: String,
    values: Vec<Value>,
    request_id: Option<String>,
}

/// Runs cached queries against the data source driver.
struct SqlQueryHandler {
    driver_factory: Arc<dyn DriverFactory>,
    data_source: String,
    handles: QueryHandleRegistry,
}

#[async_trait]
impl JobHandler for SqlQueryHandler {
    async fn execute(&self, query: Value, context: JobContext) -> anyhow::Result<Value> {
        let payload: SqlQueuePayload = serde_json::from_value(query)?;
        let driver = self.driver_factory.driver(&self.data_source)?;
        let handle = self.handles.register(driver.clone());
        context.set_cancel_handler(json!(handle.id())).await;
        tracing::debug!(
            "Executing SQL request_id={:?}: {}",
            payload.request_id,
            payload.query
        );
        let options = QueryOptions {
            request_id: payload.request_id,
            query_key: Some(payload.query_key),
            ..Default::default()
        };
        let result = driver
            .query(&payload.query, &payload.values, &options, &handle)
            .await;
        self.handles.complete(handle.id());
        let rows = result?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    async fn cancel(&self, query: &QueryDef) -> anyhow::Result<()> {
        if let Some(id) = query.cancel_handler.as_ref().and_then(Value::as_u64) {
            self.handles.cancel(id).await?;
        }
        Ok(())
    }
}

/// Streams rows of persistent queries to the consumer.
struct SqlStreamHandler {
    driver_factory: Arc<dyn DriverFactory>,
    data_source: String,
}

#[async_trait]
impl JobHandler for SqlStreamHandler {
    async fn execute(&self, query: Value, context: JobContext) -> anyhow::Result<Value> {
        let payload: SqlQueuePayload = serde_json::from_value(query)?;
        let Some(sink) = context.sink() else {
            anyhow::bail!("Stream for {} has no consumer", payload.query_key);
        };
        let driver = self.driver_factory.driver(&self.data_source)?;
        let data = driver.stream_table(&payload.query, &payload.values).await?;
        let mut row_count = 0usize;
        match data.data {
            TableData::Stream(mut rows) => {
                while let Some(row) = rows.try_next().await? {
                    sink.send(Value::Object(row)).await?;
                    row_count += 1;
                }
            },
            TableData::Rows(rows) => {
                for row in rows {
                    sink.send(Value::Object(row)).await?;
                    row_count += 1;
                }
            },
            TableData::Csv(_) => anyhow::bail!("Unloaded CSV files can't be streamed"),
        }
        Ok(json!({ "rowCount": row_count }))
    }

    async fn cancel(&self, _query: &QueryDef) -> anyhow::Result<()> {
        Ok(())
    }
}

fn sql_handlers(
    driver_factory: Arc<dyn DriverFactory>,
    data_source: &str,
) -> BTreeMap<JobKind, Arc<dyn JobHandler>> {
    btreemap! {
        JobKind::Query => Arc::new(SqlQueryHandler {
            driver_factory: driver_factory.clone(),
            data_source: data_source.to_owned(),
            handles: QueryHandleRegistry::default(),
        }) as Arc<dyn JobHandler>,
        JobKind::Stream => Arc::new(SqlStreamHandler {
            driver_factory,
            data_source: data_source.to_owned(),
        }) as Arc<dyn JobHandler>,
    }
}

/// Everything `fetch_new` needs to recompute and store one entry.
struct FetchRequest {
    sql: String,
    params: Vec<Value>,
    cache_key: Value,
    redis_key: String,
    renewal_key: Option<String>,
    expiration: Duration,
    options: CacheQueryOptions,
}

struct QueryCacheInner<RT: Runtime> {
    rt: RT,
    prefix: String,
    options: QueryCacheOptions,
    driver_factory: Arc<dyn DriverFactory>,
    external_driver_factory: Option<Arc<dyn DriverFactory>>,
    queue_factory: Arc<dyn CacheAndQueueDriverFactory>,
    cache_driver: Arc<dyn CacheDriver>,
    memory_cache: Mutex<LruCache<String, CacheEntry>>,
    queues: Mutex<BTreeMap<String, QueryQueue<RT>>>,
    external_queue: Mutex<Option<QueryQueue<RT>>>,
    /// Redis keys with a renew cycle in flight.
    renew_cycles: Mutex<BTreeSet<String>>,
}

#[derive(Clone)]
pub struct QueryCache<RT: Runtime> {
    inner: Arc<QueryCacheInner<RT>>,
}

impl<RT: Runtime> QueryCache<RT> {
    pub fn new(
        rt: RT,
        prefix: impl Into<String>,
        driver_factory: Arc<dyn DriverFactory>,
        external_driver_factory: Option<Arc<dyn DriverFactory>>,
        queue_factory: Arc<dyn CacheAndQueueDriverFactory>,
        options: QueryCacheOptions,
    ) -> anyhow::Result<Self> {
        let cache_driver = queue_factory.cache_driver()?;
        let capacity = NonZeroUsize::new(options.max_in_memory_entries).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner: Arc::new(QueryCacheInner {
                rt,
                prefix: prefix.into(),
                options,
                driver_factory,
                external_driver_factory,
                queue_factory,
                cache_driver,
                memory_cache: Mutex::new(LruCache::new(capacity)),
                queues: Mutex::new(BTreeMap::new()),
                external_queue: Mutex::new(None),
                renew_cycles: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn cache_driver(&self) -> Arc<dyn CacheDriver> {
        self.inner.cache_driver.clone()
    }

    pub fn queue_factory(&self) -> Arc<dyn CacheAndQueueDriverFactory> {
        self.inner.queue_factory.clone()
    }

    pub fn driver_factory(&self) -> Arc<dyn DriverFactory> {
        self.inner.driver_factory.clone()
    }

    pub fn external_driver_factory(&self) -> Option<Arc<dyn DriverFactory>> {
        self.inner.external_driver_factory.clone()
    }

    pub fn refresh_key_renewal_threshold(&self) -> Option<Duration> {
        self.inner.options.refresh_key_renewal_threshold
    }

    /// `<catalog>_<prefix>_<key>`.
    pub fn get_key(&self, catalog: &str, key: &str) -> String {
        format!("{catalog}_{}_{key}", self.inner.prefix)
    }

    pub fn query_redis_key(&self, cache_key: &Value) -> String {
        self.get_key("SQL_QUERY_RESULT", &digest_hex(cache_key))
    }

    /// Queue of `data_source`, created on first use.
    pub fn get_queue(&self, data_source: &str) -> anyhow::Result<QueryQueue<RT>> {
        if let Some(queue) = self.inner.queues.lock().get(data_source) {
            return Ok(queue.clone());
        }
        let queue = QueryQueue::new(
            self.inner.rt.clone(),
            format!("SQL_QUERY_{}_{data_source}", self.inner.prefix),
            self.inner.options.queue_options.clone(),
            sql_handlers(self.inner.driver_factory.clone(), data_source),
            &*self.inner.queue_factory,
        )?;
        Ok(self
            .inner
            .queues
            .lock()
            .entry(data_source.to_owned())
            .or_insert(queue)
            .clone())
    }

    /// Queue of the external pre-aggregation store, created on first use.
    pub fn get_external_queue(&self) -> anyhow::Result<QueryQueue<RT>> {
        if let Some(queue) = &*self.inner.external_queue.lock() {
            return Ok(queue.clone());
        }
        let Some(driver_factory) = self.inner.external_driver_factory.clone() else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NoExternalDriver",
                "External query requested but no external driver is configured"
            ));
        };
        let queue = QueryQueue::new(
            self.inner.rt.clone(),
            format!("SQL_QUERY_EXT_{}", self.inner.prefix),
            self.inner.options.external_queue_options.clone(),
            sql_handlers(driver_factory, DEFAULT_DATA_SOURCE),
            &*self.inner.queue_factory,
        )?;
        Ok(self
            .inner
            .external_queue
            .lock()
            .get_or_insert(queue)
            .clone())
    }

    /// Every queue created so far, the external one last.
    pub fn queues(&self) -> Vec<QueryQueue<RT>> {
        let mut queues: Vec<_> = self.inner.queues.lock().values().cloned().collect();
        queues.extend(self.inner.external_queue.lock().clone());
        queues
    }

    /// Serves `body` from the cache, renewing it as its mode asks.
    /// `tables` maps pre-aggregation table names to the tables that were
    /// loaded for them.
    pub async fn cached_query_result(
        &self,
        body: &QueryBody,
        tables: &[(String, String)],
    ) -> anyhow::Result<CachedQueryResult> {
        let query = replace_pre_aggregation_table_names(&body.query, tables);
        let cache_key_queries: Vec<QueryWithParams> = body
            .cache_key_queries
            .iter()
            .map(|q| q.with_table_names_replaced(tables))
            .collect();
        let cache_key = query_cache_key(body);
        let expiration = body
            .expire
            .map(Duration::from_secs)
            .unwrap_or(*QUERY_CACHE_EXPIRE);
        let priority = body.queue_priority.unwrap_or(*DEFAULT_QUEUE_PRIORITY);

        if body.persistent {
            let rows: Vec<Value> = self
                .query_stream(&query, &body.values, cache_key, body)
                .await?
                .try_collect()
                .await?;
            return Ok(CachedQueryResult {
                data: Value::Array(rows),
                last_refresh_time: None,
                refresh_key_values: vec![],
            });
        }

        let options = CacheQueryOptions {
            priority: Some(priority),
            external: body.external,
            request_id: body.request_id.clone(),
            data_source: body.data_source.clone(),
            use_in_memory_cache: body.use_in_memory_cache,
            ..Default::default()
        };
        if body.force_no_cache {
            let data = self
                .cache_query_result(
                    &query,
                    &body.values,
                    cache_key.clone(),
                    expiration,
                    CacheQueryOptions {
                        force_no_cache: true,
                        ..options
                    },
                )
                .await?;
            return Ok(CachedQueryResult {
                data,
                last_refresh_time: self.last_refresh_time(&cache_key).await?,
                refresh_key_values: vec![],
            });
        }

        let renewal_threshold = body.renewal_threshold.map(Duration::from_secs);
        let renew_options = RenewQueryOptions {
            external: body.external,
            request_id: body.request_id.clone(),
            data_source: body.data_source.clone(),
            priority: Some(priority),
            skip_refresh_key_wait_for_renew: !body.renew_query,
            use_in_memory_cache: body.use_in_memory_cache,
        };
        if body.renew_query {
            return self
                .renew_query(
                    &query,
                    &body.values,
                    &cache_key_queries,
                    expiration,
                    cache_key,
                    renewal_threshold,
                    renew_options,
                )
                .await;
        }
        if !self.inner.options.background_renew {
            let result = self
                .renew_query(
                    &query,
                    &body.values,
                    &cache_key_queries,
                    expiration,
                    cache_key.clone(),
                    renewal_threshold,
                    renew_options.clone(),
                )
                .await;
            self.start_renew_cycle(
                query,
                body.values.clone(),
                cache_key_queries,
                expiration,
                cache_key,
                renewal_threshold,
                renew_options,
            );
            return result;
        }

        let data = self
            .cache_query_result(&query, &body.values, cache_key.clone(), expiration, options)
            .await?;
        let last_refresh_time = self.last_refresh_time(&cache_key).await?;
        self.start_renew_cycle(
            query,
            body.values.clone(),
            cache_key_queries,
            expiration,
            cache_key,
            renewal_threshold,
            renew_options,
        );
        Ok(CachedQueryResult {
            data,
            last_refresh_time,
            refresh_key_values: vec![],
        })
    }

    /// Starts a stream job for `query` owned by this process.
    pub async fn query_stream(
        &self,
        query: &str,
        values: &[Value],
        cache_key: Value,
        body: &QueryBody,
    ) -> anyhow::Result<QueryStream> {
        let queue = if body.external {
            self.get_external_queue()?
        } else {
            self.get_queue(body.data_source())?
        };
        let payload = serde_json::to_value(SqlQueuePayload {
            query_key: cache_key.clone(),
            query: query.to_owned(),
            values: values.to_vec(),
            request_id: body.request_id.clone(),
        })?;
        queue
            .execute_stream_in_queue(
                cache_key,
                payload,
                Some(body.queue_priority.unwrap_or(*DEFAULT_QUEUE_PRIORITY)),
                body.request_id.clone(),
            )
            .await
    }

    /// Re-evaluates the refresh keys and then the query itself, recomputing
    /// it when the keys moved or the entry is older than `renewal_threshold`.
    #[allow(clippy::too_many_arguments)]
    pub async fn renew_query(
        &self,
        query: &str,
        values: &[Value],
        cache_key_queries: &[QueryWithParams],
        expiration: Duration,
        cache_key: Value,
        renewal_threshold: Option<Duration>,
        options: RenewQueryOptions,
    ) -> anyhow::Result<CachedQueryResult> {
        let refresh_key_queries: Vec<_> = cache_key_queries.iter().map(|key_query| {
            let threshold = self
                .inner
                .options
                .refresh_key_renewal_threshold
                .or(key_query.options.renewal_threshold.map(Duration::from_secs))
                .unwrap_or(*REFRESH_KEY_RENEWAL_THRESHOLD);
            self.cache_query_result(
                &key_query.sql,
                &key_query.params,
                key_query.key(),
                expiration,
                CacheQueryOptions {
                    renewal_threshold: Some(threshold),
                    renewal_key: Some(key_query.key()),
                    priority: options.priority,
                    external: key_query.options.external.unwrap_or(options.external),
                    request_id: options.request_id.clone(),
                    data_source: options.data_source.clone(),
                    wait_for_renew: !options.skip_refresh_key_wait_for_renew,
                    force_no_cache: false,
                    use_in_memory_cache: true,
                },
            )
        }).collect();
        let refresh_keys = try_join_all(refresh_key_queries).await;
        let refresh_key_values = match refresh_keys {
            Ok(values) => values,
            Err(e) if e.is_continue_wait() => return Err(e),
            Err(e) => {
                tracing::error!(
                    "Error fetching cache key queries request_id={:?}: {e:#}",
                    options.request_id
                );
                vec![]
            },
        };
        let renewal_key = json!([
            cache_key_queries,
            refresh_key_values,
            self.query_redis_key(&json!([query, values])),
        ]);
        let data = self
            .cache_query_result(
                query,
                values,
                cache_key.clone(),
                expiration,
                CacheQueryOptions {
                    renewal_threshold: Some(renewal_threshold.unwrap_or(*QUERY_RENEWAL_THRESHOLD)),
                    renewal_key: Some(renewal_key),
                    priority: options.priority,
                    external: options.external,
                    request_id: options.request_id.clone(),
                    data_source: options.data_source.clone(),
                    wait_for_renew: true,
                    force_no_cache: false,
                    use_in_memory_cache: options.use_in_memory_cache,
                },
            )
            .await?;
        Ok(CachedQueryResult {
            data,
            last_refresh_time: self.last_refresh_time(&cache_key).await?,
            refresh_key_values,
        })
    }

    /// Spawns a blocking renew of `cache_key` unless one is already running
    /// in this process.
    #[allow(clippy::too_many_arguments)]
    pub fn start_renew_cycle(
        &self,
        query: String,
        values: Vec<Value>,
        cache_key_queries: Vec<QueryWithParams>,
        expiration: Duration,
        cache_key: Value,
        renewal_threshold: Option<Duration>,
        options: RenewQueryOptions,
    ) {
        let redis_key = self.query_redis_key(&cache_key);
        if !self.inner.renew_cycles.lock().insert(redis_key.clone()) {
            tracing::debug!("Renew cycle for {redis_key} is already running");
            return;
        }
        let this = self.clone();
        let _handle = self.inner.rt.spawn("query_cache_renew_cycle", async move {
            let result = this
                .renew_query(
                    &query,
                    &values,
                    &cache_key_queries,
                    expiration,
                    cache_key,
                    renewal_threshold,
                    RenewQueryOptions {
                        skip_refresh_key_wait_for_renew: false,
                        ..options
                    },
                )
                .await;
            this.inner.renew_cycles.lock().remove(&redis_key);
            if let Err(e) = result {
                if !e.is_continue_wait() {
                    report_error(&mut e.context(format!("Renew cycle of {redis_key}"))).await;
                }
            }
        });
    }

    /// Cache-aside lookup of one query. A stored entry is served unless it
    /// must be renewed: its renewal key differs from `renewal_key` or it is
    /// older than the threshold. Renewal blocks with `wait_for_renew` and
    /// runs in the background otherwise.
    pub async fn cache_query_result(
        &self,
        sql: &str,
        params: &[Value],
        cache_key: Value,
        expiration: Duration,
        options: CacheQueryOptions,
    ) -> anyhow::Result<Value> {
        let redis_key = self.query_redis_key(&cache_key);
        let renewal_key = options.renewal_key.as_ref().map(|key| self.query_redis_key(key));
        let request = FetchRequest {
            sql: sql.to_owned(),
            params: params.to_vec(),
            cache_key,
            redis_key: redis_key.clone(),
            renewal_key: renewal_key.clone(),
            expiration,
            options: options.clone(),
        };
        if options.force_no_cache {
            tracing::debug!("Force no cache for {redis_key}");
            return self.fetch_new(request).await;
        }

        let Some(entry) = self
            .lookup(&redis_key, renewal_key.as_deref(), &options)
            .await?
        else {
            log_cache_miss();
            tracing::debug!(
                "Missing cache for {redis_key} request_id={:?}",
                options.request_id
            );
            return self.fetch_new(request).await;
        };

        let renewed_ago = self.renewed_ago(&entry);
        let needs_renew = renewal_key.is_some()
            && (options
                .renewal_threshold
                .is_none_or(|threshold| renewed_ago > threshold)
                || entry.renewal_key != renewal_key);
        if needs_renew {
            if options.wait_for_renew {
                tracing::info!(
                    "Waiting for renew {redis_key} renewed_ago={renewed_ago:?} request_id={:?}",
                    options.request_id
                );
                return self.fetch_new(request).await;
            }
            tracing::info!(
                "Renewing existing key {redis_key} renewed_ago={renewed_ago:?} request_id={:?}",
                options.request_id
            );
            let this = self.clone();
            let _handle = self.inner.rt.spawn("query_cache_renew", async move {
                let redis_key = request.redis_key.clone();
                if let Err(e) = this.fetch_new(request).await {
                    if !e.is_continue_wait() {
                        report_error(&mut e.context(format!("Renewing {redis_key}"))).await;
                    }
                }
            });
        }
        tracing::debug!(
            "Using cache for {redis_key} request_id={:?}",
            options.request_id
        );
        Ok(entry.result)
    }

    async fn lookup(
        &self,
        redis_key: &str,
        renewal_key: Option<&str>,
        options: &CacheQueryOptions,
    ) -> anyhow::Result<Option<CacheEntry>> {
        if options.use_in_memory_cache {
            let in_memory = self.inner.memory_cache.lock().get(redis_key).cloned();
            if let Some(entry) = in_memory {
                let fresh = options
                    .renewal_threshold
                    .is_some_and(|threshold| self.renewed_ago(&entry) <= threshold);
                if fresh && entry.renewal_key.as_deref() == renewal_key {
                    log_cache_hit(true);
                    return Ok(Some(entry));
                }
            }
        }
        let Some(value) = self.inner.cache_driver.get(redis_key).await? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_value(value)?;
        log_cache_hit(false);
        if options.use_in_memory_cache {
            let renewed_ago = self.renewed_ago(&entry);
            let warm = options.renewal_threshold.is_some_and(|threshold| {
                renewed_ago + IN_MEMORY_CACHE_DISABLE_PERIOD <= threshold
            });
            if warm {
                self.inner
                    .memory_cache
                    .lock()
                    .put(redis_key.to_owned(), entry.clone());
            }
        }
        Ok(Some(entry))
    }

    /// Recomputes through the queue and stores the result. A failed
    /// recompute drops the entry.
    fn fetch_new(&self, request: FetchRequest) -> BoxFuture<'static, anyhow::Result<Value>> {
        let this = self.clone();
        Box::pin(async move {
            let FetchRequest {
                sql,
                params,
                cache_key,
                redis_key,
                renewal_key,
                expiration,
                options,
            } = request;
            match this.execute_query(&sql, &params, cache_key, &options).await {
                Ok(result) => {
                    let entry = CacheEntry {
                        time: this.inner.rt.unix_millis(),
                        result: result.clone(),
                        renewal_key,
                    };
                    this.inner.memory_cache.lock().pop(&redis_key);
                    let stored = this
                        .inner
                        .cache_driver
                        .set(&redis_key, serde_json::to_value(&entry)?, expiration)
                        .await?;
                    log_cache_renewal();
                    tracing::info!(
                        "Renewed {redis_key} bytes={} request_id={:?}",
                        stored.bytes,
                        options.request_id
                    );
                    Ok(result)
                },
                Err(e) => {
                    if !e.is_continue_wait() {
                        tracing::info!(
                            "Dropping Cache {redis_key} request_id={:?}: {e:#}",
                            options.request_id
                        );
                        this.inner.memory_cache.lock().pop(&redis_key);
                        if let Err(remove_err) = this.inner.cache_driver.remove(&redis_key).await {
                            tracing::error!("Error removing key {redis_key}: {remove_err:#}");
                        }
                    }
                    Err(e)
                },
            }
        })
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        cache_key: Value,
        options: &CacheQueryOptions,
    ) -> anyhow::Result<Value> {
        let queue = if options.external {
            self.get_external_queue()?
        } else {
            self.get_queue(options.data_source.as_deref().unwrap_or(DEFAULT_DATA_SOURCE))?
        };
        let payload = serde_json::to_value(SqlQueuePayload {
            query_key: cache_key.clone(),
            query: sql.to_owned(),
            values: params.to_vec(),
            request_id: options.request_id.clone(),
        })?;
        let result = queue
            .execute_in_queue(
                JobKind::Query,
                cache_key,
                payload,
                Some(options.priority.unwrap_or(*DEFAULT_QUEUE_PRIORITY)),
                ExecuteOptions {
                    request_id: options.request_id.clone(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(result.unwrap_or(Value::Null))
    }

    fn renewed_ago(&self, entry: &CacheEntry) -> Duration {
        let millis = self.inner.rt.unix_millis().saturating_sub(entry.time).max(0);
        Duration::from_millis(millis as u64)
    }

    async fn stored_entry(&self, cache_key: &Value) -> anyhow::Result<Option<CacheEntry>> {
        let Some(value) = self
            .inner
            .cache_driver
            .get(&self.query_redis_key(cache_key))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn last_refresh_time(&self, cache_key: &Value) -> anyhow::Result<Option<i64>> {
        Ok(self.stored_entry(cache_key).await?.map(|entry| entry.time))
    }

    /// The stored result of `body`, without computing anything.
    pub async fn result_from_cache_if_exists(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<Option<CachedQueryResult>> {
        let entry = self.stored_entry(&query_cache_key(body)).await?;
        Ok(entry.map(|entry| CachedQueryResult {
            data: entry.result,
            last_refresh_time: Some(entry.time),
            refresh_key_values: vec![],
        }))
    }

    /// Runs `f` under the cache driver lock `key`, releasing it afterwards.
    /// Returns whether `f` ran.
    pub async fn with_lock(
        &self,
        key: &str,
        ttl: Duration,
        f: BoxFuture<'_, anyhow::Result<()>>,
    ) -> anyhow::Result<bool> {
        self.inner
            .cache_driver
            .with_lock(&self.get_key("LOCK", key), ttl, true, f)
            .await
    }

    pub async fn cleanup(&self) -> anyhow::Result<()> {
        self.inner.cache_driver.cleanup().await
    }

    pub async fn test_connection(&self) -> anyhow::Result<()> {
        self.inner.cache_driver.test_connection().await
    }

    /// Shuts down every queue this cache created.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for queue in self.queues() {
            queue.shutdown().await?;
        }
        Ok(())
    }
}
