//! Materialized rollup tables. A pre-aggregation is built into a physical
//! table named after its content and structure versions, refreshed when its
//! refresh keys move, split into calendar partitions when it has a partition
//! granularity, and swept once no longer used.
//!
//! Builds run one at a time per data source through the build queue;
//! schema listings are refreshed through a separate load-cache queue so a
//! waiting request never blocks a build.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    sync::{
        Arc,
        Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    knobs::{
        LAMBDA_MAX_SOURCE_ROW_LIMIT,
        MAX_PARTITIONS_PER_PRE_AGGREGATION,
        PRE_AGGREGATIONS_SCHEMA_CACHE_EXPIRE,
        STRUCTURE_VERSION_PERSIST_TIME,
        TOUCH_CACHE_MAX_COUNT,
        TOUCH_CACHE_TTL,
        TOUCH_PRE_AGG_TIMEOUT,
        USED_TABLE_PERSIST_TIME,
    },
    runtime::Runtime,
};
use errors::ErrorMetadata;
use futures::future::try_join_all;
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

use self::{
    load_cache::PreAggregationLoadCache,
    loader::BuildPayload,
    partition_range_loader::PreAggregationPartitionRangeLoader,
};
use crate::{
    driver::{
        CreateTableIndex,
        DriverInterface,
        QueryHandleRegistry,
        TableStructure,
    },
    query_cache::{
        QueryBody,
        QueryCache,
        QueryWithParams,
        DEFAULT_DATA_SOURCE,
    },
    queue::{
        query_queue::{
            JobContext,
            JobHandler,
            QueueOptions,
            QueuedQuery,
        },
        JobKind,
        QueryDef,
        QueryKey,
        QueryKeyHash,
        QueryQueue,
    },
};

pub mod load_cache;
pub mod loader;
pub mod partition_range_loader;
pub mod time_series;
pub mod version;

pub use self::{
    time_series::QueryDateRange,
    version::{
        structure_version,
        target_table_name,
        VersionEntries,
        VersionEntry,
    },
};

/// An index built next to a pre-aggregation table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescription {
    pub sql: QueryWithParams,
    /// Logical index name, versioned like the table it belongs to.
    pub index_name: String,
}

/// Everything needed to build and locate one pre-aggregation, as produced
/// by the query compiler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreAggregationDescription {
    pub pre_aggregation_id: String,
    /// Logical `schema.table` name, replaced by the physical one in queries.
    pub table_name: String,
    pub pre_aggregations_schema: String,
    pub data_source: Option<String>,
    /// Builds the table; `table_name` in the SQL is the build target.
    pub load_sql: QueryWithParams,
    /// Plain select behind `load_sql`, used when exporting to an external
    /// store.
    pub sql: Option<QueryWithParams>,
    /// Version source that ignores partition boundaries.
    pub structure_version_load_sql: Option<QueryWithParams>,
    pub invalidate_key_queries: Vec<QueryWithParams>,
    pub partition_invalidate_key_queries: Option<Vec<QueryWithParams>>,
    pub indexes_sql: Vec<IndexDescription>,
    pub create_table_indexes: Vec<CreateTableIndex>,
    pub aggregations_columns: Vec<String>,
    pub unique_key_columns: Option<Vec<String>>,
    pub preview_sql: Option<QueryWithParams>,
    /// Stored in the external pre-aggregation store.
    pub external: bool,
    pub read_only: bool,
    pub priority: Option<i64>,
    pub timezone: Option<String>,
    pub timestamp_format: Option<String>,
    pub timestamp_precision: Option<usize>,
    pub partition_granularity: Option<String>,
    /// Queries for the first and last timestamp of the source data.
    pub pre_aggregation_start_end_queries: Option<(QueryWithParams, QueryWithParams)>,
    pub matched_time_dimension_date_range: Option<QueryDateRange>,
    /// Set on the single-partition descriptions derived from a partitioned
    /// one.
    pub expanded_partition: bool,
    pub build_range_start: Option<String>,
    pub build_range_end: Option<String>,
    pub seal_at: Option<String>,
    pub update_window_seconds: Option<u64>,
    pub rollup_lambda_id: Option<String>,
    pub last_rollup_lambda: bool,
    pub stream_offset: Option<String>,
    pub output_column_types: Option<TableStructure>,
}

impl PreAggregationDescription {
    pub fn data_source(&self) -> &str {
        self.data_source.as_deref().unwrap_or(DEFAULT_DATA_SOURCE)
    }

    pub fn timezone(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }

    pub fn timestamp_precision(&self) -> usize {
        self.timestamp_precision.unwrap_or(3)
    }

    pub fn priority(&self, default: i64) -> i64 {
        self.priority.unwrap_or(default)
    }
}

/// Source query whose rows are appended to a lambda rollup at read time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LambdaQuery {
    pub sql_and_params: QueryWithParams,
    pub cache_key_queries: Vec<QueryWithParams>,
}

/// Rows shipped along with a query instead of living in a table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineTable {
    pub name: String,
    pub columns: TableStructure,
    pub rows: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPreAggregationResult {
    /// Physical table, or a parenthesized union for partitioned ones.
    pub target_table_name: String,
    pub refresh_key_values: Vec<Value>,
    pub last_updated_at: Option<i64>,
    pub build_range_end: Option<String>,
    pub lambda_table: Option<InlineTable>,
    /// Queue key of the build, for jobs.
    pub query_key: Option<Value>,
    pub rollup_lambda_id: Option<String>,
    pub partition_range: Option<QueryDateRange>,
}

/// Logical table name with its load result.
pub type PreAggTableToTempTable = (String, LoadPreAggregationResult);

/// Per-request switches of the loaders.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub request_id: Option<String>,
    /// Enqueue builds and return without waiting.
    pub is_job: bool,
    pub wait_for_renew: bool,
    pub force_build: bool,
    /// Never build, only use what a refresh worker built.
    pub external_refresh: bool,
    pub orphaned_timeout: Option<Duration>,
    pub lambda_query: Option<LambdaQuery>,
    pub max_partitions: usize,
    pub max_source_row_limit: usize,
}

#[derive(Clone, Debug)]
pub struct PreAggregationsOptions {
    pub queue_options: QueueOptions,
    pub load_cache_queue_options: QueueOptions,
    pub external_refresh: bool,
    pub max_partitions: usize,
    pub max_source_row_limit: usize,
    pub schema_cache_expire: Duration,
    /// Superseded structures stay this long after their last build.
    pub structure_version_persist_time: Duration,
    pub touch_table_persist_time: Duration,
    pub used_table_persist_time: Duration,
    /// Once the refresh worker reached the end, keep only touched tables.
    pub drop_pre_aggregations_without_touch: bool,
    pub touch_cache_max_count: usize,
    pub touch_cache_ttl: Duration,
}

impl Default for PreAggregationsOptions {
    fn default() -> Self {
        Self {
            queue_options: QueueOptions {
                concurrency: 1,
                ..QueueOptions::default()
            },
            load_cache_queue_options: QueueOptions {
                concurrency: 4,
                ..QueueOptions::default()
            },
            external_refresh: false,
            max_partitions: *MAX_PARTITIONS_PER_PRE_AGGREGATION,
            max_source_row_limit: *LAMBDA_MAX_SOURCE_ROW_LIMIT,
            schema_cache_expire: *PRE_AGGREGATIONS_SCHEMA_CACHE_EXPIRE,
            structure_version_persist_time: *STRUCTURE_VERSION_PERSIST_TIME,
            touch_table_persist_time: *TOUCH_PRE_AGG_TIMEOUT,
            used_table_persist_time: *USED_TABLE_PERSIST_TIME,
            drop_pre_aggregations_without_touch: false,
            touch_cache_max_count: *TOUCH_CACHE_MAX_COUNT,
            touch_cache_ttl: *TOUCH_CACHE_TTL,
        }
    }
}

/// Result of [`PreAggregations::load_all_pre_aggregations_if_needed`].
#[derive(Clone, Debug, Default)]
pub struct LoadedPreAggregations {
    pub tables_to_temp_tables: Vec<PreAggTableToTempTable>,
    /// Query values with the build range placeholders substituted, if the
    /// query had any.
    pub values: Option<Vec<Value>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionsBuildRangeCache {
    pub pre_aggregation: PreAggregationDescription,
    pub is_cached: bool,
}

#[derive(Clone, Debug)]
pub struct ExpandedPreAggregations {
    /// `body` with every partitioned pre-aggregation replaced by its
    /// partitions.
    pub body: QueryBody,
    pub grouped_partition_pre_aggregations: Vec<Vec<PreAggregationDescription>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionStatus {
    Built,
    Building,
    Missing,
}

struct PreAggregationsInner<RT: Runtime> {
    rt: RT,
    query_cache: QueryCache<RT>,
    options: PreAggregationsOptions,
    queues: Mutex<BTreeMap<String, QueryQueue<RT>>>,
    load_cache_queues: Mutex<BTreeMap<String, QueryQueue<RT>>>,
    /// Table name to the unix millis of its last recorded touch.
    touch_cache: Mutex<LruCache<String, i64>>,
}

#[derive(Clone)]
pub struct PreAggregations<RT: Runtime> {
    inner: Arc<PreAggregationsInner<RT>>,
}

impl<RT: Runtime> PreAggregations<RT> {
    pub fn new(rt: RT, query_cache: QueryCache<RT>, options: PreAggregationsOptions) -> Self {
        let touch_cache_size =
            NonZeroUsize::new(options.touch_cache_max_count).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(PreAggregationsInner {
                rt,
                query_cache,
                options,
                queues: Mutex::new(BTreeMap::new()),
                load_cache_queues: Mutex::new(BTreeMap::new()),
                touch_cache: Mutex::new(LruCache::new(touch_cache_size)),
            }),
        }
    }

    pub fn rt(&self) -> &RT {
        &self.inner.rt
    }

    pub fn query_cache(&self) -> &QueryCache<RT> {
        &self.inner.query_cache
    }

    pub fn options(&self) -> &PreAggregationsOptions {
        &self.inner.options
    }

    /// Driver of the source, or of the external store for external
    /// pre-aggregations.
    pub fn driver(&self, data_source: &str, external: bool) -> anyhow::Result<Arc<dyn DriverInterface>> {
        if !external {
            return self.inner.query_cache.driver_factory().driver(data_source);
        }
        let Some(factory) = self.inner.query_cache.external_driver_factory() else {
            anyhow::bail!(ErrorMetadata::bad_request(
                "NoExternalDriver",
                "An external driver is required to build external pre-aggregations"
            ));
        };
        factory.driver(data_source)
    }

    pub fn new_load_cache(
        &self,
        data_source: &str,
        request_id: Option<String>,
    ) -> Arc<PreAggregationLoadCache<RT>> {
        Arc::new(PreAggregationLoadCache::new(
            self.clone(),
            data_source.to_owned(),
            request_id,
        ))
    }

    fn load_options(&self, body: &QueryBody, force_build: bool) -> LoadOptions {
        LoadOptions {
            request_id: body.request_id.clone(),
            is_job: body.is_job,
            wait_for_renew: body.renew_query,
            force_build,
            external_refresh: self.inner.options.external_refresh,
            orphaned_timeout: body.orphaned_timeout.map(Duration::from_secs),
            lambda_query: None,
            max_partitions: self.inner.options.max_partitions,
            max_source_row_limit: self.inner.options.max_source_row_limit,
        }
    }

    /// Build queue of a data source. Runs one build at a time.
    pub fn get_queue(&self, data_source: &str) -> anyhow::Result<QueryQueue<RT>> {
        if let Some(queue) = self.inner.queues.lock().get(data_source) {
            return Ok(queue.clone());
        }
        let handlers = btreemap! {
            JobKind::Query => Arc::new(PreAggregationBuildHandler {
                pre_aggregations: Arc::downgrade(&self.inner),
                handles: QueryHandleRegistry::default(),
            }) as Arc<dyn JobHandler>,
        };
        let queue = QueryQueue::new(
            self.inner.rt.clone(),
            format!(
                "SQL_PRE_AGGREGATIONS_{}_{data_source}",
                self.inner.query_cache.prefix()
            ),
            self.inner.options.queue_options.clone(),
            handlers,
            &*self.inner.query_cache.queue_factory(),
        )?;
        Ok(self
            .inner
            .queues
            .lock()
            .entry(data_source.to_owned())
            .or_insert(queue)
            .clone())
    }

    /// Queue refreshing the cached schema listings of a data source.
    pub fn get_load_cache_queue(&self, data_source: &str) -> anyhow::Result<QueryQueue<RT>> {
        if let Some(queue) = self.inner.load_cache_queues.lock().get(data_source) {
            return Ok(queue.clone());
        }
        let handlers = btreemap! {
            JobKind::Query => Arc::new(FetchTablesHandler {
                pre_aggregations: Arc::downgrade(&self.inner),
            }) as Arc<dyn JobHandler>,
        };
        let queue = QueryQueue::new(
            self.inner.rt.clone(),
            format!(
                "SQL_PRE_AGGREGATIONS_CACHE_{}_{data_source}",
                self.inner.query_cache.prefix()
            ),
            self.inner.options.load_cache_queue_options.clone(),
            handlers,
            &*self.inner.query_cache.queue_factory(),
        )?;
        Ok(self
            .inner
            .load_cache_queues
            .lock()
            .entry(data_source.to_owned())
            .or_insert(queue)
            .clone())
    }

    pub fn queues(&self) -> Vec<QueryQueue<RT>> {
        let mut queues: Vec<_> = self.inner.queues.lock().values().cloned().collect();
        queues.extend(self.inner.load_cache_queues.lock().values().cloned());
        queues
    }

    fn tables_used_key(&self, table_name: &str) -> String {
        self.inner
            .query_cache
            .get_key("SQL_PRE_AGGREGATIONS_TABLES_USED", table_name)
    }

    fn tables_touched_key(&self, table_name: &str) -> String {
        self.inner
            .query_cache
            .get_key("SQL_PRE_AGGREGATIONS_TABLES_TOUCH", table_name)
    }

    fn refresh_end_reached_key(&self) -> String {
        self.inner
            .query_cache
            .get_key("SQL_PRE_AGGREGATIONS_REFRESH_END_REACHED", "")
    }

    async fn tables_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let keys = self
            .inner
            .query_cache
            .cache_driver()
            .keys_starting_with(prefix)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(prefix).map(str::to_owned))
            .collect())
    }

    /// Marks a physical table as used by a query, protecting it from the
    /// orphan sweep for the used-table persist time.
    pub async fn add_table_used(&self, table_name: &str) -> anyhow::Result<()> {
        self.inner
            .query_cache
            .cache_driver()
            .set(
                &self.tables_used_key(table_name),
                json!(true),
                self.inner.options.used_table_persist_time,
            )
            .await?;
        Ok(())
    }

    pub async fn tables_used(&self) -> anyhow::Result<Vec<String>> {
        self.tables_with_prefix(&self.tables_used_key("")).await
    }

    /// Records a read of `table_name`. Writes are debounced per table by the
    /// touch cache TTL.
    pub async fn update_last_touch(&self, table_name: &str) -> anyhow::Result<()> {
        let now = self.inner.rt.unix_millis();
        let ttl = i64::try_from(self.inner.options.touch_cache_ttl.as_millis()).unwrap_or(i64::MAX);
        {
            let mut touch_cache = self.inner.touch_cache.lock();
            if touch_cache
                .get(table_name)
                .is_some_and(|touched_at| now - *touched_at < ttl)
            {
                return Ok(());
            }
            touch_cache.put(table_name.to_owned(), now);
        }
        let result = self
            .inner
            .query_cache
            .cache_driver()
            .set(
                &self.tables_touched_key(table_name),
                json!(now),
                self.inner.options.touch_table_persist_time,
            )
            .await;
        if result.is_err() {
            self.inner.touch_cache.lock().pop(table_name);
        }
        result.map(|_| ())
    }

    pub async fn tables_touched(&self) -> anyhow::Result<Vec<String>> {
        self.tables_with_prefix(&self.tables_touched_key("")).await
    }

    /// Called by the refresh worker once it has gone through every
    /// pre-aggregation.
    pub async fn update_refresh_end_reached(&self) -> anyhow::Result<()> {
        self.inner
            .query_cache
            .cache_driver()
            .set(
                &self.refresh_end_reached_key(),
                json!(self.inner.rt.unix_millis()),
                self.inner.options.touch_table_persist_time,
            )
            .await?;
        Ok(())
    }

    pub async fn get_refresh_end_reached(&self) -> anyhow::Result<Option<i64>> {
        Ok(self
            .inner
            .query_cache
            .cache_driver()
            .get(&self.refresh_end_reached_key())
            .await?
            .and_then(|v| v.as_i64()))
    }

    /// Loads the pre-aggregations of `body` one after another, so later ones
    /// can reference the tables of earlier ones. Only the last one honors
    /// `force_build_pre_aggregations`, and it substitutes the build range
    /// placeholders of the query values.
    pub async fn load_all_pre_aggregations_if_needed(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<LoadedPreAggregations> {
        let mut load_caches: BTreeMap<String, Arc<PreAggregationLoadCache<RT>>> = BTreeMap::new();
        let mut loaded = LoadedPreAggregations::default();
        let count = body.pre_aggregations.len();
        for (i, pre_aggregation) in body.pre_aggregations.iter().enumerate() {
            let is_last = i + 1 == count;
            let data_source = pre_aggregation.data_source();
            let load_cache = load_caches
                .entry(format!(
                    "{data_source}_{}",
                    pre_aggregation.pre_aggregations_schema
                ))
                .or_insert_with(|| self.new_load_cache(data_source, body.request_id.clone()))
                .clone();
            let mut options = self.load_options(body, is_last && body.force_build_pre_aggregations);
            options.lambda_query = body
                .lambda_queries
                .get(&pre_aggregation.pre_aggregation_id)
                .cloned();
            let loader = PreAggregationPartitionRangeLoader::new(
                self.clone(),
                pre_aggregation.clone(),
                loaded.tables_to_temp_tables.clone(),
                load_cache,
                options,
            )?;
            let result = loader.load_pre_aggregations().await?;
            self.add_table_used(&result.target_table_name).await?;
            if is_last && !body.values.is_empty() {
                loaded.values = loader.replace_query_build_range_params(&body.values).await?;
            }
            loaded
                .tables_to_temp_tables
                .push((pre_aggregation.table_name.clone(), result));
        }
        Ok(loaded)
    }

    /// Whether the build range queries of each partitioned pre-aggregation
    /// have cached results.
    pub async fn check_partitions_build_range_cache(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<Vec<PartitionsBuildRangeCache>> {
        let mut result = Vec::with_capacity(body.pre_aggregations.len());
        for pre_aggregation in &body.pre_aggregations {
            let is_cached = match (
                &pre_aggregation.partition_granularity,
                &pre_aggregation.pre_aggregation_start_end_queries,
            ) {
                (Some(_), Some((start, end))) => {
                    let invalidate = pre_aggregation
                        .invalidate_key_queries
                        .first()
                        .map(QueryWithParams::key);
                    let mut cached = true;
                    for range_query in [start, end] {
                        let range_body = QueryBody {
                            query: range_query.sql.clone(),
                            values: range_query.params.clone(),
                            invalidate: invalidate.clone(),
                            ..Default::default()
                        };
                        cached &= self
                            .inner
                            .query_cache
                            .result_from_cache_if_exists(&range_body)
                            .await?
                            .is_some();
                    }
                    cached
                },
                _ => true,
            };
            result.push(PartitionsBuildRangeCache {
                pre_aggregation: pre_aggregation.clone(),
                is_cached,
            });
        }
        Ok(result)
    }

    /// Replaces each partitioned pre-aggregation of `body` by the
    /// descriptions of its partitions.
    pub async fn expand_partitions_in_pre_aggregations(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<ExpandedPreAggregations> {
        let mut load_caches: BTreeMap<String, Arc<PreAggregationLoadCache<RT>>> = BTreeMap::new();
        let mut loaders = Vec::with_capacity(body.pre_aggregations.len());
        for pre_aggregation in &body.pre_aggregations {
            let data_source = pre_aggregation.data_source();
            let load_cache = load_caches
                .entry(format!(
                    "{data_source}_{}",
                    pre_aggregation.pre_aggregations_schema
                ))
                .or_insert_with(|| self.new_load_cache(data_source, body.request_id.clone()))
                .clone();
            loaders.push(PreAggregationPartitionRangeLoader::new(
                self.clone(),
                pre_aggregation.clone(),
                vec![],
                load_cache,
                self.load_options(body, false),
            )?);
        }
        let partitions: Vec<_> = loaders
            .iter()
            .map(|loader| loader.partition_pre_aggregations())
            .collect();
        let grouped = try_join_all(partitions).await?;
        Ok(ExpandedPreAggregations {
            body: QueryBody {
                pre_aggregations: grouped.iter().flatten().cloned().collect(),
                ..body.clone()
            },
            grouped_partition_pre_aggregations: grouped,
        })
    }

    /// Version entries of every schema the pre-aggregations live in, one list
    /// per distinct schema listing.
    pub async fn get_version_entries(
        &self,
        pre_aggregations: &[PreAggregationDescription],
        request_id: Option<String>,
    ) -> anyhow::Result<Vec<Vec<VersionEntry>>> {
        let mut load_caches: BTreeMap<String, Arc<PreAggregationLoadCache<RT>>> = BTreeMap::new();
        let mut result = Vec::new();
        for pre_aggregation in pre_aggregations {
            let data_source = pre_aggregation.data_source();
            let load_cache = load_caches
                .entry(format!(
                    "{data_source}_{}",
                    pre_aggregation.pre_aggregations_schema
                ))
                .or_insert_with(|| self.new_load_cache(data_source, request_id.clone()))
                .clone();
            if result.len() < load_caches.len() {
                let entries = load_cache.get_version_entries(pre_aggregation).await?;
                result.push(entries.version_entries);
            }
        }
        Ok(result)
    }

    /// Whether the physical `table_name` exists in `schema`, and if not,
    /// whether the build identified by `query_key` is queued.
    pub async fn is_partition_exist(
        &self,
        request_id: Option<String>,
        external: bool,
        data_source: &str,
        schema: &str,
        table_name: &str,
        query_key: &QueryKey,
    ) -> anyhow::Result<PartitionStatus> {
        let load_cache = self.new_load_cache(data_source, request_id);
        let description = PreAggregationDescription {
            pre_aggregations_schema: schema.to_owned(),
            data_source: Some(data_source.to_owned()),
            external,
            ..Default::default()
        };
        let tables = load_cache.fetch_tables(&description).await?;
        if tables
            .iter()
            .any(|table| format!("{schema}.{}", table.table_name) == table_name)
        {
            return Ok(PartitionStatus::Built);
        }
        let queue = self.get_queue(data_source)?;
        let hash = queue.redis_hash(query_key);
        let queued = queue
            .get_queries()
            .await?
            .iter()
            .any(|query| query.query_key_hash == hash);
        Ok(if queued {
            PartitionStatus::Building
        } else {
            PartitionStatus::Missing
        })
    }

    pub async fn get_queue_state(&self, data_source: &str) -> anyhow::Result<Vec<QueuedQuery>> {
        self.get_queue(data_source)?.get_queries().await
    }

    /// Cancels builds by hash. Returns, per hash, whether it was queued.
    pub async fn cancel_queries_from_queue(
        &self,
        hashes: &[QueryKeyHash],
        data_source: &str,
    ) -> anyhow::Result<Vec<bool>> {
        let queue = self.get_queue(data_source)?;
        let mut canceled = Vec::with_capacity(hashes.len());
        for hash in hashes {
            canceled.push(queue.cancel_query(hash).await?);
        }
        Ok(canceled)
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        for queue in self.queues() {
            queue.shutdown().await?;
        }
        Ok(())
    }
}

fn upgrade<RT: Runtime>(
    pre_aggregations: &Weak<PreAggregationsInner<RT>>,
) -> anyhow::Result<PreAggregations<RT>> {
    let inner = pre_aggregations
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("Pre-aggregations were shut down"))?;
    Ok(PreAggregations { inner })
}

/// Builds one pre-aggregation table.
struct PreAggregationBuildHandler<RT: Runtime> {
    pre_aggregations: Weak<PreAggregationsInner<RT>>,
    handles: QueryHandleRegistry,
}

#[async_trait]
impl<RT: Runtime> JobHandler for PreAggregationBuildHandler<RT> {
    async fn execute(&self, query: Value, context: JobContext) -> anyhow::Result<Value> {
        let pre_aggregations = upgrade(&self.pre_aggregations)?;
        let payload: BuildPayload = serde_json::from_value(query)?;
        let driver = pre_aggregations.driver(payload.pre_aggregation.data_source(), false)?;
        let handle = self.handles.register(driver.clone());
        context.set_cancel_handler(json!(handle.id())).await;
        let result = loader::refresh(&pre_aggregations, payload, driver, &handle).await;
        self.handles.complete(handle.id());
        result?;
        Ok(Value::Null)
    }

    async fn cancel(&self, query: &QueryDef) -> anyhow::Result<()> {
        if let Some(id) = query.cancel_handler.as_ref().and_then(Value::as_u64) {
            self.handles.cancel(id).await?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchTablesPayload {
    pre_aggregation: PreAggregationDescription,
    request_id: Option<String>,
}

/// Refreshes the cached table listing of one schema.
struct FetchTablesHandler<RT: Runtime> {
    pre_aggregations: Weak<PreAggregationsInner<RT>>,
}

#[async_trait]
impl<RT: Runtime> JobHandler for FetchTablesHandler<RT> {
    async fn execute(&self, query: Value, _context: JobContext) -> anyhow::Result<Value> {
        let pre_aggregations = upgrade(&self.pre_aggregations)?;
        let payload: FetchTablesPayload = serde_json::from_value(query)?;
        let load_cache = pre_aggregations.new_load_cache(
            payload.pre_aggregation.data_source(),
            payload.request_id,
        );
        let tables = load_cache.fetch_tables(&payload.pre_aggregation).await?;
        Ok(serde_json::to_value(tables)?)
    }

    async fn cancel(&self, _query: &QueryDef) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use common::runtime::Runtime;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::{
        PreAggregationDescription,
        PreAggregations,
        PreAggregationsOptions,
    };
    use crate::{
        driver::{
            mock::MockDriver,
            DriverInterface,
        },
        query_cache::{
            QueryBody,
            QueryCache,
            QueryCacheOptions,
            QueryWithParams,
        },
        queue::local::LocalDriverFactory,
    };

    pub(crate) struct Fixture {
        pub source: Arc<MockDriver>,
        pub external: Arc<MockDriver>,
        pub pre_aggregations: PreAggregations<TestRuntime>,
    }

    pub(crate) fn fixture_with(
        rt: &TestRuntime,
        source: MockDriver,
        external: MockDriver,
        options: PreAggregationsOptions,
    ) -> anyhow::Result<Fixture> {
        let source = Arc::new(source);
        let external = Arc::new(external);
        let source_driver = source.clone();
        let external_driver = external.clone();
        let query_cache = QueryCache::new(
            rt.clone(),
            "TEST",
            Arc::new(move |_: &str| -> anyhow::Result<Arc<dyn DriverInterface>> {
                Ok(source_driver.clone())
            }),
            Some(Arc::new(
                move |_: &str| -> anyhow::Result<Arc<dyn DriverInterface>> {
                    Ok(external_driver.clone())
                },
            )),
            Arc::new(LocalDriverFactory::new(rt.clone())),
            QueryCacheOptions::default(),
        )?;
        Ok(Fixture {
            source,
            external,
            pre_aggregations: PreAggregations::new(rt.clone(), query_cache, options),
        })
    }

    pub(crate) fn fixture(rt: &TestRuntime) -> anyhow::Result<Fixture> {
        fixture_with(
            rt,
            MockDriver::new(),
            MockDriver::new(),
            PreAggregationsOptions::default(),
        )
    }

    pub(crate) fn orders_pre_aggregation() -> PreAggregationDescription {
        PreAggregationDescription {
            pre_aggregation_id: "Orders.main".to_owned(),
            table_name: "pre.orders_main".to_owned(),
            pre_aggregations_schema: "pre".to_owned(),
            load_sql: QueryWithParams::new(
                "CREATE TABLE pre.orders_main AS SELECT status, count(*) FROM orders GROUP BY 1",
                vec![],
            ),
            invalidate_key_queries: vec![QueryWithParams::new(
                "SELECT max(updated_at) FROM orders",
                vec![],
            )],
            ..Default::default()
        }
    }

    #[orchestrator_macro::test_runtime]
    async fn test_touch_is_debounced(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        f.pre_aggregations.update_last_touch("pre.orders_a").await?;
        let first = rt.unix_millis();
        rt.wait(Duration::from_secs(10)).await;
        f.pre_aggregations.update_last_touch("pre.orders_a").await?;
        let stored = f
            .pre_aggregations
            .query_cache()
            .cache_driver()
            .get(&f.pre_aggregations.tables_touched_key("pre.orders_a"))
            .await?;
        assert_eq!(stored, Some(json!(first)));
        assert_eq!(f.pre_aggregations.tables_touched().await?, vec!["pre.orders_a"]);

        rt.wait(Duration::from_secs(61)).await;
        f.pre_aggregations.update_last_touch("pre.orders_a").await?;
        let stored = f
            .pre_aggregations
            .query_cache()
            .cache_driver()
            .get(&f.pre_aggregations.tables_touched_key("pre.orders_a"))
            .await?;
        assert_eq!(stored, Some(json!(rt.unix_millis())));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_tables_used_expire(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        f.pre_aggregations.add_table_used("pre.orders_a_b_c").await?;
        assert_eq!(f.pre_aggregations.tables_used().await?, vec!["pre.orders_a_b_c"]);
        rt.wait(Duration::from_secs(601)).await;
        assert!(f.pre_aggregations.tables_used().await?.is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_build_range_cache_check(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        let body = QueryBody {
            pre_aggregations: vec![
                orders_pre_aggregation(),
                PreAggregationDescription {
                    partition_granularity: Some("day".to_owned()),
                    pre_aggregation_start_end_queries: Some((
                        QueryWithParams::new("SELECT min(created_at) FROM orders", vec![]),
                        QueryWithParams::new("SELECT max(created_at) FROM orders", vec![]),
                    )),
                    ..orders_pre_aggregation()
                },
            ],
            ..Default::default()
        };
        let checked = f
            .pre_aggregations
            .check_partitions_build_range_cache(&body)
            .await?;
        assert!(checked[0].is_cached);
        assert!(!checked[1].is_cached);
        Ok(())
    }
}
