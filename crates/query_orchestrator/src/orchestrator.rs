//! Entry point of the crate. [`QueryOrchestrator`] loads the pre-aggregations
//! a query needs, rewrites the query onto the tables that were loaded and
//! serves it through the [`QueryCache`].

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::runtime::Runtime;
use errors::ErrorMetadata;
use serde::Serialize;
use serde_json::{
    json,
    Value,
};

use crate::{
    driver::DriverFactory,
    pre_aggregations::{
        version::structure_version,
        ExpandedPreAggregations,
        LoadPreAggregationResult,
        PartitionStatus,
        PartitionsBuildRangeCache,
        PreAggTableToTempTable,
        PreAggregationDescription,
        PreAggregations,
        PreAggregationsOptions,
        VersionEntry,
    },
    query_cache::{
        query_cache_key,
        replace_pre_aggregation_table_names,
        CachedQueryResult,
        QueryBody,
        QueryCache,
        QueryCacheOptions,
        DEFAULT_DATA_SOURCE,
    },
    queue::{
        query_queue::{
            QueryStage,
            QueryStream,
            QueuedQuery,
        },
        CacheAndQueueDriverFactory,
        QueryKey,
        QueryKeyHash,
        QueryStageState,
    },
};

/// Priority of the blocking builds a waiting query can be stuck behind.
const PENDING_BUILD_PRIORITY: i64 = 10;

#[derive(Clone, Debug, Default)]
pub struct OrchestratorOptions {
    pub query_cache_options: QueryCacheOptions,
    pub pre_aggregations_options: PreAggregationsOptions,
    /// Refuse queries that no built pre-aggregation serves.
    pub rollup_only_mode: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedPreAggregation {
    pub target_table_name: String,
    pub refresh_key_values: Vec<Value>,
    pub last_updated_at: Option<i64>,
}

/// A build enqueued by a job request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAggregationJob {
    pub pre_aggregation: String,
    pub table_name: String,
    #[serde(flatten)]
    pub result: LoadPreAggregationResult,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchQueryResult {
    /// `None` when the request only loaded pre-aggregations.
    pub data: Option<Value>,
    /// Unix millis of the oldest data the result is computed from.
    pub last_refresh_time: Option<i64>,
    pub refresh_key_values: Vec<Value>,
    /// Keyed by logical table name.
    pub used_pre_aggregations: BTreeMap<String, UsedPreAggregation>,
    pub data_source: Option<String>,
    pub external: bool,
    /// Filled for job requests without a query.
    pub pre_aggregation_jobs: Vec<PreAggregationJob>,
}

/// A pre-aggregation with the partitions it expands to.
#[derive(Clone, Debug, Default)]
pub struct PreAggregationPartitions {
    pub pre_aggregation: PreAggregationDescription,
    pub partitions: Vec<PreAggregationDescription>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAggregationVersionEntries {
    pub structure_versions_by_table_name: BTreeMap<String, String>,
    /// Only entries of the current structure, newest first.
    pub version_entries_by_table_name: BTreeMap<String, Vec<VersionEntry>>,
}

fn min_timestamp(timestamps: impl IntoIterator<Item = Option<i64>>) -> Option<i64> {
    timestamps.into_iter().flatten().min()
}

fn table_pairs(tables: &[PreAggTableToTempTable]) -> Vec<(String, String)> {
    tables
        .iter()
        .map(|(table_name, result)| (table_name.clone(), result.target_table_name.clone()))
        .collect()
}

#[derive(Clone)]
pub struct QueryOrchestrator<RT: Runtime> {
    query_cache: QueryCache<RT>,
    pre_aggregations: PreAggregations<RT>,
    rollup_only_mode: bool,
}

impl<RT: Runtime> QueryOrchestrator<RT> {
    pub fn new(
        rt: RT,
        prefix: impl Into<String>,
        driver_factory: Arc<dyn DriverFactory>,
        external_driver_factory: Option<Arc<dyn DriverFactory>>,
        queue_factory: Arc<dyn CacheAndQueueDriverFactory>,
        options: OrchestratorOptions,
    ) -> anyhow::Result<Self> {
        let query_cache = QueryCache::new(
            rt.clone(),
            prefix,
            driver_factory,
            external_driver_factory,
            queue_factory,
            options.query_cache_options,
        )?;
        let pre_aggregations = PreAggregations::new(
            rt,
            query_cache.clone(),
            options.pre_aggregations_options,
        );
        Ok(Self {
            query_cache,
            pre_aggregations,
            rollup_only_mode: options.rollup_only_mode,
        })
    }

    pub fn query_cache(&self) -> &QueryCache<RT> {
        &self.query_cache
    }

    pub fn pre_aggregations(&self) -> &PreAggregations<RT> {
        &self.pre_aggregations
    }

    /// Loads the pre-aggregations of `body` and runs its query against the
    /// loaded tables. Raises ContinueWait when a build or the query outlives
    /// the queue's wait timeout.
    pub async fn fetch_query(&self, body: &QueryBody) -> anyhow::Result<FetchQueryResult> {
        let loaded = self
            .pre_aggregations
            .load_all_pre_aggregations_if_needed(body)
            .await?;
        let body = match loaded.values {
            Some(values) => QueryBody {
                values,
                ..body.clone()
            },
            None => body.clone(),
        };
        let tables = loaded.tables_to_temp_tables;

        let used_pre_aggregations: BTreeMap<String, UsedPreAggregation> = tables
            .iter()
            .map(|(table_name, result)| {
                (
                    table_name.clone(),
                    UsedPreAggregation {
                        target_table_name: result.target_table_name.clone(),
                        refresh_key_values: result.refresh_key_values.clone(),
                        last_updated_at: result.last_updated_at,
                    },
                )
            })
            .collect();
        if self.rollup_only_mode && used_pre_aggregations.is_empty() {
            anyhow::bail!(ErrorMetadata::not_found(
                "NoPreAggregationBuilt",
                "No pre-aggregation table has been built for this query yet. Please check your \
                 refresh worker configuration if it persists."
            ));
        }
        let last_refresh_time = min_timestamp(tables.iter().map(|(_, r)| r.last_updated_at));

        if body.query.is_empty() {
            let pre_aggregation_jobs = if body.is_job {
                let pre_aggregation = body
                    .pre_aggregations
                    .first()
                    .map(|p| p.pre_aggregation_id.clone())
                    .unwrap_or_default();
                tables
                    .into_iter()
                    .map(|(table_name, result)| PreAggregationJob {
                        pre_aggregation: pre_aggregation.clone(),
                        table_name,
                        result,
                    })
                    .collect()
            } else {
                vec![]
            };
            return Ok(FetchQueryResult {
                last_refresh_time,
                used_pre_aggregations,
                pre_aggregation_jobs,
                ..Default::default()
            });
        }

        let CachedQueryResult {
            data,
            last_refresh_time: result_refresh_time,
            refresh_key_values,
        } = self
            .query_cache
            .cached_query_result(&body, &table_pairs(&tables))
            .await?;
        tracing::debug!(
            "Fetched query request_id={:?} with {} pre-aggregations",
            body.request_id,
            used_pre_aggregations.len()
        );
        Ok(FetchQueryResult {
            data: Some(data),
            last_refresh_time: min_timestamp([last_refresh_time, result_refresh_time]),
            refresh_key_values,
            used_pre_aggregations,
            data_source: body.data_source.clone(),
            external: body.external,
            pre_aggregation_jobs: vec![],
        })
    }

    /// Streams the rows of `body` from the data source once its
    /// pre-aggregations are loaded.
    pub async fn stream_query(&self, body: &QueryBody) -> anyhow::Result<QueryStream> {
        let loaded = self
            .pre_aggregations
            .load_all_pre_aggregations_if_needed(body)
            .await?;
        let values = loaded.values.unwrap_or_else(|| body.values.clone());
        let query = replace_pre_aggregation_table_names(
            &body.query,
            &table_pairs(&loaded.tables_to_temp_tables),
        );
        self.query_cache
            .query_stream(&query, &values, query_cache_key(body), body)
            .await
    }

    /// Where `body` currently waits: behind the first of its pre-aggregation
    /// builds that is pending, or in the query queue.
    pub async fn query_stage(&self, body: &QueryBody) -> anyhow::Result<Option<QueryStage>> {
        let mut states: BTreeMap<String, QueryStageState> = BTreeMap::new();
        let mut pending = None;
        for (i, pre_aggregation) in body.pre_aggregations.iter().enumerate() {
            let data_source = pre_aggregation.data_source();
            let queue = self.pre_aggregations.get_queue(data_source)?;
            if !states.contains_key(data_source) {
                let state = queue.fetch_query_stage_state().await?;
                states.insert(data_source.to_owned(), state);
            }
            let stage = queue
                .get_query_stage(
                    &json!(pre_aggregation.table_name),
                    Some(PENDING_BUILD_PRIORITY),
                    states.get(data_source),
                )
                .await?;
            if stage.is_some() {
                pending = Some((i, pre_aggregation));
                break;
            }
        }
        let Some((i, pre_aggregation)) = pending else {
            return self
                .query_cache
                .get_queue(body.data_source())?
                .get_query_stage(&query_cache_key(body), None, None)
                .await;
        };

        let data_source = pre_aggregation.data_source();
        let Some(stage) = self
            .pre_aggregations
            .get_queue(data_source)?
            .get_query_stage(
                &json!(pre_aggregation.table_name),
                None,
                states.get(data_source),
            )
            .await?
        else {
            return Ok(None);
        };
        let message = format!(
            "Building pre-aggregation {}/{}",
            i + 1,
            body.pre_aggregations.len()
        );
        Ok(Some(QueryStage {
            stage: if stage.stage.contains("queue") {
                format!("{message}: {}", stage.stage)
            } else {
                message
            },
            ..stage
        }))
    }

    /// Serves the preview rows of a built pre-aggregation.
    pub async fn get_pre_aggregation_preview(
        &self,
        request_id: Option<String>,
        pre_aggregation: &PreAggregationDescription,
    ) -> anyhow::Result<Value> {
        let Some(preview_sql) = &pre_aggregation.preview_sql else {
            return Ok(json!([]));
        };
        let result = self
            .fetch_query(&QueryBody {
                query: preview_sql.sql.clone(),
                values: preview_sql.params.clone(),
                external: pre_aggregation.external,
                data_source: pre_aggregation.data_source.clone(),
                request_id,
                pre_aggregations: vec![pre_aggregation.clone()],
                ..Default::default()
            })
            .await?;
        Ok(result.data.unwrap_or_else(|| json!([])))
    }

    pub async fn is_partition_exist(
        &self,
        request_id: Option<String>,
        external: bool,
        data_source: &str,
        schema: &str,
        table_name: &str,
        query_key: &QueryKey,
    ) -> anyhow::Result<PartitionStatus> {
        self.pre_aggregations
            .is_partition_exist(request_id, external, data_source, schema, table_name, query_key)
            .await
    }

    pub async fn result_from_cache_if_exists(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<Option<CachedQueryResult>> {
        self.query_cache.result_from_cache_if_exists(body).await
    }

    pub async fn test_connections(&self) -> anyhow::Result<()> {
        self.query_cache.test_connection().await
    }

    pub async fn cleanup(&self) -> anyhow::Result<()> {
        self.query_cache.cleanup().await
    }

    /// Version entries of the given pre-aggregations that match the current
    /// structure of their partitions.
    pub async fn get_pre_aggregation_version_entries(
        &self,
        pre_aggregations: &[PreAggregationPartitions],
        pre_aggregations_schema: &str,
        request_id: Option<String>,
    ) -> anyhow::Result<PreAggregationVersionEntries> {
        let descriptions: Vec<PreAggregationDescription> = pre_aggregations
            .iter()
            .map(|p| PreAggregationDescription {
                data_source: Some(
                    p.partitions
                        .first()
                        .and_then(|partition| partition.data_source.clone())
                        .unwrap_or_else(|| DEFAULT_DATA_SOURCE.to_owned()),
                ),
                pre_aggregations_schema: pre_aggregations_schema.to_owned(),
                ..p.pre_aggregation.clone()
            })
            .collect();
        let version_entries = self
            .pre_aggregations
            .get_version_entries(&descriptions, request_id)
            .await?;

        let structure_versions_by_table_name: BTreeMap<String, String> = pre_aggregations
            .iter()
            .flat_map(|p| &p.partitions)
            .map(|partition| (partition.table_name.clone(), structure_version(partition)))
            .collect();
        let mut version_entries_by_table_name: BTreeMap<String, Vec<VersionEntry>> =
            BTreeMap::new();
        for entry in version_entries.into_iter().flatten() {
            if structure_versions_by_table_name.get(&entry.table_name)
                == Some(&entry.structure_version)
            {
                version_entries_by_table_name
                    .entry(entry.table_name.clone())
                    .or_default()
                    .push(entry);
            }
        }
        Ok(PreAggregationVersionEntries {
            structure_versions_by_table_name,
            version_entries_by_table_name,
        })
    }

    pub async fn expand_partitions_in_pre_aggregations(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<ExpandedPreAggregations> {
        self.pre_aggregations
            .expand_partitions_in_pre_aggregations(body)
            .await
    }

    pub async fn check_partitions_build_range_cache(
        &self,
        body: &QueryBody,
    ) -> anyhow::Result<Vec<PartitionsBuildRangeCache>> {
        self.pre_aggregations
            .check_partitions_build_range_cache(body)
            .await
    }

    pub async fn get_pre_aggregation_queue_states(
        &self,
        data_source: &str,
    ) -> anyhow::Result<Vec<QueuedQuery>> {
        self.pre_aggregations.get_queue_state(data_source).await
    }

    pub async fn cancel_pre_aggregation_queries_from_queue(
        &self,
        hashes: &[QueryKeyHash],
        data_source: &str,
    ) -> anyhow::Result<Vec<bool>> {
        self.pre_aggregations
            .cancel_queries_from_queue(hashes, data_source)
            .await
    }

    pub async fn update_refresh_end_reached(&self) -> anyhow::Result<()> {
        self.pre_aggregations.update_refresh_end_reached().await
    }

    /// Shuts down the queues of the pre-aggregations and of the cache.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.pre_aggregations.shutdown().await?;
        self.query_cache.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use common::runtime::Runtime;
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::{
        OrchestratorOptions,
        PreAggregationPartitions,
        QueryOrchestrator,
    };
    use crate::{
        driver::{
            mock::{
                row,
                MockDriver,
            },
            DriverInterface,
        },
        pre_aggregations::{
            tests::orders_pre_aggregation,
            version::structure_version,
        },
        query_cache::QueryBody,
        queue::local::LocalDriverFactory,
    };

    fn orchestrator(
        rt: &TestRuntime,
        options: OrchestratorOptions,
    ) -> anyhow::Result<(Arc<MockDriver>, QueryOrchestrator<TestRuntime>)> {
        let source = Arc::new(MockDriver::new());
        let driver = source.clone();
        let orchestrator = QueryOrchestrator::new(
            rt.clone(),
            "TEST",
            Arc::new(move |_: &str| -> anyhow::Result<Arc<dyn DriverInterface>> {
                Ok(driver.clone())
            }),
            None,
            Arc::new(LocalDriverFactory::new(rt.clone())),
            options,
        )?;
        Ok((source, orchestrator))
    }

    fn rollup_body() -> QueryBody {
        QueryBody {
            query: "SELECT status, count FROM pre.orders_main".to_owned(),
            pre_aggregations: vec![orders_pre_aggregation()],
            ..Default::default()
        }
    }

    #[orchestrator_macro::test_runtime]
    async fn test_plain_query_is_cached(rt: TestRuntime) -> anyhow::Result<()> {
        let (source, orchestrator) = orchestrator(&rt, OrchestratorOptions::default())?;
        source.on_query("FROM orders", vec![row(&[("count", json!(3))])]);
        let body = QueryBody {
            query: "SELECT count(*) FROM orders".to_owned(),
            ..Default::default()
        };
        let first = orchestrator.fetch_query(&body).await?;
        assert_eq!(first.data, Some(json!([{"count": 3}])));
        assert!(first.used_pre_aggregations.is_empty());
        assert!(first.last_refresh_time.is_some());

        let second = orchestrator.fetch_query(&body).await?;
        assert_eq!(second.data, first.data);
        assert_eq!(source.count_statements("FROM orders"), 1);
        assert!(orchestrator
            .result_from_cache_if_exists(&body)
            .await?
            .is_some());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_query_runs_against_loaded_table(rt: TestRuntime) -> anyhow::Result<()> {
        let (source, orchestrator) = orchestrator(&rt, OrchestratorOptions::default())?;
        let p = orders_pre_aggregation();
        source.on_query(
            &p.invalidate_key_queries[0].sql,
            vec![row(&[("max", json!(1))])],
        );
        source.on_query(
            "FROM pre.orders_main",
            vec![row(&[("status", json!("shipped")), ("count", json!(2))])],
        );

        let result = orchestrator.fetch_query(&rollup_body()).await?;
        assert_eq!(result.data, Some(json!([{"status": "shipped", "count": 2}])));
        let used = &result.used_pre_aggregations["pre.orders_main"];
        assert!(used.target_table_name.starts_with("pre.orders_main_"));
        assert!(result.last_refresh_time <= used.last_updated_at);
        let select = format!("SELECT status, count FROM {}", used.target_table_name);
        assert_eq!(source.count_statements(&select), 1);

        let entries = orchestrator
            .get_pre_aggregation_version_entries(
                &[PreAggregationPartitions {
                    pre_aggregation: p.clone(),
                    partitions: vec![p.clone()],
                }],
                "pre",
                None,
            )
            .await?;
        assert_eq!(
            entries.structure_versions_by_table_name["pre.orders_main"],
            structure_version(&p)
        );
        assert_eq!(entries.version_entries_by_table_name["pre.orders_main"].len(), 1);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_rollup_only_mode_requires_pre_aggregation(rt: TestRuntime) -> anyhow::Result<()> {
        let (source, orchestrator) = orchestrator(
            &rt,
            OrchestratorOptions {
                rollup_only_mode: true,
                ..Default::default()
            },
        )?;
        let err = orchestrator
            .fetch_query(&QueryBody {
                query: "SELECT count(*) FROM orders".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err
            .to_string()
            .starts_with("No pre-aggregation table has been built for this query yet"));
        assert!(source.statements().is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_job_reports_build_stage(rt: TestRuntime) -> anyhow::Result<()> {
        let (source, orchestrator) = orchestrator(&rt, OrchestratorOptions::default())?;
        let p = orders_pre_aggregation();
        source.on_query(
            &p.invalidate_key_queries[0].sql,
            vec![row(&[("max", json!(1))])],
        );
        // Only the build is slow, the refresh key resolves right away.
        source.delay_query("GROUP BY 1", Duration::from_secs(10));
        let body = QueryBody {
            pre_aggregations: vec![p],
            is_job: true,
            force_build_pre_aggregations: true,
            ..Default::default()
        };

        let result = orchestrator.fetch_query(&body).await?;
        assert_eq!(result.data, None);
        assert_eq!(result.pre_aggregation_jobs.len(), 1);
        let job = &result.pre_aggregation_jobs[0];
        assert_eq!(job.pre_aggregation, "Orders.main");
        assert_eq!(job.table_name, "pre.orders_main");
        assert!(job.result.query_key.is_some());

        let stage = orchestrator
            .query_stage(&body)
            .await?
            .expect("build is pending");
        assert!(stage.stage.starts_with("Building pre-aggregation 1/1"));

        rt.wait(Duration::from_secs(30)).await;
        assert_eq!(source.count_statements("CREATE TABLE"), 1);
        assert_eq!(orchestrator.query_stage(&body).await?, None);
        Ok(())
    }
}
