//! Per-request memo of what the loaders read repeatedly: schema listings,
//! the version entries derived from them, refresh-key results and the build
//! queue snapshot.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    time::Duration,
};

use common::runtime::Runtime;
use parking_lot::Mutex;
use serde_json::{
    json,
    Value,
};

use super::{
    version::{
        tables_to_version_entries,
        target_table_name,
        VersionEntries,
        VersionEntry,
    },
    FetchTablesPayload,
    PreAggregationDescription,
    PreAggregations,
};
use crate::{
    driver::{
        TableCacheEntry,
        TableStructure,
    },
    query_cache::{
        CacheQueryOptions,
        QueryWithParams,
    },
    queue::{
        query_queue::{
            ExecuteOptions,
            QueryStage,
        },
        JobKind,
        QueryKey,
        QueryStageState,
    },
};

const KEY_QUERY_EXPIRATION: Duration = Duration::from_secs(60 * 60);

const KEY_QUERY_RENEWAL_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Default)]
struct LoadCacheState {
    tables: BTreeMap<String, Vec<TableCacheEntry>>,
    version_entries: BTreeMap<String, VersionEntries>,
    key_query_results: BTreeMap<String, Value>,
    query_stage_state: Option<QueryStageState>,
}

pub struct PreAggregationLoadCache<RT: Runtime> {
    pre_aggregations: PreAggregations<RT>,
    data_source: String,
    request_id: Option<String>,
    state: Mutex<LoadCacheState>,
}

impl<RT: Runtime> PreAggregationLoadCache<RT> {
    pub fn new(
        pre_aggregations: PreAggregations<RT>,
        data_source: String,
        request_id: Option<String>,
    ) -> Self {
        Self {
            pre_aggregations,
            data_source,
            request_id,
            state: Mutex::new(LoadCacheState::default()),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Cache driver key of the table listing `pre_aggregation` lives in.
    pub fn tables_cache_key(&self, pre_aggregation: &PreAggregationDescription) -> String {
        let suffix = if pre_aggregation.external { "_EXT" } else { "" };
        self.pre_aggregations.query_cache().get_key(
            "SQL_PRE_AGGREGATIONS_TABLES",
            &format!(
                "{}{}{suffix}",
                self.data_source, pre_aggregation.pre_aggregations_schema
            ),
        )
    }

    /// Lists the schema on the driver and stores the listing in the cache
    /// driver.
    pub async fn fetch_tables(
        &self,
        pre_aggregation: &PreAggregationDescription,
    ) -> anyhow::Result<Vec<TableCacheEntry>> {
        let driver = self
            .pre_aggregations
            .driver(&self.data_source, pre_aggregation.external)?;
        let tables = driver
            .get_tables_query(&pre_aggregation.pre_aggregations_schema)
            .await?;
        self.pre_aggregations
            .query_cache()
            .cache_driver()
            .set(
                &self.tables_cache_key(pre_aggregation),
                serde_json::to_value(&tables)?,
                self.pre_aggregations.options().schema_cache_expire,
            )
            .await?;
        Ok(tables)
    }

    /// The stored listing, refetched through the load-cache queue when
    /// missing.
    async fn tables_from_cache(
        &self,
        pre_aggregation: &PreAggregationDescription,
    ) -> anyhow::Result<Vec<TableCacheEntry>> {
        let key = self.tables_cache_key(pre_aggregation);
        let stored = self
            .pre_aggregations
            .query_cache()
            .cache_driver()
            .get(&key)
            .await?;
        if let Some(stored) = stored {
            return Ok(serde_json::from_value(stored)?);
        }
        let queue = self
            .pre_aggregations
            .get_load_cache_queue(&self.data_source)?;
        let payload = serde_json::to_value(FetchTablesPayload {
            pre_aggregation: pre_aggregation.clone(),
            request_id: self.request_id.clone(),
        })?;
        let tables = queue
            .execute_in_queue(
                JobKind::Query,
                json!(["Fetch tables", key]),
                payload,
                Some(0),
                ExecuteOptions {
                    request_id: self.request_id.clone(),
                    ..Default::default()
                },
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("Fetching tables for {key} returned no result"))?;
        Ok(serde_json::from_value(tables)?)
    }

    pub async fn get_tables_query(
        &self,
        pre_aggregation: &PreAggregationDescription,
    ) -> anyhow::Result<Vec<TableCacheEntry>> {
        let key = self.tables_cache_key(pre_aggregation);
        if let Some(tables) = self.state.lock().tables.get(&key) {
            return Ok(tables.clone());
        }
        let tables = self.tables_from_cache(pre_aggregation).await?;
        self.state.lock().tables.insert(key, tables.clone());
        Ok(tables)
    }

    /// Version entries of the schema. For source pre-aggregations, tables
    /// whose build is still queued are left out.
    pub async fn get_version_entries(
        &self,
        pre_aggregation: &PreAggregationDescription,
    ) -> anyhow::Result<VersionEntries> {
        let key = self.tables_cache_key(pre_aggregation);
        if let Some(entries) = self.state.lock().version_entries.get(&key) {
            return Ok(entries.clone());
        }
        let tables = self.get_tables_query(pre_aggregation).await?;
        let mut entries =
            tables_to_version_entries(&pre_aggregation.pre_aggregations_schema, &tables);
        if !pre_aggregation.external {
            let state = self.fetch_query_stage_state().await?;
            let queued: BTreeSet<String> = state
                .defs
                .values()
                .filter_map(|def| def.query.get("newVersionEntry"))
                .filter_map(|entry| serde_json::from_value::<VersionEntry>(entry.clone()).ok())
                .map(|entry| target_table_name(&entry))
                .collect();
            entries.retain(|entry| !queued.contains(&target_table_name(entry)));
        }
        let entries = VersionEntries::new(entries);
        self.state
            .lock()
            .version_entries
            .insert(key, entries.clone());
        Ok(entries)
    }

    /// Result of a refresh-key query, computed at most once per request.
    pub async fn key_query_result(
        &self,
        query: &QueryWithParams,
        wait_for_renew: bool,
        priority: i64,
    ) -> anyhow::Result<Value> {
        let query_cache = self.pre_aggregations.query_cache();
        let redis_key = query_cache.query_redis_key(&query.key());
        if let Some(result) = self.state.lock().key_query_results.get(&redis_key) {
            return Ok(result.clone());
        }
        let renewal_threshold = query_cache
            .refresh_key_renewal_threshold()
            .or(query.options.renewal_threshold.map(Duration::from_secs))
            .unwrap_or(KEY_QUERY_RENEWAL_THRESHOLD);
        let result = query_cache
            .cache_query_result(
                &query.sql,
                &query.params,
                query.key(),
                KEY_QUERY_EXPIRATION,
                CacheQueryOptions {
                    renewal_threshold: Some(renewal_threshold),
                    renewal_key: Some(query.key()),
                    priority: Some(priority),
                    external: query.options.external.unwrap_or(false),
                    request_id: self.request_id.clone(),
                    data_source: Some(self.data_source.clone()),
                    wait_for_renew,
                    force_no_cache: false,
                    use_in_memory_cache: true,
                },
            )
            .await?;
        self.state
            .lock()
            .key_query_results
            .insert(redis_key, result.clone());
        Ok(result)
    }

    pub fn has_key_query_result(&self, query: &QueryWithParams) -> bool {
        let redis_key = self
            .pre_aggregations
            .query_cache()
            .query_redis_key(&query.key());
        self.state.lock().key_query_results.contains_key(&redis_key)
    }

    pub async fn fetch_query_stage_state(&self) -> anyhow::Result<QueryStageState> {
        if let Some(state) = &self.state.lock().query_stage_state {
            return Ok(state.clone());
        }
        let state = self
            .pre_aggregations
            .get_queue(&self.data_source)?
            .fetch_query_stage_state()
            .await?;
        self.state.lock().query_stage_state = Some(state.clone());
        Ok(state)
    }

    pub async fn get_query_stage(
        &self,
        stage_query_key: &QueryKey,
    ) -> anyhow::Result<Option<QueryStage>> {
        let queue = self.pre_aggregations.get_queue(&self.data_source)?;
        let state = self.fetch_query_stage_state().await?;
        queue
            .get_query_stage(stage_query_key, None, Some(&state))
            .await
    }

    /// Relists the schema and forgets everything derived from it. Lists
    /// directly rather than through the load-cache queue, so a fetch that
    /// started before the caller's build can't be joined.
    pub async fn reset(&self, pre_aggregation: &PreAggregationDescription) -> anyhow::Result<()> {
        self.fetch_tables(pre_aggregation).await?;
        let mut state = self.state.lock();
        state.tables.clear();
        state.version_entries.clear();
        state.query_stage_state = None;
        Ok(())
    }

    pub async fn get_table_column_types(
        &self,
        pre_aggregation: &PreAggregationDescription,
        table_name: &str,
    ) -> anyhow::Result<TableStructure> {
        self.pre_aggregations
            .driver(&self.data_source, pre_aggregation.external)?
            .table_column_types(table_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use crate::{
        driver::mock::row,
        pre_aggregations::tests::{
            fixture,
            orders_pre_aggregation,
        },
    };

    #[orchestrator_macro::test_runtime]
    async fn test_listing_is_cached_until_reset(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        f.source.add_table("pre.orders_main_a_b_1il7s80", vec![]);
        let p = orders_pre_aggregation();
        let load_cache = f.pre_aggregations.new_load_cache("default", None);

        let entries = load_cache.get_version_entries(&p).await?;
        assert_eq!(entries.version_entries.len(), 1);
        assert_eq!(entries.by_table_name["pre.orders_main"].content_version, "a");

        f.source.add_table("pre.orders_main_c_b_1il7s81", vec![]);
        let entries = load_cache.get_version_entries(&p).await?;
        assert_eq!(entries.version_entries.len(), 1);
        // Another request still reads the stored listing.
        let other = f.pre_aggregations.new_load_cache("default", None);
        assert_eq!(other.get_version_entries(&p).await?.version_entries.len(), 1);

        load_cache.reset(&p).await?;
        let entries = load_cache.get_version_entries(&p).await?;
        assert_eq!(entries.version_entries.len(), 2);
        assert_eq!(entries.by_table_name["pre.orders_main"].content_version, "c");
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_key_query_result_is_memoized(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        let p = orders_pre_aggregation();
        let key_query = &p.invalidate_key_queries[0];
        f.source
            .on_query(&key_query.sql, vec![row(&[("max", json!(1))])]);
        let load_cache = f.pre_aggregations.new_load_cache("default", None);
        assert!(!load_cache.has_key_query_result(key_query));
        let first = load_cache.key_query_result(key_query, true, 10).await?;
        assert_eq!(first, json!([{"max": 1}]));
        assert!(load_cache.has_key_query_result(key_query));

        f.source
            .on_query(&key_query.sql, vec![row(&[("max", json!(2))])]);
        assert_eq!(load_cache.key_query_result(key_query, true, 10).await?, first);
        assert_eq!(f.source.count_statements(&key_query.sql), 1);
        Ok(())
    }
}
