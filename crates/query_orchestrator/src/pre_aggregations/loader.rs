//! Loads one (non-partitioned or single-partition) pre-aggregation: decides
//! from the version entries whether the built table can be served, needs a
//! background refresh or has to be built before answering, and runs the
//! build itself inside the build queue.

use std::{
    collections::BTreeSet,
    sync::Arc,
};

use common::{
    errors::report_error,
    knobs::DROP_ORPHANED_LOCK_TTL,
    runtime::Runtime,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use futures::{
    future::try_join_all,
    FutureExt,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    json,
    Value,
};

use super::{
    load_cache::PreAggregationLoadCache,
    version::{
        content_version,
        no_pre_aggregation_partitions_built_message,
        structure_version,
        tables_to_version_entries,
        target_table_name,
        VersionEntries,
        VersionEntry,
    },
    LoadOptions,
    LoadPreAggregationResult,
    PreAggregationDescription,
    PreAggregations,
};
use crate::{
    driver::{
        CreateTableIndex,
        DownloadTableData,
        DriverInterface,
        IndexSql,
        QueryHandle,
        QueryOptions,
        UnloadOptions,
        UploadOptions,
    },
    metrics::{
        log_pre_aggregation_build,
        log_pre_aggregation_tables_dropped,
    },
    query_cache::{
        replace_pre_aggregation_table_names,
        QueryWithParams,
    },
    queue::{
        query_queue::ExecuteOptions,
        JobKind,
    },
};

/// Priority of builds a request is blocked on.
const BLOCKING_BUILD_PRIORITY: i64 = 10;

/// Priority of refreshes of tables that can still be served.
const REFRESH_PRIORITY: i64 = 0;

/// What a build job needs to run in whichever process picks it up.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPayload {
    pub pre_aggregation: PreAggregationDescription,
    pub tables_to_temp_tables: Vec<(String, String)>,
    pub new_version_entry: VersionEntry,
    pub request_id: Option<String>,
    pub invalidation_keys: Value,
    pub build_range_end: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshStrategy {
    /// Build with `CREATE TABLE AS` in the source.
    StoreInSource,
    /// Build in the source, then export into the external store.
    WriteExternal,
    /// Export straight from the source query into the external store.
    ReadOnlyExternal,
}

impl RefreshStrategy {
    fn as_str(self) -> &'static str {
        match self {
            RefreshStrategy::StoreInSource => "store_in_source",
            RefreshStrategy::WriteExternal => "write_external",
            RefreshStrategy::ReadOnlyExternal => "read_only_external",
        }
    }
}

#[derive(Clone)]
pub struct PreAggregationLoader<RT: Runtime> {
    pre_aggregations: PreAggregations<RT>,
    pre_aggregation: PreAggregationDescription,
    /// Logical to physical names of the pre-aggregations loaded before this
    /// one in the same query.
    tables_to_temp_tables: Vec<(String, String)>,
    load_cache: Arc<PreAggregationLoadCache<RT>>,
    options: LoadOptions,
}

fn result_for(entry: &VersionEntry) -> LoadPreAggregationResult {
    LoadPreAggregationResult {
        target_table_name: target_table_name(entry),
        refresh_key_values: vec![],
        last_updated_at: Some(entry.last_updated_at),
        build_range_end: entry.build_range_end.clone(),
        ..Default::default()
    }
}

impl<RT: Runtime> PreAggregationLoader<RT> {
    pub fn new(
        pre_aggregations: PreAggregations<RT>,
        pre_aggregation: PreAggregationDescription,
        tables_to_temp_tables: Vec<(String, String)>,
        load_cache: Arc<PreAggregationLoadCache<RT>>,
        options: LoadOptions,
    ) -> anyhow::Result<Self> {
        if options.external_refresh && options.wait_for_renew {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidLoadOptions",
                "Invalid configuration: with external refresh nothing is renewed here, so \
                 waiting for the renew is not possible"
            ));
        }
        Ok(Self {
            pre_aggregations,
            pre_aggregation,
            tables_to_temp_tables,
            load_cache,
            options,
        })
    }

    pub fn pre_aggregation(&self) -> &PreAggregationDescription {
        &self.pre_aggregation
    }

    fn table_key(&self, version: &str) -> String {
        format!("{}_{version}", self.pre_aggregation.table_name)
    }

    /// Returns the table to serve. `None` only with external refresh when
    /// nothing is built and `throw_on_missing_partition` is unset.
    pub async fn load_pre_aggregation(
        &self,
        throw_on_missing_partition: bool,
    ) -> anyhow::Result<Option<LoadPreAggregationResult>> {
        let not_loaded_key = self
            .pre_aggregation
            .invalidate_key_queries
            .iter()
            .any(|query| !self.load_cache.has_key_query_result(query));
        if self.options.is_job || !(not_loaded_key && !self.options.wait_for_renew) {
            let result = self.load_pre_aggregation_with_keys().await?;
            let refresh_key_values = self.invalidation_key_values().await?;
            let query_key = self
                .options
                .is_job
                .then(|| self.pre_aggregation_query_key(&json!(refresh_key_values)));
            return Ok(Some(LoadPreAggregationResult {
                refresh_key_values,
                query_key,
                ..result
            }));
        }

        let structure_version = structure_version(&self.pre_aggregation);
        let versions = self.load_cache.get_version_entries(&self.pre_aggregation).await?;
        let entry = versions.by_structure.get(&self.table_key(&structure_version));
        if self.options.external_refresh {
            return match entry {
                Some(entry) => Ok(Some(result_for(entry))),
                None if throw_on_missing_partition => {
                    anyhow::bail!(ErrorMetadata::not_found(
                        "NoPreAggregationPartitionsBuilt",
                        no_pre_aggregation_partitions_built_message(&[
                            self.pre_aggregation.clone()
                        ])
                    ))
                },
                None => Ok(None),
            };
        }
        match entry {
            Some(entry) => {
                let this = self.clone();
                let _handle = self
                    .pre_aggregations
                    .rt()
                    .spawn("pre_aggregation_background_load", async move {
                        if let Err(e) = this.load_pre_aggregation_with_keys().await {
                            if !e.is_continue_wait() {
                                let mut e = e.context(format!(
                                    "Loading pre-aggregation {}",
                                    this.pre_aggregation.table_name
                                ));
                                report_error(&mut e).await;
                            }
                        }
                    });
                Ok(Some(result_for(entry)))
            },
            None => Ok(Some(self.load_pre_aggregation_with_keys().await?)),
        }
    }

    async fn invalidation_key_values(&self) -> anyhow::Result<Vec<Value>> {
        self.key_query_results(&self.pre_aggregation.invalidate_key_queries)
            .await
    }

    async fn partition_invalidation_key_values(&self) -> anyhow::Result<Vec<Value>> {
        match &self.pre_aggregation.partition_invalidate_key_queries {
            Some(queries) => self.key_query_results(queries).await,
            None => self.invalidation_key_values().await,
        }
    }

    async fn key_query_results(&self, queries: &[QueryWithParams]) -> anyhow::Result<Vec<Value>> {
        let priority = self.pre_aggregation.priority(BLOCKING_BUILD_PRIORITY);
        let results: Vec<_> = queries
            .iter()
            .map(|query| {
                self.load_cache
                    .key_query_result(query, self.options.wait_for_renew, priority)
            })
            .collect();
        try_join_all(results).await
    }

    fn pre_aggregation_query_key(&self, invalidation_keys: &Value) -> Value {
        if self.pre_aggregation.indexes_sql.is_empty() {
            json!([self.pre_aggregation.load_sql, invalidation_keys])
        } else {
            json!([
                self.pre_aggregation.load_sql,
                self.pre_aggregation.indexes_sql,
                invalidation_keys
            ])
        }
    }

    /// Serves the table matching the current refresh keys, or builds it.
    pub fn load_pre_aggregation_with_keys(
        &self,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<LoadPreAggregationResult>> {
        let this = self.clone();
        async move { this.load_with_keys().await }.boxed()
    }

    async fn load_with_keys(&self) -> anyhow::Result<LoadPreAggregationResult> {
        let p = &self.pre_aggregation;
        let invalidation_keys = json!(self.partition_invalidation_key_values().await?);
        let content_version = content_version(p, &invalidation_keys);
        let structure_version = structure_version(p);
        let versions = self.load_cache.get_version_entries(p).await?;

        if let Some(entry) = versions.by_content.get(&self.table_key(&content_version)) {
            if !self.options.force_build {
                return self.serve(entry).await;
            }
        }
        if self.options.external_refresh {
            if let Some(entry) = versions.by_structure.get(&self.table_key(&structure_version)) {
                return self.serve(entry).await;
            }
            anyhow::bail!(ErrorMetadata::not_found(
                "NoPreAggregationPartitionsBuilt",
                no_pre_aggregation_partitions_built_message(&[p.clone()])
            ));
        }

        if versions.version_entries.is_empty() {
            self.pre_aggregations
                .driver(p.data_source(), p.external)?
                .create_schema_if_not_exists(&p.pre_aggregations_schema)
                .await?;
        }
        let version_entry = versions
            .by_structure
            .get(&self.table_key(&structure_version))
            .or_else(|| versions.by_table_name.get(&p.table_name))
            .cloned();
        let new_version_entry = VersionEntry {
            table_name: p.table_name.clone(),
            content_version: content_version.clone(),
            structure_version: structure_version.clone(),
            last_updated_at: self.pre_aggregations.rt().unix_millis(),
            naming_version: Some(2),
            build_range_end: p.build_range_end.clone(),
        };

        if self.options.force_build {
            if self.options.is_job {
                self.execute_in_queue(
                    &invalidation_keys,
                    self.pre_aggregation.priority(BLOCKING_BUILD_PRIORITY),
                    &new_version_entry,
                    true,
                )
                .await?;
                return Ok(result_for(&new_version_entry));
            }
            self.execute_in_queue(
                &invalidation_keys,
                self.pre_aggregation.priority(BLOCKING_BUILD_PRIORITY),
                &new_version_entry,
                false,
            )
            .await?;
            return self.most_recent_result(&content_version).await;
        }

        let Some(version_entry) = version_entry else {
            tracing::info!(
                "Creating pre-aggregation from scratch {} request_id={:?}",
                p.table_name,
                self.options.request_id
            );
            self.execute_in_queue(
                &invalidation_keys,
                self.pre_aggregation.priority(BLOCKING_BUILD_PRIORITY),
                &new_version_entry,
                false,
            )
            .await?;
            return self.most_recent_result(&content_version).await;
        };
        if version_entry.structure_version != new_version_entry.structure_version {
            tracing::info!(
                "Invalidating pre-aggregation structure {} request_id={:?}",
                p.table_name,
                self.options.request_id
            );
            self.execute_in_queue(
                &invalidation_keys,
                self.pre_aggregation.priority(BLOCKING_BUILD_PRIORITY),
                &new_version_entry,
                false,
            )
            .await?;
            return self.most_recent_result(&content_version).await;
        }
        if version_entry.content_version != new_version_entry.content_version {
            if self.options.wait_for_renew {
                tracing::info!(
                    "Waiting for pre-aggregation renew {} request_id={:?}",
                    p.table_name,
                    self.options.request_id
                );
                self.execute_in_queue(
                    &invalidation_keys,
                    self.pre_aggregation.priority(REFRESH_PRIORITY),
                    &new_version_entry,
                    false,
                )
                .await?;
                return self.most_recent_result(&content_version).await;
            }
            self.schedule_refresh(invalidation_keys, new_version_entry);
        }
        self.serve(&version_entry).await
    }

    async fn serve(&self, entry: &VersionEntry) -> anyhow::Result<LoadPreAggregationResult> {
        let result = result_for(entry);
        self.pre_aggregations
            .update_last_touch(&result.target_table_name)
            .await?;
        Ok(result)
    }

    /// Re-reads the listing after a build and serves the table it produced.
    async fn most_recent_result(
        &self,
        content_version: &str,
    ) -> anyhow::Result<LoadPreAggregationResult> {
        self.load_cache.reset(&self.pre_aggregation).await?;
        let versions: VersionEntries = self
            .load_cache
            .get_version_entries(&self.pre_aggregation)
            .await?;
        let Some(entry) = versions.by_content.get(&self.table_key(content_version)) else {
            anyhow::bail!(
                "Pre-aggregation table is not found for {} after it was successfully created",
                self.pre_aggregation.table_name
            );
        };
        self.serve(entry).await
    }

    fn schedule_refresh(&self, invalidation_keys: Value, new_version_entry: VersionEntry) {
        tracing::info!(
            "Refreshing pre-aggregation content {} request_id={:?}",
            self.pre_aggregation.table_name,
            self.options.request_id
        );
        let this = self.clone();
        let _handle = self
            .pre_aggregations
            .rt()
            .spawn("pre_aggregation_refresh", async move {
                let result = this
                    .execute_in_queue(
                        &invalidation_keys,
                        this.pre_aggregation.priority(REFRESH_PRIORITY),
                        &new_version_entry,
                        false,
                    )
                    .await;
                if let Err(e) = result {
                    if !e.is_continue_wait() {
                        let mut e = e.context(format!(
                            "Refreshing pre-aggregation {}",
                            this.pre_aggregation.table_name
                        ));
                        report_error(&mut e).await;
                    }
                }
            });
    }

    async fn execute_in_queue(
        &self,
        invalidation_keys: &Value,
        priority: i64,
        new_version_entry: &VersionEntry,
        is_job: bool,
    ) -> anyhow::Result<Option<Value>> {
        let queue = self
            .pre_aggregations
            .get_queue(self.pre_aggregation.data_source())?;
        let payload = serde_json::to_value(BuildPayload {
            pre_aggregation: self.pre_aggregation.clone(),
            tables_to_temp_tables: self.tables_to_temp_tables.clone(),
            new_version_entry: new_version_entry.clone(),
            request_id: self.options.request_id.clone(),
            invalidation_keys: invalidation_keys.clone(),
            build_range_end: self.pre_aggregation.build_range_end.clone(),
        })?;
        queue
            .execute_in_queue(
                JobKind::Query,
                self.pre_aggregation_query_key(invalidation_keys),
                payload,
                Some(priority),
                ExecuteOptions {
                    stage_query_key: Some(json!(self.pre_aggregation.table_name)),
                    request_id: self.options.request_id.clone(),
                    force_build: false,
                    is_job,
                    orphaned_timeout: self.options.orphaned_timeout,
                },
            )
            .await
    }
}

/// Runs one build job. `client` is the source driver.
pub(crate) async fn refresh<RT: Runtime>(
    pre_aggregations: &PreAggregations<RT>,
    payload: BuildPayload,
    client: Arc<dyn DriverInterface>,
    handle: &QueryHandle,
) -> anyhow::Result<()> {
    let load_cache = pre_aggregations.new_load_cache(
        payload.pre_aggregation.data_source(),
        payload.request_id.clone(),
    );
    let build = Build {
        pre_aggregations,
        pre_aggregation: &payload.pre_aggregation,
        tables_to_temp_tables: &payload.tables_to_temp_tables,
        load_cache: &load_cache,
        new_version_entry: &payload.new_version_entry,
        invalidation_keys: &payload.invalidation_keys,
        request_id: payload.request_id.clone(),
        build_range_end: payload.build_range_end.clone(),
    };
    build.run(client, handle).await
}

/// One build of one table, as executed by the build queue.
struct Build<'a, RT: Runtime> {
    pre_aggregations: &'a PreAggregations<RT>,
    pre_aggregation: &'a PreAggregationDescription,
    tables_to_temp_tables: &'a [(String, String)],
    load_cache: &'a PreAggregationLoadCache<RT>,
    new_version_entry: &'a VersionEntry,
    invalidation_keys: &'a Value,
    request_id: Option<String>,
    build_range_end: Option<String>,
}

impl<RT: Runtime> Build<'_, RT> {
    fn target_table_name(&self) -> String {
        target_table_name(self.new_version_entry)
    }

    fn query_options(&self, target_table_name: &str) -> QueryOptions {
        QueryOptions {
            request_id: self.request_id.clone(),
            query_key: Some(json!([
                self.pre_aggregation.load_sql,
                self.invalidation_keys
            ])),
            target_table_name: Some(target_table_name.to_owned()),
            build_range_end: self.build_range_end.clone(),
            stream_offset: self.pre_aggregation.stream_offset.clone(),
            output_column_types: self.pre_aggregation.output_column_types.clone(),
        }
    }

    fn strategy(&self, client: &dyn DriverInterface) -> RefreshStrategy {
        if !self.pre_aggregation.external {
            RefreshStrategy::StoreInSource
        } else if self.pre_aggregation.read_only || client.read_only() {
            RefreshStrategy::ReadOnlyExternal
        } else {
            RefreshStrategy::WriteExternal
        }
    }

    async fn run(&self, client: Arc<dyn DriverInterface>, handle: &QueryHandle) -> anyhow::Result<()> {
        let target_table_name = self.target_table_name();
        self.pre_aggregations
            .update_last_touch(&target_table_name)
            .await?;
        let strategy = self.strategy(client.as_ref());
        tracing::info!(
            "Building pre-aggregation {target_table_name} strategy={} request_id={:?}",
            strategy.as_str(),
            self.request_id
        );
        log_pre_aggregation_build(strategy.as_str());
        match strategy {
            RefreshStrategy::StoreInSource => self.refresh_store_in_source(client.as_ref(), handle).await,
            RefreshStrategy::WriteExternal => self.refresh_write_strategy(client.as_ref(), handle).await,
            RefreshStrategy::ReadOnlyExternal => self.refresh_read_only_external(client.as_ref()).await,
        }
    }

    /// SQL of the pre-aggregation with the earlier tables of the query and
    /// its own logical name swapped for physical ones.
    fn load_sql(&self, target_table_name: &str) -> String {
        replace_pre_aggregation_table_names(
            &self.pre_aggregation.load_sql.sql,
            self.tables_to_temp_tables,
        )
        .replacen(&self.pre_aggregation.table_name, target_table_name, 1)
    }

    fn select_sql(&self) -> QueryWithParams {
        self.pre_aggregation
            .sql
            .as_ref()
            .unwrap_or(&self.pre_aggregation.load_sql)
            .with_table_names_replaced(self.tables_to_temp_tables)
    }

    async fn refresh_store_in_source(
        &self,
        client: &dyn DriverInterface,
        handle: &QueryHandle,
    ) -> anyhow::Result<()> {
        let target_table_name = self.target_table_name();
        let sql = self.load_sql(&target_table_name);
        let options = self.query_options(&target_table_name);
        let result = async {
            client
                .load_pre_aggregation_into_table(
                    &target_table_name,
                    &sql,
                    &self.pre_aggregation.load_sql.params,
                    &options,
                    handle,
                )
                .await?;
            for index in self.prepare_indexes_sql() {
                client
                    .query(&index.sql, &index.params, &options, handle)
                    .await?;
            }
            self.load_cache.fetch_tables(self.pre_aggregation).await?;
            anyhow::Ok(())
        }
        .await;
        let dropped = self
            .drop_orphaned_tables(client, &target_table_name, false)
            .await;
        result?;
        dropped
    }

    async fn refresh_write_strategy(
        &self,
        client: &dyn DriverInterface,
        handle: &QueryHandle,
    ) -> anyhow::Result<()> {
        let capabilities = client.capabilities();
        let with_temp_table = !capabilities.unload_without_temp_table;
        let drop_source_temp_table = !capabilities.streaming_source;
        let target_table_name = self.target_table_name();
        let options = self.query_options(&target_table_name);

        let result = async {
            if with_temp_table {
                client
                    .create_schema_if_not_exists(&self.pre_aggregation.pre_aggregations_schema)
                    .await?;
                client
                    .load_pre_aggregation_into_table(
                        &target_table_name,
                        &self.load_sql(&target_table_name),
                        &self.pre_aggregation.load_sql.params,
                        &options,
                        handle,
                    )
                    .await?;
            }
            let data = if with_temp_table {
                self.download_temp_table(client, &target_table_name, &options)
                    .await?
            } else {
                self.download_without_temp_table(client, &options, handle)
                    .await?
            };
            self.upload_external(data, &options).await
        }
        .await;

        let cleanup = async {
            if with_temp_table && drop_source_temp_table {
                let lock = format!(
                    "drop-temp-table:{}:{target_table_name}",
                    self.pre_aggregation.data_source()
                );
                self.pre_aggregations
                    .query_cache()
                    .with_lock(
                        &lock,
                        *DROP_ORPHANED_LOCK_TTL,
                        async {
                            let tables = client
                                .get_tables_query(&self.pre_aggregation.pre_aggregations_schema)
                                .await?;
                            let listed = tables.iter().any(|table| {
                                format!(
                                    "{}.{}",
                                    self.pre_aggregation.pre_aggregations_schema, table.table_name
                                ) == target_table_name
                            });
                            if listed {
                                tracing::info!("Dropping source temp table {target_table_name}");
                                client.drop_table(&target_table_name).await?;
                            }
                            Ok(())
                        }
                        .boxed(),
                    )
                    .await?;
            }
            self.drop_orphaned_tables(client, &target_table_name, false)
                .await
        }
        .await;
        result?;
        cleanup
    }

    async fn download_temp_table(
        &self,
        client: &dyn DriverInterface,
        table: &str,
        options: &QueryOptions,
    ) -> anyhow::Result<DownloadTableData> {
        let external = self
            .pre_aggregations
            .driver(self.pre_aggregation.data_source(), true)?;
        let external_capabilities = external.capabilities();
        let unload_options = UnloadOptions::default();
        let mut data = if external_capabilities.csv_import
            && client.is_unload_supported(&unload_options).await?
        {
            client.unload(table, &unload_options).await?
        } else if external_capabilities.stream_import && client.supports_stream() {
            client
                .stream_table(&format!("SELECT * FROM {table}"), &[])
                .await?
        } else {
            client.download_table(table, options).await?
        };
        if data.types.is_none() {
            data.types = Some(client.table_column_types(table).await?);
        }
        Ok(data)
    }

    async fn download_without_temp_table(
        &self,
        client: &dyn DriverInterface,
        options: &QueryOptions,
        handle: &QueryHandle,
    ) -> anyhow::Result<DownloadTableData> {
        let external = self
            .pre_aggregations
            .driver(self.pre_aggregation.data_source(), true)?;
        let external_capabilities = external.capabilities();
        let query = self.select_sql();
        let unload_options = UnloadOptions {
            query: Some((query.sql.clone(), query.params.clone())),
            ..Default::default()
        };
        let mut data = if external_capabilities.csv_import
            && client.is_unload_supported(&unload_options).await?
        {
            client
                .unload(&self.target_table_name(), &unload_options)
                .await?
        } else if external_capabilities.stream_import && client.supports_stream() {
            client.stream_table(&query.sql, &query.params).await?
        } else {
            let rows = client
                .query(&query.sql, &query.params, options, handle)
                .await?;
            DownloadTableData::rows(rows)
        };
        if data.types.is_none() {
            data.types = client.query_column_types(&query.sql, &query.params).await?;
        }
        Ok(data)
    }

    async fn refresh_read_only_external(&self, client: &dyn DriverInterface) -> anyhow::Result<()> {
        let external = self
            .pre_aggregations
            .driver(self.pre_aggregation.data_source(), true)?;
        let query = self.select_sql();
        let options = self.query_options(&self.target_table_name());
        let unload_options = UnloadOptions::default();
        let data = if external.capabilities().csv_import
            && client.is_unload_supported(&unload_options).await?
        {
            client
                .unload_from_query(&query.sql, &query.params, &unload_options)
                .await?
        } else {
            client
                .download_query_results(&query.sql, &query.params, &options)
                .await?
        };
        self.upload_external(data, &options).await
    }

    async fn upload_external(
        &self,
        data: DownloadTableData,
        options: &QueryOptions,
    ) -> anyhow::Result<()> {
        let external = self
            .pre_aggregations
            .driver(self.pre_aggregation.data_source(), true)?;
        let target_table_name = self.target_table_name();
        let types = data
            .types
            .clone()
            .or_else(|| self.pre_aggregation.output_column_types.clone())
            .unwrap_or_default();
        tracing::info!(
            "Uploading external pre-aggregation {target_table_name} ({}) request_id={:?}",
            data.data.kind(),
            self.request_id
        );
        external
            .upload_table_with_indexes(
                &target_table_name,
                &types,
                data,
                &self.prepare_indexes_sql(),
                self.pre_aggregation.unique_key_columns.as_deref(),
                options,
                &UploadOptions {
                    aggregations_columns: self.pre_aggregation.aggregations_columns.clone(),
                    create_table_indexes: self.prepare_create_table_indexes(),
                    seal_at: self.pre_aggregation.seal_at.clone(),
                },
            )
            .await?;
        self.load_cache.fetch_tables(self.pre_aggregation).await?;
        self.drop_orphaned_tables(external.as_ref(), &target_table_name, true)
            .await
    }

    fn index_target_table_name(&self, index_name: &str) -> String {
        target_table_name(&VersionEntry {
            table_name: index_name.to_owned(),
            ..self.new_version_entry.clone()
        })
    }

    fn prepare_indexes_sql(&self) -> Vec<IndexSql> {
        self.pre_aggregation
            .indexes_sql
            .iter()
            .map(|index| {
                // Index names extend the table name, so they go first.
                let mut tables = self.tables_to_temp_tables.to_vec();
                tables.push((
                    index.index_name.clone(),
                    self.index_target_table_name(&index.index_name),
                ));
                tables.push((
                    self.pre_aggregation.table_name.clone(),
                    self.target_table_name(),
                ));
                IndexSql {
                    sql: replace_pre_aggregation_table_names(&index.sql.sql, &tables),
                    params: index.sql.params.clone(),
                }
            })
            .collect()
    }

    fn prepare_create_table_indexes(&self) -> Vec<CreateTableIndex> {
        self.pre_aggregation
            .create_table_indexes
            .iter()
            .map(|index| CreateTableIndex {
                index_name: self.index_target_table_name(&index.index_name),
                ..index.clone()
            })
            .collect()
    }

    /// Drops every table of the schema nobody needs anymore. Kept are the
    /// tables used or touched recently, the newest table of each
    /// pre-aggregation and of each recent structure, and `just_created`.
    async fn drop_orphaned_tables(
        &self,
        client: &dyn DriverInterface,
        just_created: &str,
        external: bool,
    ) -> anyhow::Result<()> {
        self.pre_aggregations.add_table_used(just_created).await?;
        let lock = if external {
            "drop-orphaned-tables-external".to_owned()
        } else {
            format!("drop-orphaned-tables:{}", self.pre_aggregation.data_source())
        };
        let ran = self
            .pre_aggregations
            .query_cache()
            .with_lock(
                &lock,
                *DROP_ORPHANED_LOCK_TTL,
                self.drop_orphaned_tables_locked(client, just_created).boxed(),
            )
            .await?;
        if !ran {
            tracing::debug!("Orphaned tables are already being dropped under {lock}");
        }
        Ok(())
    }

    async fn drop_orphaned_tables_locked(
        &self,
        client: &dyn DriverInterface,
        just_created: &str,
    ) -> anyhow::Result<()> {
        let schema = &self.pre_aggregation.pre_aggregations_schema;
        let options = self.pre_aggregations.options();
        let actual_tables = client.get_tables_query(schema).await?;
        let entries = tables_to_version_entries(schema, &actual_tables);
        let now = self.pre_aggregations.rt().unix_millis();
        let persist_millis =
            i64::try_from(options.structure_version_persist_time.as_millis()).unwrap_or(i64::MAX);

        let mut to_save: BTreeSet<String> = self.pre_aggregations.tables_used().await?.into_iter().collect();
        to_save.insert(just_created.to_owned());
        let refresh_end_reached = self.pre_aggregations.get_refresh_end_reached().await?;
        if options.drop_pre_aggregations_without_touch && refresh_end_reached.is_some() {
            to_save.extend(self.pre_aggregations.tables_touched().await?);
        } else {
            let mut latest_tables = BTreeSet::new();
            let mut latest_structures = BTreeSet::new();
            for entry in &entries {
                if latest_tables.insert(entry.table_name.clone()) {
                    to_save.insert(target_table_name(entry));
                }
                let structure_key = (entry.table_name.clone(), entry.structure_version.clone());
                if now - entry.last_updated_at < persist_millis
                    && latest_structures.insert(structure_key)
                {
                    to_save.insert(target_table_name(entry));
                }
            }
        }

        let to_drop: Vec<String> = actual_tables
            .iter()
            .map(|table| format!("{schema}.{}", table.table_name))
            .filter(|table| !to_save.contains(table))
            .collect();
        tracing::info!(
            "Dropping orphaned tables of {schema} request_id={:?}: {to_drop:?}",
            self.request_id
        );
        let drops: Vec<_> = to_drop.iter().map(|table| client.drop_table(table)).collect();
        try_join_all(drops).await?;
        log_pre_aggregation_tables_dropped(to_drop.len());
        Ok(())
    }
}
