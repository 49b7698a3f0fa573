//! Splits a partitioned pre-aggregation into calendar partitions over its
//! build range, loads each through a [`PreAggregationLoader`] and serves
//! them as one `UNION ALL` table.

use std::{
    sync::Arc,
    time::Duration,
};

use common::runtime::Runtime;
use errors::ErrorMetadata;
use futures::future::try_join_all;
use serde_json::{
    json,
    Value,
};

use super::{
    load_cache::PreAggregationLoadCache,
    loader::PreAggregationLoader,
    time_series::{
        add_seconds_to_local_timestamp,
        extract_date,
        intersect_date_ranges,
        local_timestamp_to_utc,
        partition_table_name,
        reformat_in_iso_local,
        time_series,
        unix_millis_to_local,
        QueryDateRange,
    },
    version::no_pre_aggregation_partitions_built_message,
    IndexDescription,
    InlineTable,
    LambdaQuery,
    LoadOptions,
    LoadPreAggregationResult,
    PreAggTableToTempTable,
    PreAggregationDescription,
    PreAggregations,
};
use crate::{
    driver::TableStructure,
    query_cache::{
        query_cache_key,
        CacheQueryOptions,
        QueryBody,
        QueryWithParams,
        RenewQueryOptions,
    },
};

pub const FROM_PARTITION_RANGE: &str = "__FROM_PARTITION_RANGE";
pub const TO_PARTITION_RANGE: &str = "__TO_PARTITION_RANGE";
pub const BUILD_RANGE_START_LOCAL: &str = "__BUILD_RANGE_START_LOCAL";
pub const BUILD_RANGE_END_LOCAL: &str = "__BUILD_RANGE_END_LOCAL";
pub const MAX_SOURCE_ROW_LIMIT: &str = "__MAX_SOURCE_ROW_LIMIT";

const LAMBDA_TABLE_PREFIX: &str = "lambda";

const RANGE_QUERY_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

const LAMBDA_QUERY_EXPIRATION: Duration = Duration::from_secs(60 * 60);

const RANGE_QUERY_PRIORITY: i64 = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionRanges {
    /// The build range, narrowed to the query's date range when they
    /// overlap.
    pub build_range: QueryDateRange,
    pub partition_ranges: Vec<QueryDateRange>,
    /// Unset when the query's date range misses the build range. The ranges
    /// then hold the last partition only, so the query still gets a table
    /// of the right shape.
    pub intersects: bool,
}

fn is_placeholder(param: &Value, placeholder: &str) -> bool {
    param.as_str() == Some(placeholder)
}

/// Oldest of the partition timestamps, so a union is as fresh as its
/// stalest partition.
fn last_updated_at(results: &[LoadPreAggregationResult]) -> Option<i64> {
    results.iter().filter_map(|r| r.last_updated_at).min()
}

fn same_instant(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (reformat_in_iso_local(a), reformat_in_iso_local(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

pub struct PreAggregationPartitionRangeLoader<RT: Runtime> {
    pre_aggregations: PreAggregations<RT>,
    pre_aggregation: PreAggregationDescription,
    tables_to_temp_tables: Vec<PreAggTableToTempTable>,
    load_cache: Arc<PreAggregationLoadCache<RT>>,
    options: LoadOptions,
}

impl<RT: Runtime> PreAggregationPartitionRangeLoader<RT> {
    pub fn new(
        pre_aggregations: PreAggregations<RT>,
        pre_aggregation: PreAggregationDescription,
        tables_to_temp_tables: Vec<PreAggTableToTempTable>,
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

    fn is_partitioned(&self) -> bool {
        self.pre_aggregation.partition_granularity.is_some() && !self.pre_aggregation.expanded_partition
    }

    fn priority(&self) -> i64 {
        self.pre_aggregation.priority(RANGE_QUERY_PRIORITY)
    }

    fn loader(&self, pre_aggregation: PreAggregationDescription) -> anyhow::Result<PreAggregationLoader<RT>> {
        PreAggregationLoader::new(
            self.pre_aggregations.clone(),
            pre_aggregation,
            self.tables_to_temp_tables
                .iter()
                .map(|(table_name, result)| (table_name.clone(), result.target_table_name.clone()))
                .collect(),
            self.load_cache.clone(),
            self.options.clone(),
        )
    }

    /// Runs a build range query through the query cache. With a partition
    /// range, the query is renewed whenever that partition's refresh keys
    /// move.
    async fn load_range_query(
        &self,
        range_query: &QueryWithParams,
        partition_range: Option<&QueryDateRange>,
    ) -> anyhow::Result<Value> {
        let query_cache = self.pre_aggregations.query_cache();
        let cache_key = query_cache_key(&QueryBody {
            query: range_query.sql.clone(),
            values: range_query.params.clone(),
            invalidate: self
                .pre_aggregation
                .invalidate_key_queries
                .first()
                .map(QueryWithParams::key),
            ..Default::default()
        });
        let renewal_key = match partition_range {
            Some(range) => Some(json!(self.invalidation_key_values(range).await?)),
            None => None,
        };
        let renewal_threshold = query_cache
            .refresh_key_renewal_threshold()
            .or(range_query.options.renewal_threshold.map(Duration::from_secs))
            .unwrap_or(RANGE_QUERY_EXPIRATION);
        query_cache
            .cache_query_result(
                &range_query.sql,
                &range_query.params,
                cache_key,
                RANGE_QUERY_EXPIRATION,
                CacheQueryOptions {
                    renewal_threshold: Some(renewal_threshold),
                    renewal_key,
                    priority: Some(self.priority()),
                    external: range_query.options.external.unwrap_or(false),
                    request_id: self.options.request_id.clone(),
                    data_source: Some(self.pre_aggregation.data_source().to_owned()),
                    wait_for_renew: self.options.wait_for_renew,
                    force_no_cache: false,
                    use_in_memory_cache: true,
                },
            )
            .await
    }

    async fn invalidation_key_values(&self, range: &QueryDateRange) -> anyhow::Result<Vec<Value>> {
        let partition_table_name = self.partition_table_name(range)?;
        let queries: Vec<QueryWithParams> = self
            .pre_aggregation
            .invalidate_key_queries
            .iter()
            .map(|query| self.replace_partition_sql_and_params(query, range, &partition_table_name))
            .collect::<anyhow::Result<_>>()?;
        let results: Vec<_> = queries
            .iter()
            .map(|query| {
                self.load_cache
                    .key_query_result(query, self.options.wait_for_renew, self.priority())
            })
            .collect();
        try_join_all(results).await
    }

    fn partition_granularity(&self) -> anyhow::Result<&str> {
        self.pre_aggregation
            .partition_granularity
            .as_deref()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Pre-aggregation {} has no partition granularity",
                    self.pre_aggregation.table_name
                )
            })
    }

    fn partition_table_name(&self, range: &QueryDateRange) -> anyhow::Result<String> {
        Ok(partition_table_name(
            &self.pre_aggregation.table_name,
            self.partition_granularity()?,
            range,
        ))
    }

    fn now(&self) -> anyhow::Result<String> {
        unix_millis_to_local(
            self.pre_aggregation.timezone(),
            self.pre_aggregations.rt().unix_millis(),
        )
    }

    fn or_now_if_empty(&self, start: Option<String>, end: Option<String>) -> anyhow::Result<QueryDateRange> {
        Ok(match (start, end) {
            (Some(start), Some(end)) => [start, end],
            (Some(date), None) | (None, Some(date)) => [date.clone(), date],
            (None, None) => {
                let now = self.now()?;
                [now.clone(), now]
            },
        })
    }

    async fn range_query_dates(
        &self,
        start_ranges: Option<(&QueryDateRange, &QueryDateRange)>,
    ) -> anyhow::Result<(Option<String>, Option<String>)> {
        let Some((start_query, end_query)) = &self.pre_aggregation.pre_aggregation_start_end_queries
        else {
            return Ok((None, None));
        };
        let (start_range, end_range) = match start_ranges {
            Some((start, end)) => (Some(start), Some(end)),
            None => (None, None),
        };
        let (start, end) = futures::try_join!(
            self.load_range_query(start_query, start_range),
            self.load_range_query(end_query, end_range),
        )?;
        let timezone = self.pre_aggregation.timezone();
        Ok((extract_date(&start, timezone)?, extract_date(&end, timezone)?))
    }

    /// Local `[start, end]` the pre-aggregation is built over, from its
    /// range queries. Falls back to now when they return nothing.
    pub async fn load_build_range(&self) -> anyhow::Result<QueryDateRange> {
        let (start, end) = self.range_query_dates(None).await?;
        let Some(granularity) = &self.pre_aggregation.partition_granularity else {
            return self.or_now_if_empty(start, end);
        };
        // Query again keyed by the first and last partitions, so the range
        // follows their refresh keys.
        let whole_series = time_series(
            granularity,
            &self.or_now_if_empty(start.clone(), end.clone())?,
            self.pre_aggregation.timestamp_precision(),
        )?;
        let (Some(first), Some(last)) = (whole_series.first(), whole_series.last()) else {
            return self.or_now_if_empty(start, end);
        };
        let (start, end) = self.range_query_dates(Some((first, last))).await?;
        self.or_now_if_empty(start, end)
    }

    pub async fn partition_ranges(&self, ignore_matched_date_range: bool) -> anyhow::Result<PartitionRanges> {
        let build_range = self.load_build_range().await?;
        let matched = if ignore_matched_date_range {
            None
        } else {
            self.pre_aggregation.matched_time_dimension_date_range.as_ref()
        };
        let intersection = intersect_date_ranges(Some(&build_range), matched)?;
        let intersects = intersection.is_some();
        let date_range =
            intersection.unwrap_or_else(|| [build_range[1].clone(), build_range[1].clone()]);
        let partition_ranges = time_series(
            self.partition_granularity()?,
            &date_range,
            self.pre_aggregation.timestamp_precision(),
        )?;
        if partition_ranges.len() > self.options.max_partitions {
            anyhow::bail!(ErrorMetadata::bad_request(
                "TooManyPartitions",
                format!(
                    "Pre-aggregation '{}' requested to build {} partitions which exceeds the \
                     maximum number of partitions per pre-aggregation of {}",
                    self.pre_aggregation.table_name,
                    partition_ranges.len(),
                    self.options.max_partitions
                )
            ));
        }
        Ok(PartitionRanges {
            build_range: date_range,
            partition_ranges,
            intersects,
        })
    }

    /// Points `query` at one partition: the first mention of the
    /// pre-aggregation table becomes the partition table and the range
    /// placeholders become UTC literals. Incremental refresh keys whose
    /// update window has passed get a shorter renewal threshold.
    pub fn replace_partition_sql_and_params(
        &self,
        query: &QueryWithParams,
        range: &QueryDateRange,
        partition_table_name: &str,
    ) -> anyhow::Result<QueryWithParams> {
        let timezone = self.pre_aggregation.timezone();
        let timestamp_format = self.pre_aggregation.timestamp_format.as_deref();
        let params = query
            .params
            .iter()
            .map(|param| {
                if is_placeholder(param, FROM_PARTITION_RANGE) {
                    Ok(json!(local_timestamp_to_utc(timezone, timestamp_format, &range[0])?))
                } else if is_placeholder(param, TO_PARTITION_RANGE) {
                    Ok(json!(local_timestamp_to_utc(timezone, timestamp_format, &range[1])?))
                } else {
                    Ok(param.clone())
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut options = query.options.clone();
        if options.incremental {
            let boundary = add_seconds_to_local_timestamp(
                &range[1],
                timezone,
                options.update_window_seconds.unwrap_or(0),
            )?;
            let since_boundary = self.pre_aggregations.rt().unix_millis() - boundary.timestamp_millis();
            if since_boundary > 0 {
                let seconds = u64::try_from((since_boundary + 500) / 1000).unwrap_or(0);
                options.renewal_threshold = Some(match options.renewal_threshold_outside_update_window {
                    Some(outside) => seconds.min(outside),
                    None => seconds,
                });
            }
        }
        Ok(QueryWithParams {
            sql: query
                .sql
                .replacen(&self.pre_aggregation.table_name, partition_table_name, 1),
            params,
            options,
        })
    }

    /// Description of the partition covering `range`. Its load range is cut
    /// at the end of `build_range` unless it refreshes in real time.
    pub fn partition_pre_aggregation_description(
        &self,
        range: &QueryDateRange,
        build_range: &QueryDateRange,
    ) -> anyhow::Result<PreAggregationDescription> {
        let p = &self.pre_aggregation;
        let partition_table_name = self.partition_table_name(range)?;
        let mut load_range = range.clone();
        let partition_invalidate_key_queries = p
            .partition_invalidate_key_queries
            .as_ref()
            .unwrap_or(&p.invalidate_key_queries);
        if !partition_invalidate_key_queries.is_empty() && build_range[1] < range[1] {
            load_range[1] = build_range[1].clone();
        }
        let seal_at = add_seconds_to_local_timestamp(
            &load_range[1],
            p.timezone(),
            p.update_window_seconds.unwrap_or(0),
        )?
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string();
        let replace = |query: &QueryWithParams, range: &QueryDateRange| {
            self.replace_partition_sql_and_params(query, range, &partition_table_name)
        };
        let replace_all = |queries: &[QueryWithParams]| {
            queries
                .iter()
                .map(|query| replace(query, range))
                .collect::<anyhow::Result<Vec<_>>>()
        };
        Ok(PreAggregationDescription {
            table_name: partition_table_name.clone(),
            structure_version_load_sql: Some(replace(&p.load_sql, range)?),
            load_sql: replace(&p.load_sql, &load_range)?,
            sql: p.sql.as_ref().map(|sql| replace(sql, &load_range)).transpose()?,
            invalidate_key_queries: replace_all(&p.invalidate_key_queries)?,
            partition_invalidate_key_queries: p
                .partition_invalidate_key_queries
                .as_deref()
                .map(replace_all)
                .transpose()?,
            indexes_sql: p
                .indexes_sql
                .iter()
                .map(|index| {
                    Ok(IndexDescription {
                        sql: replace(&index.sql, range)?,
                        index_name: index.index_name.clone(),
                    })
                })
                .collect::<anyhow::Result<_>>()?,
            preview_sql: p
                .preview_sql
                .as_ref()
                .map(|sql| replace(sql, range))
                .transpose()?,
            build_range_start: Some(load_range[0].clone()),
            build_range_end: Some(load_range[1].clone()),
            seal_at: Some(seal_at),
            expanded_partition: true,
            ..p.clone()
        })
    }

    /// The partitions this pre-aggregation is made of, or itself when it
    /// isn't partitioned.
    pub async fn partition_pre_aggregations(&self) -> anyhow::Result<Vec<PreAggregationDescription>> {
        if !self.is_partitioned() {
            return Ok(vec![self.pre_aggregation.clone()]);
        }
        let ranges = self.partition_ranges(false).await?;
        ranges
            .partition_ranges
            .iter()
            .map(|range| self.partition_pre_aggregation_description(range, &ranges.build_range))
            .collect()
    }

    async fn load_partitions(
        &self,
        ranges: &PartitionRanges,
    ) -> anyhow::Result<(Vec<LoadPreAggregationResult>, Vec<PreAggregationDescription>)> {
        let descriptions: Vec<_> = ranges
            .partition_ranges
            .iter()
            .map(|range| self.partition_pre_aggregation_description(range, &ranges.build_range))
            .collect::<anyhow::Result<_>>()?;
        let loaders: Vec<_> = descriptions
            .iter()
            .map(|description| self.loader(description.clone()))
            .collect::<anyhow::Result<_>>()?;
        let loads: Vec<_> = loaders
            .iter()
            .map(|loader| loader.load_pre_aggregation(false))
            .collect();
        let results = try_join_all(loads).await?;
        let results = results
            .into_iter()
            .zip(&ranges.partition_ranges)
            .filter_map(|(result, range)| {
                result.map(|result| LoadPreAggregationResult {
                    partition_range: Some(range.clone()),
                    ..result
                })
            })
            .collect();
        Ok((results, descriptions))
    }

    /// Loads the table or all partitions. Partitions are served as a
    /// parenthesized `UNION ALL` of their tables.
    pub async fn load_pre_aggregations(&self) -> anyhow::Result<LoadPreAggregationResult> {
        if !self.is_partitioned() {
            return self
                .loader(self.pre_aggregation.clone())?
                .load_pre_aggregation(true)
                .await?
                .ok_or_else(|| {
                    anyhow::anyhow!(ErrorMetadata::not_found(
                        "NoPreAggregationPartitionsBuilt",
                        no_pre_aggregation_partitions_built_message(&[self
                            .pre_aggregation
                            .clone()])
                    ))
                });
        }

        let ranges = self.partition_ranges(false).await?;
        let mut empty_result = !ranges.intersects;
        let (mut results, mut descriptions) = self.load_partitions(&ranges).await?;
        if self.options.external_refresh && results.is_empty() {
            // Nothing is built inside the query's range. Any built partition
            // gives the query a table of the right shape.
            let ranges = self.partition_ranges(true).await?;
            (results, descriptions) = self.load_partitions(&ranges).await?;
            if let Some(last) = results.pop() {
                results = vec![last];
                empty_result = true;
            }
        }
        let Some(last_result) = results.last().cloned() else {
            anyhow::bail!(ErrorMetadata::not_found(
                "NoPreAggregationPartitionsBuilt",
                no_pre_aggregation_partitions_built_message(&descriptions)
            ));
        };

        let mut lambda_table = None;
        if let Some(rollup_lambda_id) = &self.pre_aggregation.rollup_lambda_id {
            if let Some(lambda_query) = &self.options.lambda_query {
                let lambda_types = self
                    .load_cache
                    .get_table_column_types(&self.pre_aggregation, &last_result.target_table_name)
                    .await?;
                lambda_table = Some(
                    self.download_lambda_table(
                        lambda_query,
                        last_result.build_range_end.as_deref(),
                        lambda_types,
                    )
                    .await?,
                );
            }
            let rollup_lambda_results: Vec<_> = self
                .tables_to_temp_tables
                .iter()
                .filter(|(_, result)| result.rollup_lambda_id.as_ref() == Some(rollup_lambda_id))
                .collect();
            let filtered: Vec<_> = results
                .iter()
                .filter(|r| {
                    let range = r.partition_range.as_ref();
                    let fully_built = self.pre_aggregation.last_rollup_lambda
                        || same_instant(
                            r.build_range_end.as_deref(),
                            range.map(|range| range[1].as_str()),
                        );
                    let after_earlier_rollups = rollup_lambda_results.iter().all(|(_, earlier)| {
                        let Some(earlier_end) = &earlier.build_range_end else {
                            return true;
                        };
                        match (reformat_in_iso_local(earlier_end), range) {
                            (Ok(earlier_end), Some(range)) => reformat_in_iso_local(&range[0])
                                .is_ok_and(|start| earlier_end < start),
                            _ => false,
                        }
                    });
                    fully_built && after_earlier_rollups
                })
                .cloned()
                .collect();
            if filtered.is_empty() {
                empty_result = true;
                results = vec![last_result.clone()];
            } else {
                results = filtered;
            }
        }

        let mut table_names: Vec<String> = results.iter().map(|r| r.target_table_name.clone()).collect();
        let mut last_updated_at = last_updated_at(&results);
        if let Some(lambda_table) = &lambda_table {
            table_names.push(lambda_table.name.clone());
            last_updated_at = Some(self.pre_aggregations.rt().unix_millis());
        }
        let target_table_name = if table_names.len() == 1 && !empty_result {
            table_names.remove(0)
        } else {
            let filter = if empty_result { " WHERE 1 = 0" } else { "" };
            let union = table_names
                .iter()
                .map(|table| format!("SELECT * FROM {table}{filter}"))
                .collect::<Vec<_>>()
                .join(" UNION ALL ");
            format!("({union})")
        };
        Ok(LoadPreAggregationResult {
            target_table_name,
            refresh_key_values: results.iter().map(|r| json!(r.refresh_key_values)).collect(),
            last_updated_at,
            build_range_end: if empty_result {
                None
            } else {
                results.last().and_then(|r| r.build_range_end.clone())
            },
            lambda_table,
            query_key: None,
            rollup_lambda_id: self.pre_aggregation.rollup_lambda_id.clone(),
            partition_range: None,
        })
    }

    /// Reads the rows past `from_date` straight from the source.
    async fn download_lambda_table(
        &self,
        lambda_query: &LambdaQuery,
        from_date: Option<&str>,
        lambda_types: TableStructure,
    ) -> anyhow::Result<InlineTable> {
        let max_source_row_limit = self.options.max_source_row_limit;
        let query = &lambda_query.sql_and_params;
        let values: Vec<Value> = query
            .params
            .iter()
            .map(|param| {
                if is_placeholder(param, FROM_PARTITION_RANGE) {
                    json!(from_date)
                } else if is_placeholder(param, MAX_SOURCE_ROW_LIMIT) {
                    json!(max_source_row_limit)
                } else {
                    param.clone()
                }
            })
            .collect();
        let result = self
            .pre_aggregations
            .query_cache()
            .renew_query(
                &query.sql,
                &values,
                &lambda_query.cache_key_queries,
                LAMBDA_QUERY_EXPIRATION,
                json!([query.sql, values]),
                None,
                RenewQueryOptions {
                    external: false,
                    request_id: self.options.request_id.clone(),
                    data_source: Some(self.pre_aggregation.data_source().to_owned()),
                    priority: None,
                    skip_refresh_key_wait_for_renew: false,
                    use_in_memory_cache: false,
                },
            )
            .await?;
        let rows = match result.data {
            Value::Array(rows) => rows,
            Value::Null => vec![],
            other => anyhow::bail!("Lambda query returned {other} instead of rows"),
        };
        if rows.len() == max_source_row_limit {
            anyhow::bail!(
                "The maximum number of source rows {max_source_row_limit} was reached for {}",
                self.pre_aggregation.pre_aggregation_id
            );
        }
        Ok(InlineTable {
            name: format!(
                "{LAMBDA_TABLE_PREFIX}_{}",
                self.pre_aggregation.table_name.replacen('.', "_", 1)
            ),
            columns: lambda_types,
            rows,
        })
    }

    /// Substitutes the build range placeholders of the query values.
    /// `None` when there are none.
    pub async fn replace_query_build_range_params(
        &self,
        values: &[Value],
    ) -> anyhow::Result<Option<Vec<Value>>> {
        let has_placeholder = values.iter().any(|v| {
            is_placeholder(v, BUILD_RANGE_START_LOCAL) || is_placeholder(v, BUILD_RANGE_END_LOCAL)
        });
        if !has_placeholder {
            return Ok(None);
        }
        let [start, end] = self.load_build_range().await?;
        Ok(Some(
            values
                .iter()
                .map(|v| {
                    if is_placeholder(v, BUILD_RANGE_START_LOCAL) {
                        json!(start)
                    } else if is_placeholder(v, BUILD_RANGE_END_LOCAL) {
                        json!(end)
                    } else {
                        v.clone()
                    }
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;
    use runtime::testing::TestRuntime;
    use serde_json::json;

    use super::{
        PreAggregationPartitionRangeLoader,
        BUILD_RANGE_END_LOCAL,
        BUILD_RANGE_START_LOCAL,
        FROM_PARTITION_RANGE,
        MAX_SOURCE_ROW_LIMIT,
        TO_PARTITION_RANGE,
    };
    use crate::{
        driver::mock::row,
        pre_aggregations::{
            tests::{
                fixture,
                Fixture,
            },
            LambdaQuery,
            LoadOptions,
            PreAggregationDescription,
        },
        query_cache::QueryWithParams,
    };

    fn by_day() -> PreAggregationDescription {
        PreAggregationDescription {
            pre_aggregation_id: "Orders.byDay".to_owned(),
            table_name: "pre.orders_by_day".to_owned(),
            pre_aggregations_schema: "pre".to_owned(),
            load_sql: QueryWithParams::new(
                "CREATE TABLE pre.orders_by_day AS SELECT day, count(*) FROM orders WHERE \
                 created_at >= ? AND created_at <= ? GROUP BY 1",
                vec![json!(FROM_PARTITION_RANGE), json!(TO_PARTITION_RANGE)],
            ),
            invalidate_key_queries: vec![QueryWithParams::new(
                "SELECT max(updated_at) FROM orders",
                vec![],
            )],
            partition_granularity: Some("day".to_owned()),
            pre_aggregation_start_end_queries: Some((
                QueryWithParams::new("SELECT min(created_at) FROM orders", vec![]),
                QueryWithParams::new("SELECT max(created_at) FROM orders", vec![]),
            )),
            ..Default::default()
        }
    }

    fn with_build_range(f: &Fixture) {
        f.source.on_query(
            "SELECT min(created_at) FROM orders",
            vec![row(&[("min", json!("2024-01-01T00:00:00.000Z"))])],
        );
        f.source.on_query(
            "SELECT max(created_at) FROM orders",
            vec![row(&[("max", json!("2024-01-03T10:00:00.000Z"))])],
        );
        f.source.on_query(
            "SELECT max(updated_at) FROM orders",
            vec![row(&[("max", json!(1))])],
        );
    }

    fn loader(
        f: &Fixture,
        p: PreAggregationDescription,
        options: LoadOptions,
    ) -> anyhow::Result<PreAggregationPartitionRangeLoader<TestRuntime>> {
        PreAggregationPartitionRangeLoader::new(
            f.pre_aggregations.clone(),
            p,
            vec![],
            f.pre_aggregations.new_load_cache("default", None),
            options,
        )
    }

    fn blocking() -> LoadOptions {
        LoadOptions {
            wait_for_renew: true,
            max_partitions: 100,
            max_source_row_limit: 100,
            ..Default::default()
        }
    }

    #[orchestrator_macro::test_runtime]
    async fn test_partitions_are_unioned(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        let result = loader(&f, by_day(), blocking())?
            .load_pre_aggregations()
            .await?;
        let target = &result.target_table_name;
        assert!(target.starts_with("(SELECT * FROM pre.orders_by_day20240101_"));
        assert!(target.contains("UNION ALL SELECT * FROM pre.orders_by_day20240102_"));
        assert!(target.contains("UNION ALL SELECT * FROM pre.orders_by_day20240103_"));
        assert_eq!(target.matches(" UNION ALL ").count(), 2);
        assert!(!target.contains("WHERE 1 = 0"));
        assert_eq!(result.refresh_key_values.len(), 3);
        assert_eq!(result.build_range_end.as_deref(), Some("2024-01-03T10:00:00.000"));
        assert_eq!(
            f.source
                .tables()
                .iter()
                .filter(|t| t.starts_with("pre.orders_by_day2024"))
                .count(),
            3
        );
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_query_outside_build_range(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        let p = PreAggregationDescription {
            matched_time_dimension_date_range: Some([
                "2023-01-01T00:00:00.000".to_owned(),
                "2023-01-31T23:59:59.999".to_owned(),
            ]),
            ..by_day()
        };
        let result = loader(&f, p, blocking())?.load_pre_aggregations().await?;
        let target = &result.target_table_name;
        assert!(target.starts_with("(SELECT * FROM pre.orders_by_day20240103_"));
        assert!(target.ends_with(" WHERE 1 = 0)"));
        assert!(!target.contains("UNION ALL"));
        assert_eq!(result.build_range_end, None);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_too_many_partitions(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        let err = loader(
            &f,
            by_day(),
            LoadOptions {
                max_partitions: 2,
                ..blocking()
            },
        )?
        .load_pre_aggregations()
        .await
        .unwrap_err();
        assert!(err.is_bad_request());
        assert!(err.to_string().contains(
            "Pre-aggregation 'pre.orders_by_day' requested to build 3 partitions which exceeds \
             the maximum number of partitions per pre-aggregation of 2"
        ));
        assert!(f.source.tables().is_empty());
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_partition_descriptions(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        let partitions = loader(&f, by_day(), blocking())?
            .partition_pre_aggregations()
            .await?;
        assert_eq!(partitions.len(), 3);

        let first = &partitions[0];
        assert_eq!(first.table_name, "pre.orders_by_day20240101");
        assert!(first.expanded_partition);
        assert!(first.load_sql.sql.starts_with("CREATE TABLE pre.orders_by_day20240101 AS"));
        assert_eq!(
            first.load_sql.params,
            vec![
                json!("2024-01-01T00:00:00.000Z"),
                json!("2024-01-01T23:59:59.999Z")
            ]
        );

        // The last partition loads up to the end of the build range only.
        let last = &partitions[2];
        assert_eq!(
            last.load_sql.params,
            vec![
                json!("2024-01-03T00:00:00.000Z"),
                json!("2024-01-03T10:00:00.000Z")
            ]
        );
        assert_eq!(
            last.structure_version_load_sql.as_ref().map(|q| q.params.clone()),
            Some(vec![
                json!("2024-01-03T00:00:00.000Z"),
                json!("2024-01-03T23:59:59.999Z")
            ])
        );
        assert_eq!(last.build_range_start.as_deref(), Some("2024-01-03T00:00:00.000"));
        assert_eq!(last.build_range_end.as_deref(), Some("2024-01-03T10:00:00.000"));
        assert_eq!(last.seal_at.as_deref(), Some("2024-01-03T10:00:00.000Z"));

        // Expanded partitions are not split again.
        let expanded = loader(&f, last.clone(), blocking())?
            .partition_pre_aggregations()
            .await?;
        assert_eq!(expanded, vec![last.clone()]);
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_build_range_params(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        let loader = loader(&f, by_day(), LoadOptions::default())?;
        assert_eq!(
            loader
                .replace_query_build_range_params(&[json!("a"), json!(1)])
                .await?,
            None
        );
        let values = loader
            .replace_query_build_range_params(&[
                json!(BUILD_RANGE_START_LOCAL),
                json!(5),
                json!(BUILD_RANGE_END_LOCAL),
            ])
            .await?;
        assert_eq!(
            values,
            Some(vec![
                json!("2024-01-01T00:00:00.000"),
                json!(5),
                json!("2024-01-03T10:00:00.000")
            ])
        );
        Ok(())
    }

    fn with_lambda(p: PreAggregationDescription) -> (PreAggregationDescription, LambdaQuery) {
        (
            PreAggregationDescription {
                rollup_lambda_id: Some("Orders.lambda".to_owned()),
                ..p
            },
            LambdaQuery {
                sql_and_params: QueryWithParams::new(
                    "SELECT day, count(*) FROM orders WHERE created_at > ? GROUP BY 1 LIMIT ?",
                    vec![json!(FROM_PARTITION_RANGE), json!(MAX_SOURCE_ROW_LIMIT)],
                ),
                cache_key_queries: vec![],
            },
        )
    }

    #[orchestrator_macro::test_runtime]
    async fn test_lambda_tail(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        f.source.on_query(
            "FROM orders WHERE created_at > ?",
            vec![row(&[("day", json!("2024-01-03")), ("count", json!(2))])],
        );
        let (p, lambda_query) = with_lambda(by_day());
        let result = loader(
            &f,
            p,
            LoadOptions {
                lambda_query: Some(lambda_query),
                ..blocking()
            },
        )?
        .load_pre_aggregations()
        .await?;

        let lambda_table = result.lambda_table.expect("lambda table");
        assert_eq!(lambda_table.name, "lambda_pre_orders_by_day");
        assert_eq!(lambda_table.rows, vec![json!({"day": "2024-01-03", "count": 2})]);
        // The partially built last day is replaced by the lambda tail.
        let target = &result.target_table_name;
        assert!(target.contains("SELECT * FROM pre.orders_by_day20240101_"));
        assert!(target.contains("SELECT * FROM pre.orders_by_day20240102_"));
        assert!(!target.contains("pre.orders_by_day20240103_"));
        assert!(target.ends_with("UNION ALL SELECT * FROM lambda_pre_orders_by_day)"));
        assert_eq!(result.rollup_lambda_id.as_deref(), Some("Orders.lambda"));
        Ok(())
    }

    #[orchestrator_macro::test_runtime]
    async fn test_lambda_row_limit(rt: TestRuntime) -> anyhow::Result<()> {
        let f = fixture(&rt)?;
        with_build_range(&f);
        f.source.on_query(
            "FROM orders WHERE created_at > ?",
            vec![row(&[("day", json!("2024-01-03")), ("count", json!(2))])],
        );
        let (p, lambda_query) = with_lambda(by_day());
        let err = loader(
            &f,
            p,
            LoadOptions {
                lambda_query: Some(lambda_query),
                max_source_row_limit: 1,
                ..blocking()
            },
        )?
        .load_pre_aggregations()
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The maximum number of source rows 1 was reached for Orders.byDay"
        );
        Ok(())
    }
}
