//! In-memory [`DriverInterface`] that records every statement it runs.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    select_biased,
    FutureExt,
    TryStreamExt,
};
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    DownloadTableData,
    DriverCapabilities,
    DriverInterface,
    IndexSql,
    QueryHandle,
    QueryOptions,
    Row,
    TableCacheEntry,
    TableColumn,
    TableData,
    TableStructure,
    UploadOptions,
};

#[derive(Default)]
struct MockState {
    /// Full `schema.table` name to rows.
    tables: BTreeMap<String, Vec<Row>>,
    /// Build range end a table was loaded with, reported in listings.
    build_range_ends: BTreeMap<String, String>,
    /// SQL substring to the rows a matching query returns. The longest match
    /// wins.
    results: BTreeMap<String, Vec<Row>>,
    failures: BTreeMap<String, String>,
    statements: Vec<String>,
    query_delays: BTreeMap<String, Duration>,
    capabilities: DriverCapabilities,
    read_only: bool,
    canceled: Vec<u64>,
}

#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(self, capabilities: DriverCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    pub fn with_read_only(self, read_only: bool) -> Self {
        self.state.lock().read_only = read_only;
        self
    }

    /// Queries whose SQL contains `sql_fragment` return `rows`.
    pub fn on_query(&self, sql_fragment: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .results
            .insert(sql_fragment.to_owned(), rows);
    }

    /// Queries whose SQL contains `sql_fragment` fail with `message`.
    pub fn fail_query(&self, sql_fragment: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(sql_fragment.to_owned(), message.to_owned());
    }

    /// Queries whose SQL contains `sql_fragment` take `delay` of runtime time.
    pub fn delay_query(&self, sql_fragment: &str, delay: Duration) {
        self.state
            .lock()
            .query_delays
            .insert(sql_fragment.to_owned(), delay);
    }

    pub fn add_table(&self, table: &str, rows: Vec<Row>) {
        self.state.lock().tables.insert(table.to_owned(), rows);
    }

    pub fn tables(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    pub fn table_rows(&self, table: &str) -> Option<Vec<Row>> {
        self.state.lock().tables.get(table).cloned()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Number of recorded statements containing `fragment`.
    pub fn count_statements(&self, fragment: &str) -> usize {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|s| s.contains(fragment))
            .count()
    }

    pub fn canceled_handles(&self) -> Vec<u64> {
        self.state.lock().canceled.clone()
    }

    fn store_table(&self, table: &str, rows: Vec<Row>, options: &QueryOptions) {
        let mut state = self.state.lock();
        state.tables.insert(table.to_owned(), rows);
        match &options.build_range_end {
            Some(end) => state.build_range_ends.insert(table.to_owned(), end.clone()),
            None => state.build_range_ends.remove(table),
        };
    }

    fn record(&self, statement: String) {
        self.state.lock().statements.push(statement);
    }

    fn rows_for(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let state = self.state.lock();
        if let Some((_, message)) = state.failures.iter().find(|(f, _)| sql.contains(f.as_str())) {
            anyhow::bail!("{message}");
        }
        Ok(state
            .results
            .iter()
            .filter(|(fragment, _)| sql.contains(fragment.as_str()))
            .max_by_key(|(fragment, _)| fragment.len())
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn run(&self, sql: &str, handle: &QueryHandle) -> anyhow::Result<Vec<Row>> {
        let delay = self
            .state
            .lock()
            .query_delays
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            select_biased! {
                _ = handle.canceled().fuse() => anyhow::bail!("Query {} was canceled", handle.id()),
                _ = tokio::time::sleep(delay).fuse() => {},
            }
        }
        if handle.is_canceled() {
            anyhow::bail!("Query {} was canceled", handle.id());
        }
        self.rows_for(sql)
    }
}

fn columns_of(rows: &[Row]) -> TableStructure {
    rows.first()
        .map(|row| {
            row.iter()
                .map(|(name, value)| TableColumn {
                    name: name.clone(),
                    column_type: match value {
                        Value::Number(_) => "int".to_owned(),
                        Value::Bool(_) => "boolean".to_owned(),
                        _ => "text".to_owned(),
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl DriverInterface for MockDriver {
    async fn query(
        &self,
        sql: &str,
        _params: &[Value],
        _options: &QueryOptions,
        handle: &QueryHandle,
    ) -> anyhow::Result<Vec<Row>> {
        self.record(sql.to_owned());
        self.run(sql, handle).await
    }

    async fn get_tables_query(&self, schema: &str) -> anyhow::Result<Vec<TableCacheEntry>> {
        let prefix = format!("{schema}.");
        let state = self.state.lock();
        Ok(state
            .tables
            .keys()
            .filter_map(|table| {
                let table_name = table.strip_prefix(&prefix)?;
                Some(TableCacheEntry {
                    table_name: table_name.to_owned(),
                    build_range_end: state.build_range_ends.get(table).cloned(),
                })
            })
            .collect())
    }

    async fn table_column_types(&self, table: &str) -> anyhow::Result<TableStructure> {
        let state = self.state.lock();
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| anyhow::anyhow!("Table {table} doesn't exist"))?;
        Ok(columns_of(rows))
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> anyhow::Result<()> {
        self.record(format!("CREATE SCHEMA IF NOT EXISTS {schema}"));
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> anyhow::Result<()> {
        self.record(format!("DROP TABLE {table}"));
        let mut state = self.state.lock();
        state.tables.remove(table);
        state.build_range_ends.remove(table);
        Ok(())
    }

    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        sql: &str,
        _params: &[Value],
        options: &QueryOptions,
        handle: &QueryHandle,
    ) -> anyhow::Result<()> {
        self.record(format!("CREATE TABLE {table} AS {sql}"));
        let rows = self.run(sql, handle).await?;
        self.store_table(table, rows, options);
        Ok(())
    }

    async fn download_query_results(
        &self,
        sql: &str,
        _params: &[Value],
        _options: &QueryOptions,
    ) -> anyhow::Result<DownloadTableData> {
        self.record(sql.to_owned());
        let rows = self.rows_for(sql)?;
        let types = columns_of(&rows);
        Ok(DownloadTableData {
            data: TableData::Rows(rows),
            types: Some(types),
        })
    }

    async fn download_table(
        &self,
        table: &str,
        _options: &QueryOptions,
    ) -> anyhow::Result<DownloadTableData> {
        self.record(format!("SELECT * FROM {table}"));
        let rows = self
            .table_rows(table)
            .ok_or_else(|| anyhow::anyhow!("Table {table} doesn't exist"))?;
        Ok(DownloadTableData::rows(rows))
    }

    fn supports_stream(&self) -> bool {
        true
    }

    async fn stream_table(&self, sql: &str, _params: &[Value]) -> anyhow::Result<DownloadTableData> {
        self.record(format!("STREAM {sql}"));
        let rows = match sql.strip_prefix("SELECT * FROM ") {
            Some(table) => self.table_rows(table).unwrap_or_default(),
            None => self.rows_for(sql)?,
        };
        Ok(DownloadTableData {
            data: TableData::Stream(Box::pin(futures::stream::iter(rows.into_iter().map(Ok)))),
            types: None,
        })
    }

    async fn upload_table_with_indexes(
        &self,
        table: &str,
        types: &TableStructure,
        data: DownloadTableData,
        indexes: &[IndexSql],
        _unique_key_columns: Option<&[String]>,
        options: &QueryOptions,
        _upload: &UploadOptions,
    ) -> anyhow::Result<()> {
        let kind = data.data.kind();
        let rows = match data.data {
            TableData::Rows(rows) => rows,
            TableData::Stream(stream) => stream.try_collect().await?,
            TableData::Csv(_) => Vec::new(),
        };
        self.record(format!(
            "UPLOAD {table} ({} columns, {kind})",
            types.len()
        ));
        for index in indexes {
            self.record(index.sql.clone());
        }
        self.store_table(table, rows, options);
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.state.lock().capabilities
    }

    fn read_only(&self) -> bool {
        self.state.lock().read_only
    }

    async fn cancel_query(&self, handle: &QueryHandle) -> anyhow::Result<()> {
        self.state.lock().canceled.push(handle.id());
        handle.cancel();
        Ok(())
    }
}
