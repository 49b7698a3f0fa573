//! Contract between the orchestrator and a source or external database.
//! Concrete drivers live outside this crate; the [`mock`] module provides an
//! in-memory one for tests.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;
use tokio::sync::Notify;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub type Row = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

pub type TableStructure = Vec<TableColumn>;

/// One row of a schema listing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCacheEntry {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_range_end: Option<String>,
}

/// Context passed along with statements, mostly for logging on the driver
/// side.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub request_id: Option<String>,
    pub query_key: Option<Value>,
    pub target_table_name: Option<String>,
    pub build_range_end: Option<String>,
    pub stream_offset: Option<String>,
    pub output_column_types: Option<TableStructure>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// `unload` can export straight from a query, no temp table needed.
    pub unload_without_temp_table: bool,
    /// The source keeps the temp table as a stream source, so it must not be
    /// dropped after the export.
    pub streaming_source: bool,
    /// The driver can ingest CSV files produced by `unload`.
    pub csv_import: bool,
    /// The driver can ingest a row stream.
    pub stream_import: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnloadOptions {
    /// In megabytes.
    pub max_file_size: u64,
    pub query: Option<(String, Vec<Value>)>,
}

impl Default for UnloadOptions {
    fn default() -> Self {
        Self {
            max_file_size: 64,
            query: None,
        }
    }
}

pub enum TableData {
    Rows(Vec<Row>),
    Stream(BoxStream<'static, anyhow::Result<Row>>),
    /// Locations of CSV files produced by an unload.
    Csv(Vec<String>),
}

impl TableData {
    pub fn kind(&self) -> &'static str {
        match self {
            TableData::Rows(_) => "rows",
            TableData::Stream(_) => "stream",
            TableData::Csv(_) => "csv",
        }
    }
}

pub struct DownloadTableData {
    pub data: TableData,
    pub types: Option<TableStructure>,
}

impl DownloadTableData {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            data: TableData::Rows(rows),
            types: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSql {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableIndex {
    pub index_name: String,
    #[serde(rename = "type", default)]
    pub index_type: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadOptions {
    pub aggregations_columns: Vec<String>,
    pub create_table_indexes: Vec<CreateTableIndex>,
    pub seal_at: Option<String>,
}

#[async_trait]
pub trait DriverInterface: Send + Sync {
    async fn query(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
        handle: &QueryHandle,
    ) -> anyhow::Result<Vec<Row>>;

    /// Tables of `schema`, without the schema prefix.
    async fn get_tables_query(&self, schema: &str) -> anyhow::Result<Vec<TableCacheEntry>>;

    async fn table_column_types(&self, table: &str) -> anyhow::Result<TableStructure>;

    async fn query_column_types(
        &self,
        _sql: &str,
        _params: &[Value],
    ) -> anyhow::Result<Option<TableStructure>> {
        Ok(None)
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> anyhow::Result<()>;

    async fn drop_table(&self, table: &str) -> anyhow::Result<()>;

    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
        handle: &QueryHandle,
    ) -> anyhow::Result<()>;

    async fn download_query_results(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> anyhow::Result<DownloadTableData>;

    async fn download_table(
        &self,
        table: &str,
        options: &QueryOptions,
    ) -> anyhow::Result<DownloadTableData>;

    /// Whether `stream_table` is implemented.
    fn supports_stream(&self) -> bool {
        false
    }

    async fn stream_table(&self, _sql: &str, _params: &[Value]) -> anyhow::Result<DownloadTableData> {
        anyhow::bail!("Streaming is not supported by this driver")
    }

    async fn is_unload_supported(&self, _options: &UnloadOptions) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn unload(&self, _table: &str, _options: &UnloadOptions) -> anyhow::Result<DownloadTableData> {
        anyhow::bail!("Unload is not supported by this driver")
    }

    async fn unload_from_query(
        &self,
        _sql: &str,
        _params: &[Value],
        _options: &UnloadOptions,
    ) -> anyhow::Result<DownloadTableData> {
        anyhow::bail!("Unload is not supported by this driver")
    }

    async fn upload_table_with_indexes(
        &self,
        table: &str,
        types: &TableStructure,
        data: DownloadTableData,
        indexes: &[IndexSql],
        unique_key_columns: Option<&[String]>,
        options: &QueryOptions,
        upload: &UploadOptions,
    ) -> anyhow::Result<()>;

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Read-only sources can't host temp tables, so external builds read the
    /// query results directly.
    fn read_only(&self) -> bool {
        false
    }

    /// Stops the statement `handle` was passed to. The default only flags the
    /// handle.
    async fn cancel_query(&self, handle: &QueryHandle) -> anyhow::Result<()> {
        handle.cancel();
        Ok(())
    }

    async fn test_connection(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Resolves the driver of a data source.
pub trait DriverFactory: Send + Sync {
    fn driver(&self, data_source: &str) -> anyhow::Result<Arc<dyn DriverInterface>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&str) -> anyhow::Result<Arc<dyn DriverInterface>> + Send + Sync,
{
    fn driver(&self, data_source: &str) -> anyhow::Result<Arc<dyn DriverInterface>> {
        self(data_source)
    }
}

struct QueryHandleInner {
    id: u64,
    canceled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token of one running statement.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<QueryHandleInner>,
}

impl QueryHandle {
    pub fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(QueryHandleInner {
                id,
                canceled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn canceled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}

/// Statements currently running in this process, so a queue cancel handler
/// can reach them by id.
#[derive(Default)]
pub struct QueryHandleRegistry {
    next_id: AtomicU64,
    running: Mutex<BTreeMap<u64, (QueryHandle, Arc<dyn DriverInterface>)>>,
}

impl QueryHandleRegistry {
    pub fn register(&self, driver: Arc<dyn DriverInterface>) -> QueryHandle {
        let handle = QueryHandle::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.running
            .lock()
            .insert(handle.id(), (handle.clone(), driver));
        handle
    }

    pub fn complete(&self, id: u64) {
        self.running.lock().remove(&id);
    }

    /// Returns whether a statement with this id was running here.
    pub async fn cancel(&self, id: u64) -> anyhow::Result<bool> {
        let Some((handle, driver)) = self.running.lock().remove(&id) else {
            return Ok(false);
        };
        tracing::info!("Cancelling query {id}");
        driver.cancel_query(&handle).await?;
        Ok(true)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}
