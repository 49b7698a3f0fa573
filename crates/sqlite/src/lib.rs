//! Cache and queue backends stored in a SQLite database file, so several
//! processes can share one query cache and one set of queues.
//!
//! Every operation runs in its own `IMMEDIATE` transaction, which takes the
//! database write lock up front and makes each call atomic across processes.

use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};

use common::runtime::Runtime;
use parking_lot::Mutex;
use query_orchestrator::{
    cache::CacheDriver,
    queue::{
        local::LocalDriverFactory,
        CacheAndQueueDriver,
        CacheAndQueueDriverFactory,
        QueueDriver,
        QueueDriverOptions,
    },
};
use rusqlite::{
    Connection,
    TransactionBehavior,
};

mod cache;
mod queue;

pub use self::{
    cache::SqliteCacheDriver,
    queue::{
        SqliteQueueDriver,
        SqliteQueueDriverConnection,
    },
};

/// How long a write waits for another process to release the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// We only have a single Sqlite connection per process which does not allow
// async calls, so calls on it are serialized.
pub(crate) struct Database {
    connection: Mutex<Connection>,
}

impl Database {
    fn open(path: &str) -> anyhow::Result<Self> {
        let connection = Connection::open(path)?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        // Execute create tables unconditionally since they are idempotent.
        connection.execute_batch(CACHE_INIT)?;
        connection.execute_batch(QUEUE_INIT)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Runs `f` in an `IMMEDIATE` transaction, committing if it succeeds.
    pub(crate) fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut connection = self.connection.lock();
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Runs a read-only `f` outside of a write transaction.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        f(&self.connection.lock())
    }
}

/// Queues and cache of one orchestrator backed by the database at `path`.
/// Factories opened on the same file in different processes observe the same
/// state.
pub struct SqliteDriverFactory<RT: Runtime> {
    rt: RT,
    database: Arc<Database>,
    newly_created: bool,
}

impl<RT: Runtime> SqliteDriverFactory<RT> {
    pub fn new(rt: RT, path: &str) -> anyhow::Result<Self> {
        let newly_created = !Path::new(path).exists();
        let database = Arc::new(Database::open(path)?);
        tracing::info!("Opened cache and queue database at {path} (new: {newly_created})");
        Ok(Self {
            rt,
            database,
            newly_created,
        })
    }

    /// Whether the database file didn't exist before this factory opened it.
    pub fn is_fresh(&self) -> bool {
        self.newly_created
    }
}

impl<RT: Runtime> CacheAndQueueDriverFactory for SqliteDriverFactory<RT> {
    fn queue_driver(&self, options: QueueDriverOptions) -> anyhow::Result<Arc<dyn QueueDriver>> {
        Ok(Arc::new(SqliteQueueDriver::new(
            self.rt.clone(),
            self.database.clone(),
            options,
        )))
    }

    fn cache_driver(&self) -> anyhow::Result<Arc<dyn CacheDriver>> {
        Ok(Arc::new(SqliteCacheDriver::new(
            self.rt.clone(),
            self.database.clone(),
        )))
    }
}

/// The backend `driver` selects.
pub fn cache_and_queue_driver_factory<RT: Runtime>(
    rt: RT,
    driver: &CacheAndQueueDriver,
) -> anyhow::Result<Arc<dyn CacheAndQueueDriverFactory>> {
    Ok(match driver {
        CacheAndQueueDriver::Memory => Arc::new(LocalDriverFactory::new(rt)),
        CacheAndQueueDriver::Sqlite { path } => Arc::new(SqliteDriverFactory::new(rt, path)?),
    })
}

const CACHE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key TEXT NOT NULL,
    json_value TEXT NOT NULL,
    expires_at INTEGER NOT NULL,

    PRIMARY KEY (key)
);

CREATE TABLE IF NOT EXISTS cache_locks (
    key TEXT NOT NULL,
    expires_at INTEGER NOT NULL,

    PRIMARY KEY (key)
);
"#;

const QUEUE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS queue_defs (
    defs_key TEXT NOT NULL,
    hash TEXT NOT NULL,
    json_value TEXT NOT NULL,

    PRIMARY KEY (defs_key, hash)
);

CREATE TABLE IF NOT EXISTS queue_sets (
    set_key TEXT NOT NULL,
    member TEXT NOT NULL,
    score INTEGER NOT NULL,
    queue_id INTEGER NULL,

    PRIMARY KEY (set_key, member)
);
CREATE INDEX IF NOT EXISTS queue_sets_by_score ON queue_sets (set_key, score, member);

CREATE TABLE IF NOT EXISTS queue_locks (
    key TEXT NOT NULL,
    processing_id INTEGER NOT NULL,

    PRIMARY KEY (key)
);

CREATE TABLE IF NOT EXISTS queue_results (
    key TEXT NOT NULL,
    json_value TEXT NULL,
    readers INTEGER NOT NULL,
    expires_at INTEGER NULL,

    PRIMARY KEY (key)
);

CREATE TABLE IF NOT EXISTS queue_counters (
    key TEXT NOT NULL,
    value INTEGER NOT NULL,

    PRIMARY KEY (key)
);
"#;
