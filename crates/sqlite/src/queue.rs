use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::runtime::Runtime;
use query_orchestrator::queue::{
    query_key_hash,
    retry,
    AddToQueueRequest,
    AddToQueueResponse,
    ProcessingId,
    QueryDef,
    QueryDefUpdate,
    QueryKey,
    QueryKeyHash,
    QueryKeysTuple,
    QueryStageState,
    QueueDriver,
    QueueDriverConnection,
    QueueDriverOptions,
    QueueId,
    QueueResult,
    RetrieveForProcessingResponse,
    OPTIMISTIC_UPDATE_ATTEMPTS,
};
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
};

use crate::Database;

/// How often a blocked waiter polls for the result of its query.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const TO_PROCESS: &str = "QUEUE";
const ACTIVE: &str = "ACTIVE";
const RECENT: &str = "RECENT";
const HEART_BEAT: &str = "HEART_BEAT";
const QUERIES: &str = "QUERIES";
const PROCESSING_COUNTER: &str = "PROCESSING_COUNTER";

/// [`QueueDriver`] whose queue state lives in the shared database, keyed by
/// the queue prefix like the in-memory backend.
pub struct SqliteQueueDriver<RT: Runtime> {
    rt: RT,
    database: Arc<Database>,
    options: Arc<QueueDriverOptions>,
}

impl<RT: Runtime> SqliteQueueDriver<RT> {
    pub(crate) fn new(rt: RT, database: Arc<Database>, options: QueueDriverOptions) -> Self {
        Self {
            rt,
            database,
            options: Arc::new(options),
        }
    }
}

#[async_trait]
impl<RT: Runtime> QueueDriver for SqliteQueueDriver<RT> {
    async fn create_connection(&self) -> anyhow::Result<Arc<dyn QueueDriverConnection>> {
        Ok(Arc::new(SqliteQueueDriverConnection {
            rt: self.rt.clone(),
            database: self.database.clone(),
            options: self.options.clone(),
        }))
    }

    fn redis_hash(&self, query_key: &QueryKey) -> QueryKeyHash {
        query_key_hash(query_key, &self.options.process_uid)
    }
}

pub struct SqliteQueueDriverConnection<RT: Runtime> {
    rt: RT,
    database: Arc<Database>,
    options: Arc<QueueDriverOptions>,
}

impl<RT: Runtime> SqliteQueueDriverConnection<RT> {
    fn set_key(&self, set: &str) -> String {
        self.options.queue_key(set)
    }

    fn members(
        &self,
        connection: &Connection,
        set: &str,
        below: Option<i64>,
    ) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let mut stmt = connection.prepare_cached(SET_MEMBERS)?;
        let members = stmt
            .query_map(params![self.set_key(set), below], |row| {
                Ok((
                    QueryKeyHash::new(row.get::<_, String>(0)?),
                    row.get::<_, Option<QueueId>>(1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    fn member_keys(&self, connection: &Connection, set: &str) -> anyhow::Result<Vec<QueryKeyHash>> {
        Ok(self
            .members(connection, set, None)?
            .into_iter()
            .map(|(hash, _)| hash)
            .collect())
    }

    fn contains(
        &self,
        connection: &Connection,
        set: &str,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<bool> {
        Ok(connection
            .query_row(
                SET_CONTAINS,
                params![self.set_key(set), hash.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn count(&self, connection: &Connection, set: &str) -> anyhow::Result<usize> {
        let count: i64 =
            connection.query_row(SET_COUNT, params![self.set_key(set)], |row| row.get(0))?;
        Ok(usize::try_from(count)?)
    }

    fn insert(
        &self,
        connection: &Connection,
        set: &str,
        hash: &QueryKeyHash,
        score: i64,
        queue_id: Option<QueueId>,
    ) -> anyhow::Result<()> {
        connection.execute(
            SET_INSERT,
            params![self.set_key(set), hash.as_str(), score, queue_id],
        )?;
        Ok(())
    }

    fn remove(&self, connection: &Connection, set: &str, hash: &QueryKeyHash) -> anyhow::Result<()> {
        connection.execute(SET_REMOVE, params![self.set_key(set), hash.as_str()])?;
        Ok(())
    }

    fn query_def(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<QueryDef>> {
        let json_value: Option<String> = connection
            .query_row(
                GET_DEF,
                params![self.set_key(QUERIES), hash.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        json_value
            .map(|json_value| Ok(serde_json::from_str(&json_value)?))
            .transpose()
    }

    fn put_query_def(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
        def: &QueryDef,
    ) -> anyhow::Result<()> {
        connection.execute(
            PUT_DEF,
            params![
                self.set_key(QUERIES),
                hash.as_str(),
                serde_json::to_string(def)?
            ],
        )?;
        Ok(())
    }

    fn processing_lock(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<ProcessingId>> {
        Ok(connection
            .query_row(GET_LOCK, params![self.options.lock_key(hash)], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn remove_query(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<QueryDef>> {
        for set in [ACTIVE, HEART_BEAT, TO_PROCESS, RECENT] {
            self.remove(connection, set, hash)?;
        }
        connection.execute(REMOVE_LOCK, params![self.options.lock_key(hash)])?;
        let def = self.query_def(connection, hash)?;
        connection.execute(
            REMOVE_DEF,
            params![self.set_key(QUERIES), hash.as_str()],
        )?;
        Ok(def)
    }

    /// `(json_value, readers)` of the result row. A missing `json_value`
    /// means callers are waiting for a query that hasn't finished yet.
    fn result_row(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<(Option<String>, i64)>> {
        let now = self.rt.unix_millis();
        connection.execute(REMOVE_EXPIRED_RESULTS, params![now])?;
        Ok(connection
            .query_row(
                GET_RESULT,
                params![self.options.result_key(hash)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }

    /// Counts one read of a finished result, dropping it after the last one.
    fn read_result(
        &self,
        connection: &Connection,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<QueueResult>> {
        let Some((Some(json_value), readers)) = self.result_row(connection, hash)? else {
            return Ok(None);
        };
        let key = self.options.result_key(hash);
        if readers <= 1 {
            connection.execute(REMOVE_RESULT, params![&key])?;
        } else {
            connection.execute(SET_READERS, params![readers - 1, &key])?;
        }
        Ok(Some(serde_json::from_str(&json_value)?))
    }
}

#[async_trait]
impl<RT: Runtime> QueueDriverConnection for SqliteQueueDriverConnection<RT> {
    async fn get_result(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueueResult>> {
        self.database
            .transaction(|connection| self.read_result(connection, hash))
    }

    async fn get_result_blocking(
        &self,
        hash: &QueryKeyHash,
    ) -> anyhow::Result<Option<QueueResult>> {
        let deadline = self.rt.unix_millis()
            + i64::try_from(self.options.continue_wait_timeout.as_millis())?;
        loop {
            let (result, queued) = self.database.transaction(|connection| {
                let result = self.read_result(connection, hash)?;
                let queued = result.is_none()
                    && (self.query_def(connection, hash)?.is_some()
                        || self.result_row(connection, hash)?.is_some());
                Ok((result, queued))
            })?;
            if result.is_some() || !queued {
                return Ok(result);
            }
            if self.rt.unix_millis() >= deadline {
                return Ok(None);
            }
            self.rt.wait(RESULT_POLL_INTERVAL).await;
        }
    }

    async fn add_to_queue(
        &self,
        request: AddToQueueRequest,
    ) -> anyhow::Result<AddToQueueResponse> {
        let now = self.rt.unix_millis();
        let hash = query_key_hash(&request.query_key, &self.options.process_uid);
        let key_score = request.key_score;
        let orphaned_time = request.orphaned_time;
        let queue_id = Some(request.queue_id);
        let awaits_result = request.awaits_result;
        let result_key = self.options.result_key(&hash);

        self.database.transaction(|connection| {
            match self.result_row(connection, &hash)? {
                Some((Some(_), readers)) if readers > 0 => {
                    if awaits_result {
                        connection.execute(SET_READERS, params![readers + 1, &result_key])?;
                    }
                    return Ok(AddToQueueResponse {
                        added: false,
                        queue_id: None,
                        queue_size: self.count(connection, TO_PROCESS)?,
                        added_to_queue_time: now,
                    });
                },
                // Nobody is waiting for this one, compute it again.
                Some((Some(_), _)) => {
                    connection.execute(REMOVE_RESULT, params![&result_key])?;
                },
                _ => {},
            }
            if awaits_result {
                connection.execute(ADD_READER, params![&result_key])?;
            }
            let def = match self.query_def(connection, &hash)? {
                Some(def) => def,
                None => {
                    let def = request.into_query_def(now);
                    self.put_query_def(connection, &hash, &def)?;
                    def
                },
            };
            let added = !self.contains(connection, TO_PROCESS, &hash)?
                && !self.contains(connection, ACTIVE, &hash)?;
            if added {
                self.insert(connection, TO_PROCESS, &hash, key_score, queue_id)?;
            }
            self.insert(connection, RECENT, &hash, orphaned_time, queue_id)?;
            Ok(AddToQueueResponse {
                added,
                queue_id: def.queue_id,
                queue_size: self.count(connection, TO_PROCESS)?,
                added_to_queue_time: def.added_to_queue_time,
            })
        })
    }

    async fn get_to_process_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        self.database
            .read(|connection| self.members(connection, TO_PROCESS, None))
    }

    async fn get_active_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        self.database
            .read(|connection| self.members(connection, ACTIVE, None))
    }

    async fn get_orphaned_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let now = self.rt.unix_millis();
        self.database
            .read(|connection| self.members(connection, RECENT, Some(now)))
    }

    async fn get_stalled_queries(&self) -> anyhow::Result<Vec<QueryKeysTuple>> {
        let timeout = i64::try_from(self.options.heart_beat_timeout.as_millis())?;
        let limit = self.rt.unix_millis() - timeout;
        self.database
            .read(|connection| self.members(connection, HEART_BEAT, Some(limit)))
    }

    async fn get_active_and_to_process(
        &self,
    ) -> anyhow::Result<(Vec<QueryKeysTuple>, Vec<QueryKeysTuple>)> {
        self.database.read(|connection| {
            Ok((
                self.members(connection, ACTIVE, None)?,
                self.members(connection, TO_PROCESS, None)?,
            ))
        })
    }

    async fn get_query_and_remove(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>> {
        self.database.transaction(|connection| {
            // Waiters of a canceled query stop polling.
            connection.execute(REMOVE_PENDING_RESULT, params![self.options.result_key(hash)])?;
            self.remove_query(connection, hash)
        })
    }

    async fn set_result_and_remove_query(
        &self,
        hash: &QueryKeyHash,
        result: QueueResult,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool> {
        let json_value = serde_json::to_string(&result)?;
        let expires_at =
            self.rt.unix_millis() + i64::try_from(self.options.result_ttl().as_millis())?;
        self.database.transaction(|connection| {
            if self.processing_lock(connection, hash)? != Some(processing_id) {
                return Ok(false);
            }
            self.remove_query(connection, hash)?;
            connection.execute(
                PUT_RESULT,
                params![self.options.result_key(hash), &json_value, expires_at],
            )?;
            Ok(true)
        })
    }

    async fn get_next_processing_id(&self) -> anyhow::Result<ProcessingId> {
        self.database.transaction(|connection| {
            Ok(connection.query_row(
                NEXT_COUNTER,
                params![self.set_key(PROCESSING_COUNTER)],
                |row| row.get(0),
            )?)
        })
    }

    async fn get_query_stage_state(&self, only_keys: bool) -> anyhow::Result<QueryStageState> {
        self.database.read(|connection| {
            let mut defs = BTreeMap::new();
            if !only_keys {
                let mut stmt = connection.prepare_cached(ALL_DEFS)?;
                let rows = stmt
                    .query_map(params![self.set_key(QUERIES)], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                for (hash, json_value) in rows {
                    defs.insert(QueryKeyHash::new(hash), serde_json::from_str(&json_value)?);
                }
            }
            Ok(QueryStageState {
                active: self.member_keys(connection, ACTIVE)?,
                to_process: self.member_keys(connection, TO_PROCESS)?,
                defs,
            })
        })
    }

    async fn get_query_def(&self, hash: &QueryKeyHash) -> anyhow::Result<Option<QueryDef>> {
        self.database
            .read(|connection| self.query_def(connection, hash))
    }

    async fn update_heart_beat(&self, hash: &QueryKeyHash) -> anyhow::Result<()> {
        let now = self.rt.unix_millis();
        self.database.transaction(|connection| {
            connection.execute(
                SET_SCORE,
                params![now, self.set_key(HEART_BEAT), hash.as_str()],
            )?;
            Ok(())
        })
    }

    async fn retrieve_for_processing(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
    ) -> anyhow::Result<Option<RetrieveForProcessingResponse>> {
        let now = self.rt.unix_millis();
        let concurrency = self.options.concurrency;
        self.database.transaction(|connection| {
            if self.processing_lock(connection, hash)?.is_some() {
                return Ok(None);
            }
            connection.execute(
                PUT_LOCK,
                params![self.options.lock_key(hash), processing_id],
            )?;

            let query_def = self.query_def(connection, hash)?;
            let queue_id = query_def.as_ref().and_then(|def| def.queue_id);
            let added = self.count(connection, ACTIVE)? < concurrency
                && !self.contains(connection, ACTIVE, hash)?;
            if added {
                self.insert(connection, ACTIVE, hash, processing_id, queue_id)?;
                self.remove(connection, TO_PROCESS, hash)?;
            }
            self.insert(connection, HEART_BEAT, hash, now, queue_id)?;
            Ok(Some(RetrieveForProcessingResponse {
                added,
                queue_id,
                active_keys: self.member_keys(connection, ACTIVE)?,
                queue_size: self.count(connection, TO_PROCESS)?,
                query_def,
                lock_acquired: true,
            }))
        })
    }

    async fn free_processing_lock(
        &self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
    ) -> anyhow::Result<()> {
        self.database.transaction(|connection| {
            if self.processing_lock(connection, hash)? == Some(processing_id) {
                connection.execute(REMOVE_LOCK, params![self.options.lock_key(hash)])?;
                if activated {
                    self.remove(connection, ACTIVE, hash)?;
                }
            }
            Ok(())
        })
    }

    async fn optimistic_query_update(
        &self,
        hash: &QueryKeyHash,
        update: QueryDefUpdate,
        processing_id: ProcessingId,
    ) -> anyhow::Result<bool> {
        let update = &update;
        retry(hash, OPTIMISTIC_UPDATE_ATTEMPTS, move || async move {
            // The def is read outside the write transaction and only swapped
            // in if nobody replaced it since.
            let current: Option<String> = self.database.read(|connection| {
                Ok(connection
                    .query_row(
                        GET_DEF,
                        params![self.set_key(QUERIES), hash.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?)
            })?;
            self.database.transaction(|connection| {
                if self.processing_lock(connection, hash)? != Some(processing_id) {
                    return Ok(Some(false));
                }
                let Some(current) = &current else {
                    return Ok(Some(true));
                };
                let mut def: QueryDef = serde_json::from_str(current)?;
                def.apply(update);
                let swapped = connection.execute(
                    SWAP_DEF,
                    params![
                        serde_json::to_string(&def)?,
                        self.set_key(QUERIES),
                        hash.as_str(),
                        current
                    ],
                )?;
                Ok((swapped == 1).then_some(true))
            })
        })
        .await
    }
}

const SET_MEMBERS: &str = r#"
SELECT member, queue_id
FROM queue_sets
WHERE set_key = $1 AND ($2 IS NULL OR score < $2)
ORDER BY score ASC, member ASC
"#;
const SET_CONTAINS: &str = "SELECT 1 FROM queue_sets WHERE set_key = ? AND member = ?";
const SET_COUNT: &str = "SELECT COUNT(*) FROM queue_sets WHERE set_key = ?";
const SET_INSERT: &str = "INSERT OR REPLACE INTO queue_sets VALUES (?, ?, ?, ?)";
const SET_REMOVE: &str = "DELETE FROM queue_sets WHERE set_key = ? AND member = ?";
const SET_SCORE: &str = "UPDATE queue_sets SET score = ? WHERE set_key = ? AND member = ?";

const GET_DEF: &str = "SELECT json_value FROM queue_defs WHERE defs_key = ? AND hash = ?";
const PUT_DEF: &str = "INSERT OR REPLACE INTO queue_defs VALUES (?, ?, ?)";
const SWAP_DEF: &str =
    "UPDATE queue_defs SET json_value = ? WHERE defs_key = ? AND hash = ? AND json_value = ?";
const REMOVE_DEF: &str = "DELETE FROM queue_defs WHERE defs_key = ? AND hash = ?";
const ALL_DEFS: &str = "SELECT hash, json_value FROM queue_defs WHERE defs_key = ? ORDER BY hash";

const GET_LOCK: &str = "SELECT processing_id FROM queue_locks WHERE key = ?";
const PUT_LOCK: &str = "INSERT INTO queue_locks VALUES (?, ?)";
const REMOVE_LOCK: &str = "DELETE FROM queue_locks WHERE key = ?";

const GET_RESULT: &str = "SELECT json_value, readers FROM queue_results WHERE key = ?";
const PUT_RESULT: &str = r#"
INSERT INTO queue_results (key, json_value, readers, expires_at) VALUES ($1, $2, 0, $3)
ON CONFLICT (key) DO UPDATE SET json_value = $2, expires_at = $3
"#;
const ADD_READER: &str = r#"
INSERT INTO queue_results (key, json_value, readers, expires_at) VALUES ($1, NULL, 1, NULL)
ON CONFLICT (key) DO UPDATE SET readers = readers + 1
"#;
const SET_READERS: &str = "UPDATE queue_results SET readers = ? WHERE key = ?";
const REMOVE_RESULT: &str = "DELETE FROM queue_results WHERE key = ?";
const REMOVE_PENDING_RESULT: &str = "DELETE FROM queue_results WHERE key = ? AND json_value IS NULL";
const REMOVE_EXPIRED_RESULTS: &str =
    "DELETE FROM queue_results WHERE expires_at IS NOT NULL AND expires_at <= ?";

// The first id handed out is 2, matching the in-memory backend whose counter
// starts at 1.
const NEXT_COUNTER: &str = r#"
INSERT INTO queue_counters (key, value) VALUES ($1, 2)
ON CONFLICT (key) DO UPDATE SET value = value + 1
RETURNING value
"#;
