//! Tunable limits and parameters for the query orchestrator.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so an oncall engineer can adjust these
//! safely if needed.
//!
//! All of these can be overridden with an environment variable of the same
//! name. Per-instance options (`QueueOptions`, `QueryCacheOptions`, ...) take
//! their defaults from here and can still be overridden in code.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Set a consistent thread stack size regardless of environment. This is
/// 2x Rust's default: https://doc.rust-lang.org/nightly/std/thread/index.html#stack-size
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));

/// 0 -> default (number of cores)
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// Maximum number of queries a single queue runs at once. Pre-aggregation
/// build queues override this with 1 and load-cache queues with 4.
pub static QUEUE_CONCURRENCY: LazyLock<usize> =
    LazyLock::new(|| env_config("QUEUE_CONCURRENCY", 2));

/// How long `execute_in_queue` blocks on a result before telling the caller to
/// poll again. Keep this well under any HTTP request timeout in front of the
/// orchestrator.
pub static QUEUE_CONTINUE_WAIT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUEUE_CONTINUE_WAIT_TIMEOUT", 5)));

/// Upper bound on a single handler execution. Exceeding it cancels the query.
pub static QUEUE_EXECUTION_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUEUE_EXECUTION_TIMEOUT", 600)));

/// A queued query nobody has polled for this long is considered orphaned and
/// is cancelled. Must be larger than `QUEUE_CONTINUE_WAIT_TIMEOUT`.
pub static QUEUE_ORPHANED_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUEUE_ORPHANED_TIMEOUT", 120)));

/// How often a running query refreshes its heartbeat. A query is stalled after
/// four missed heartbeats.
pub static QUEUE_HEART_BEAT_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUEUE_HEART_BEAT_INTERVAL", 30)));

/// Priority used for cached queries that don't specify one. Valid priorities
/// are in [-10000, 10000].
pub static DEFAULT_QUEUE_PRIORITY: LazyLock<i64> =
    LazyLock::new(|| env_config("DEFAULT_QUEUE_PRIORITY", 10));

/// Maximum number of results kept in the in-process query result LRU.
pub static QUERY_CACHE_MAX_ENTRIES: LazyLock<usize> =
    LazyLock::new(|| env_config("QUERY_CACHE_MAX_ENTRIES", 10000));

/// Renewal threshold for refresh key queries.
pub static REFRESH_KEY_RENEWAL_THRESHOLD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("REFRESH_KEY_RENEWAL_THRESHOLD", 120)));

/// Renewal threshold for the main query result when refresh keys are
/// unchanged.
pub static QUERY_RENEWAL_THRESHOLD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUERY_RENEWAL_THRESHOLD", 6 * 60 * 60)));

/// TTL of cached query results in the cache driver.
pub static QUERY_CACHE_EXPIRE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUERY_CACHE_EXPIRE", 24 * 60 * 60)));

/// TTL of the cached list of pre-aggregation tables per schema.
pub static PRE_AGGREGATIONS_SCHEMA_CACHE_EXPIRE: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config("PRE_AGGREGATIONS_SCHEMA_CACHE_EXPIRE", 60 * 60))
});

/// How long superseded structure versions of a pre-aggregation are kept before
/// the orphaned table sweep may drop them.
pub static STRUCTURE_VERSION_PERSIST_TIME: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_secs(env_config(
        "STRUCTURE_VERSION_PERSIST_TIME",
        60 * 60 * 24 * 30,
    ))
});

/// How long a table stays protected from the orphaned table sweep after a
/// query used it.
pub static USED_TABLE_PERSIST_TIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("USED_TABLE_PERSIST_TIME", 600)));

/// Maximum number of partitions a single pre-aggregation may be split into.
/// Exceeding it usually means an unbounded build range.
pub static MAX_PARTITIONS_PER_PRE_AGGREGATION: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_PARTITIONS_PER_PRE_AGGREGATION", 10000));

/// TTL of the "last touched" marker for pre-aggregation tables.
pub static TOUCH_PRE_AGG_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TOUCH_PRE_AGG_TIMEOUT", 60 * 60 * 24)));

/// Entries in the in-process LRU that debounces "last touched" writes.
pub static TOUCH_CACHE_MAX_COUNT: LazyLock<usize> =
    LazyLock::new(|| env_config("TOUCH_CACHE_MAX_COUNT", 8192));

/// Minimum interval between two "last touched" writes for the same table.
pub static TOUCH_CACHE_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TOUCH_CACHE_TTL", 60)));

/// TTL of the distributed lock guarding the orphaned table sweep, so a crashed
/// holder doesn't block the sweep forever.
pub static DROP_ORPHANED_LOCK_TTL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DROP_ORPHANED_LOCK_TTL", 300)));

/// Maximum number of rows downloaded from the source for a lambda tail table.
pub static LAMBDA_MAX_SOURCE_ROW_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("LAMBDA_MAX_SOURCE_ROW_LIMIT", 10000));
