//! Query orchestration: a distributed priority queue, a renewal-based result
//! cache and the pre-aggregation build engine layered on top of both.
//!
//! All persistence goes through the [`queue::QueueDriver`] and
//! [`cache::CacheDriver`] traits, so the same business logic runs against the
//! in-process backend in [`queue::local`] and [`cache::local`] or a shared
//! backend such as the one in the `sqlite` crate.

pub mod cache;
pub mod driver;
mod metrics;
pub mod orchestrator;
pub mod pre_aggregations;
pub mod query_cache;
pub mod queue;

pub use crate::{
    orchestrator::{
        FetchQueryResult,
        OrchestratorOptions,
        QueryOrchestrator,
    },
    query_cache::{
        QueryBody,
        QueryCache,
        QueryCacheOptions,
        QueryWithParams,
    },
    queue::{
        query_queue::{
            QueryQueue,
            QueueOptions,
        },
        CacheAndQueueDriver,
        CacheAndQueueDriverFactory,
        JobKind,
        QueryKey,
        QueryKeyHash,
    },
};
