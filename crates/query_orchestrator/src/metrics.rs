use metrics::{
    log_counter,
    log_counter_with_tags,
    log_distribution,
    log_gauge,
    metric_tag_const_value,
    register_orchestrator_counter,
    register_orchestrator_gauge,
    register_orchestrator_histogram,
    StatusTimer,
    STATUS_LABEL,
};

register_orchestrator_counter!(
    QUERY_QUEUE_ADDED_TOTAL,
    "Number of queries newly added to a queue"
);
pub fn log_queue_added() {
    log_counter(&QUERY_QUEUE_ADDED_TOTAL, 1);
}

register_orchestrator_counter!(
    QUERY_QUEUE_SKIPPED_TOTAL,
    "Number of process attempts that didn't get to run the query"
);
pub fn log_queue_skipped() {
    log_counter(&QUERY_QUEUE_SKIPPED_TOTAL, 1);
}

register_orchestrator_counter!(
    QUERY_QUEUE_STALLED_TOTAL,
    "Number of queries removed because their heartbeat stopped"
);
pub fn log_queue_stalled() {
    log_counter(&QUERY_QUEUE_STALLED_TOTAL, 1);
}

register_orchestrator_counter!(
    QUERY_QUEUE_ORPHANED_TOTAL,
    "Number of queries removed because nobody waited for them anymore"
);
pub fn log_queue_orphaned() {
    log_counter(&QUERY_QUEUE_ORPHANED_TOTAL, 1);
}

register_orchestrator_counter!(
    QUERY_QUEUE_ORPHANED_RESULTS_TOTAL,
    "Number of execution results dropped because the processing lock was lost"
);
pub fn log_queue_orphaned_result() {
    log_counter(&QUERY_QUEUE_ORPHANED_RESULTS_TOTAL, 1);
}

register_orchestrator_histogram!(
    QUERY_QUEUE_EXECUTE_SECONDS,
    "Time spent running a queued query handler",
    &STATUS_LABEL
);
pub fn queue_execute_timer() -> StatusTimer {
    StatusTimer::new(&QUERY_QUEUE_EXECUTE_SECONDS)
}

register_orchestrator_histogram!(
    QUERY_QUEUE_WAIT_SECONDS,
    "Time a query spent in the queue before it started executing"
);
pub fn log_queue_wait(millis: i64) {
    log_distribution(&QUERY_QUEUE_WAIT_SECONDS, millis.max(0) as f64 / 1000.0);
}

register_orchestrator_gauge!(
    QUERY_QUEUE_SIZE_QUERIES,
    "Number of queries waiting to be processed, as last seen by this process"
);
register_orchestrator_gauge!(
    QUERY_QUEUE_ACTIVE_QUERIES,
    "Number of queries being processed, as last seen by this process"
);
pub fn log_queue_state(queue_size: usize, active: usize) {
    log_gauge(&QUERY_QUEUE_SIZE_QUERIES, queue_size as f64);
    log_gauge(&QUERY_QUEUE_ACTIVE_QUERIES, active as f64);
}

register_orchestrator_counter!(
    QUERY_CACHE_HITS,
    "Number of query cache lookups served from a cache layer",
    &["layer"]
);
pub fn log_cache_hit(in_memory: bool) {
    let layer = if in_memory { "memory" } else { "backend" };
    log_counter_with_tags(
        &QUERY_CACHE_HITS,
        1,
        vec![metric_tag_const_value("layer", layer)],
    );
}

register_orchestrator_counter!(QUERY_CACHE_MISSES, "Number of query cache misses");
pub fn log_cache_miss() {
    log_counter(&QUERY_CACHE_MISSES, 1);
}

register_orchestrator_counter!(
    QUERY_CACHE_RENEWALS,
    "Number of cache entries recomputed and stored"
);
pub fn log_cache_renewal() {
    log_counter(&QUERY_CACHE_RENEWALS, 1);
}

register_orchestrator_counter!(
    PRE_AGGREGATION_BUILDS_TOTAL,
    "Number of pre-aggregation table builds by refresh strategy",
    &["strategy"]
);
pub fn log_pre_aggregation_build(strategy: &'static str) {
    log_counter_with_tags(
        &PRE_AGGREGATION_BUILDS_TOTAL,
        1,
        vec![metric_tag_const_value("strategy", strategy)],
    );
}

register_orchestrator_counter!(
    PRE_AGGREGATION_DROPPED_TABLES,
    "Number of orphaned pre-aggregation tables dropped"
);
pub fn log_pre_aggregation_tables_dropped(count: usize) {
    log_counter(&PRE_AGGREGATION_DROPPED_TABLES, count as u64);
}
