use metrics::register_orchestrator_counter;

register_orchestrator_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
register_orchestrator_counter!(
    pub EXECUTION_TIMEOUT_ERROR_TOTAL,
    "Count of queued executions that hit their timeout"
);
register_orchestrator_counter!(
    pub CONCURRENT_UPDATE_CONFLICT_TOTAL,
    "Count of optimistic queue updates that exhausted their retries"
);
