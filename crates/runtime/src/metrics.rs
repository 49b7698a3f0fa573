use metrics::{
    log_counter_with_tags,
    metric_tag_const_value,
    register_orchestrator_counter,
};

register_orchestrator_counter!(
    RUNTIME_SPAWNED_JOBS,
    "Number of futures spawned on the production runtime",
    &["name"]
);
pub fn log_task_spawned(name: &'static str) {
    log_counter_with_tags(
        &RUNTIME_SPAWNED_JOBS,
        1,
        vec![metric_tag_const_value("name", name)],
    );
}
