use metrics::{
    log_counter_with_tags,
    metric_tag_const_value,
    register_orchestrator_counter,
};

register_orchestrator_counter!(
    ERRORS_REPORTED_TOTAL,
    "Count of errors reported through `report_error`",
    &["type"]
);
pub fn log_errors_reported_total(label: &'static str) {
    log_counter_with_tags(
        &ERRORS_REPORTED_TOTAL,
        1,
        vec![metric_tag_const_value("type", label)],
    );
}
