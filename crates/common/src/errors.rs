use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
pub use errors::{
    INTERNAL_SERVER_ERROR,
    INTERNAL_SERVER_ERROR_MSG,
};
use metrics::log_counter;

use crate::metrics::log_errors_reported_total;

/// Log an error caught at a boundary where it can't be propagated any further,
/// e.g. a failed background refresh or a query handler that errored inside
/// the queue's processing loop.
pub async fn report_error(err: &mut anyhow::Error) {
    // Trace error before yield - since during shutdown, we won't be back.
    trace_error(err);

    // Yield in case this is during shutdown - at which point, errors being reported
    // explicitly aren't useful. Yielding allows tokio to complete a cancellation.
    tokio::task::yield_now().await;

    count_error(err);
}

/// Use the `pub async fn report_error` above if possible. This is a
/// synchronous version for use in sync contexts, e.g. `Drop` impls.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
    count_error(err);
}

fn trace_error(err: &anyhow::Error) {
    let label = err.metric_status_tag_value();
    log_errors_reported_total(label);

    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    let full_msg = format!(
        "Caught {label} error (RUST_BACKTRACE=1 RUST_LOG=info,{}=debug for full trace): \
         {err_for_tracing}",
        module_path!()
    );
    if err.should_log_as_error() {
        tracing::error!("{full_msg}");
    } else {
        tracing::warn!("{full_msg}");
    }
    tracing::debug!("{err:?}");
}

fn count_error(err: &anyhow::Error) {
    if let Some(e) = err.downcast_ref::<ErrorMetadata>() {
        if let Some(counter) = e.custom_metric() {
            log_counter(counter, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    use super::report_error_sync;

    #[test]
    fn test_report_error_keeps_classification() {
        let mut err = anyhow::anyhow!("driver went away")
            .context(ErrorMetadata::bad_request("InvalidPreAggregation", "bad"));
        report_error_sync(&mut err);
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "InvalidPreAggregation");
    }
}
