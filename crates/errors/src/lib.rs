use std::borrow::Cow;

use prometheus::IntCounter;
use serde::{
    Deserialize,
    Serialize,
};

mod metrics;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It is a generic object to be used
/// across the codebase to tag errors with information that is used to classify.
///
/// The msg is conveyed as a user facing error message if it makes it to the
/// API layer.
///
/// The short_msg is used as a tag - available for tests and for metrics
/// logging - to have a message that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching
    /// w/ a standard test helper.
    /// Eg InvalidQueryPriority
    pub short_msg: Cow<'static, str>,
    /// human readable - developer facing. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    NotFound,

    /// The result is still being computed. Callers are expected to poll
    /// again; this is never a failure.
    ContinueWait,
    Timeout,
    Overloaded,
    ConcurrentUpdateConflict,

    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. Configuration or input the caller has to fix.
    ///
    /// The short_msg should be a CapitalCamelCased describing the error.
    /// The msg should be a descriptive message targeted toward the developer.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found, e.g. a pre-aggregation table that hasn't been built
    /// yet.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The queued computation hasn't finished within the long-poll window.
    pub fn continue_wait() -> Self {
        Self {
            code: ErrorCode::ContinueWait,
            short_msg: CONTINUE_WAIT.into(),
            msg: CONTINUE_WAIT_MSG.into(),
        }
    }

    /// Execution exceeded its time budget. Not retried.
    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Timeout,
            short_msg: TIMEOUT_ERROR.into(),
            msg: msg.into(),
        }
    }

    /// Internal error with a user visible message indicating that the user has
    /// hit some defensive limit.
    ///
    /// If you do not need a custom error message, do not use this method.
    /// Instead use anyhow without any ErrorMetadata, which will automatically
    /// be shown to the user as a generic internal server error.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A compare-and-swap on queue state kept failing after every retry.
    pub fn concurrent_update_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::ConcurrentUpdateConflict,
            short_msg: CONCURRENT_UPDATE_CONFLICT.into(),
            msg: msg.into(),
        }
    }

    /// Operational Internal Server Error
    ///
    /// Produces a very general error message for the user. Should be
    /// used in situations where the error is caused by a known operational
    /// source of downtime (eg the queue backend is unreachable)
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_continue_wait(&self) -> bool {
        self.code == ErrorCode::ContinueWait
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_concurrent_update_conflict(&self) -> bool {
        self.code == ErrorCode::ConcurrentUpdateConflict
    }

    /// Return true if this error is deterministically caused by the caller's
    /// input or configuration, so retrying the same request is pointless.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::NotFound => true,
            ErrorCode::ContinueWait
            | ErrorCode::Timeout
            | ErrorCode::Overloaded
            | ErrorCode::ConcurrentUpdateConflict
            | ErrorCode::OperationalInternalServerError => false,
        }
    }

    /// Whether the error should be logged at error level. Retriable control
    /// flow such as ContinueWait never is.
    pub fn should_log_as_error(&self) -> bool {
        match self.code {
            ErrorCode::ContinueWait | ErrorCode::BadRequest | ErrorCode::NotFound => false,
            ErrorCode::Timeout
            | ErrorCode::Overloaded
            | ErrorCode::ConcurrentUpdateConflict
            | ErrorCode::OperationalInternalServerError => true,
        }
    }

    pub fn metric_status_tag_value(&self) -> &'static str {
        match self.code {
            ErrorCode::BadRequest | ErrorCode::NotFound => "developer_error",
            ErrorCode::ContinueWait => "continue_wait",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Overloaded => "overloaded",
            ErrorCode::ConcurrentUpdateConflict => "conflict",
            ErrorCode::OperationalInternalServerError => "operational",
        }
    }

    pub fn custom_metric(&self) -> Option<&'static IntCounter> {
        match self.code {
            ErrorCode::BadRequest => Some(&crate::metrics::BAD_REQUEST_ERROR_TOTAL),
            ErrorCode::Timeout => Some(&crate::metrics::EXECUTION_TIMEOUT_ERROR_TOTAL),
            ErrorCode::ConcurrentUpdateConflict => {
                Some(&crate::metrics::CONCURRENT_UPDATE_CONFLICT_TOTAL)
            },
            ErrorCode::NotFound
            | ErrorCode::ContinueWait
            | ErrorCode::Overloaded
            | ErrorCode::OperationalInternalServerError => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_continue_wait(&self) -> bool;
    fn is_timeout(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_concurrent_update_conflict(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn should_log_as_error(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn metric_status_tag_value(&self) -> &'static str;
    fn error_metadata(&self) -> ErrorMetadata;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as BadRequest
    fn is_bad_request(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_request();
        }
        false
    }

    /// Returns true if error is tagged as NotFound
    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if error is tagged as ContinueWait
    fn is_continue_wait(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_continue_wait();
        }
        false
    }

    /// Returns true if error is tagged as Timeout
    fn is_timeout(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_timeout();
        }
        false
    }

    /// Returns true if error is tagged as Overloaded
    fn is_overloaded(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_overloaded();
        }
        false
    }

    /// Returns true if error is tagged as ConcurrentUpdateConflict
    fn is_concurrent_update_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_concurrent_update_conflict();
        }
        false
    }

    fn is_deterministic_user_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_deterministic_user_error();
        }
        false
    }

    /// Untagged errors are unexpected and always logged as errors.
    fn should_log_as_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.should_log_as_error();
        }
        true
    }

    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.to_string();
        }
        INTERNAL_SERVER_ERROR_MSG.to_string()
    }

    /// Return the short_msg associated with this Error
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Return the descriptive msg associated with this Error
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    /// Return the tag to use on a status metric
    fn metric_status_tag_value(&self) -> &'static str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.metric_status_tag_value();
        }
        "error"
    }

    /// Snapshot of the classification, used when an error has to cross a
    /// process boundary through the queue's result storage. Untagged errors
    /// keep their full message.
    fn error_metadata(&self) -> ErrorMetadata {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.clone();
        }
        ErrorMetadata {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: format!("{self:#}").into(),
        }
    }

    fn map_error_metadata<F>(self, f: F) -> Self
    where
        F: FnOnce(ErrorMetadata) -> ErrorMetadata,
    {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>().cloned() {
            return self.context(f(e));
        }
        self
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }

        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const CONTINUE_WAIT_MSG: &str = "Continue wait";
pub const CONTINUE_WAIT: &str = "ContinueWait";
pub const TIMEOUT_ERROR: &str = "QueryTimeout";
pub const CONCURRENT_UPDATE_CONFLICT: &str = "ConcurrentUpdateConflict";

#[cfg(any(test, feature = "testing"))]
mod proptest_tests {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::BadRequest => ErrorMetadata::bad_request("bad", "request"),
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                    ErrorCode::ContinueWait => ErrorMetadata::continue_wait(),
                    ErrorCode::Timeout => ErrorMetadata::timeout("timed out"),
                    ErrorCode::Overloaded => ErrorMetadata::overloaded("overloaded", "error"),
                    ErrorCode::ConcurrentUpdateConflict => {
                        ErrorMetadata::concurrent_update_conflict("conflict")
                    },
                    ErrorCode::OperationalInternalServerError => {
                        ErrorMetadata::operational_internal_server_error()
                    },
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        CONTINUE_WAIT,
        INTERNAL_SERVER_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_error_classification_roundtrips(err in any::<ErrorMetadata>()) {
            // Results cross process boundaries as JSON, classification must survive.
            let serialized = serde_json::to_string(&err).unwrap();
            let deserialized: ErrorMetadata = serde_json::from_str(&serialized).unwrap();
            assert_eq!(deserialized, err);

            if err.is_deterministic_user_error() {
                assert!(!err.should_log_as_error());
                assert_ne!(err.short_msg, INTERNAL_SERVER_ERROR);
            }
            if err.code == ErrorCode::ContinueWait {
                assert!(!err.should_log_as_error());
            }
        }
    }

    #[test]
    fn test_continue_wait_is_detected_through_context() {
        let err = anyhow::anyhow!("still running")
            .context(ErrorMetadata::continue_wait())
            .context("while waiting for SQL_QUERY_STANDALONE_default");
        assert!(err.is_continue_wait());
        assert!(!err.should_log_as_error());
        assert_eq!(err.short_msg(), CONTINUE_WAIT);
    }

    #[test]
    fn test_untagged_errors_snapshot_full_message() {
        let err: anyhow::Error = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("Failed to run query")
            .unwrap_err();
        let metadata = err.error_metadata();
        assert_eq!(metadata.code, ErrorCode::OperationalInternalServerError);
        assert_eq!(metadata.msg, "Failed to run query: connection reset");
        assert!(err.should_log_as_error());
    }
}
