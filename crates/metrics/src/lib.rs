//! Code for interacting with our metrics logging

mod macros;
mod metrics;
mod reporting;
mod tags;
mod timer;

pub use crate::{
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_tags,
        log_distribution,
        log_distribution_with_tags,
        log_gauge,
        log_gauge_with_tags,
    },
    tags::*,
    timer::{
        CancelableTimer,
        StatusTimer,
        Timer,
        TimerHistogram,
    },
};
