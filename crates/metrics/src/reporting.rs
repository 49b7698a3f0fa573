use std::collections::HashMap;

use prometheus::{
    core::Collector,
    Gauge,
    GaugeVec,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::{
    log_invalid_metric,
    tags::Tags,
};

fn tag_map(tags: &Tags) -> HashMap<&str, &str> {
    tags.iter().map(|tag| tag.split_key_value()).collect()
}

pub fn log_counter(prometheus_counter: &IntCounter, increment: u64) {
    prometheus_counter.inc_by(increment);
}

pub fn log_counter_with_tags(prometheus_counter: &IntCounterVec, increment: u64, tags: Tags) {
    match prometheus_counter.get_metric_with(&tag_map(&tags)) {
        Ok(metric) => metric.inc_by(increment),
        Err(e) => {
            log_invalid_metric(get_desc(prometheus_counter), e);
        },
    }
}

pub fn log_gauge(prometheus_gauge: &Gauge, value: f64) {
    prometheus_gauge.set(value);
}

pub fn log_gauge_with_tags(prometheus_gauge: &GaugeVec, value: f64, tags: Tags) {
    match prometheus_gauge.get_metric_with(&tag_map(&tags)) {
        Ok(metric) => metric.set(value),
        Err(e) => {
            log_invalid_metric(get_desc(prometheus_gauge), e);
        },
    }
}

pub fn log_distribution(prometheus_histogram: &Histogram, value: f64) {
    prometheus_histogram.observe(value);
}

pub fn log_distribution_with_tags(prometheus_histogram: &HistogramVec, value: f64, tags: Tags) {
    match prometheus_histogram.get_metric_with(&tag_map(&tags)) {
        Ok(metric) => metric.observe(value),
        Err(e) => {
            log_invalid_metric(get_desc(prometheus_histogram), e);
        },
    }
}

pub fn get_desc<M: Collector>(metric: &M) -> String {
    let unknown = "unknown".to_string();
    metric
        .desc()
        .first()
        .map(|d| d.fq_name.clone())
        .unwrap_or(unknown)
}
