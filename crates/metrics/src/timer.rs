use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    log_distribution,
    log_distribution_with_tags,
    metric_tag_const_value,
    tags::MetricTag,
};

/// A histogram a `Timer` can report its elapsed time into.
pub trait TimerHistogram: Sync + 'static {
    fn observe_elapsed(&'static self, elapsed: Duration, tags: BTreeSet<MetricTag>);
}

impl TimerHistogram for Histogram {
    fn observe_elapsed(&'static self, elapsed: Duration, _tags: BTreeSet<MetricTag>) {
        let desc = get_desc(self);
        tracing::debug!("{elapsed:?} for timer {desc:?}");
        log_distribution(self, elapsed.as_secs_f64());
    }
}

impl TimerHistogram for HistogramVec {
    fn observe_elapsed(&'static self, elapsed: Duration, tags: BTreeSet<MetricTag>) {
        let desc = get_desc(self);
        tracing::debug!("{elapsed:?} for timer {desc:?} {tags:?}");
        log_distribution_with_tags(self, elapsed.as_secs_f64(), tags.into_iter().collect());
    }
}

/// Observes the time between its creation and drop.
pub struct Timer<T: TimerHistogram> {
    start: Instant,
    histogram: &'static T,
    tags: BTreeSet<MetricTag>,
}

impl<T: TimerHistogram> Drop for Timer<T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let tags = mem::take(&mut self.tags);
        self.histogram.observe_elapsed(self.start.elapsed(), tags);
    }
}

impl<T: TimerHistogram> Timer<T> {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Timer<HistogramVec> {
    pub fn new_tagged(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            tags: BTreeSet::new(),
        }
    }

    pub fn add_tag(&mut self, tag: MetricTag) {
        self.tags.insert(tag);
    }

    pub fn remove_tag(&mut self, tag: MetricTag) {
        self.tags.remove(&tag);
    }

    pub fn replace_tag(&mut self, old_tag: MetricTag, new_tag: MetricTag) {
        self.tags.remove(&old_tag);
        self.tags.insert(new_tag);
    }
}

impl Timer<Histogram> {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            tags: BTreeSet::new(),
        }
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct StatusTimer(Timer<HistogramVec>);

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = Timer::new_tagged(histogram);
        timer.add_tag(MetricTag::STATUS_ERROR);
        Self(timer)
    }

    pub fn add_tag(&mut self, tag: MetricTag) {
        self.0.tags.insert(tag);
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        self.0
            .replace_tag(MetricTag::STATUS_ERROR, MetricTag::STATUS_SUCCESS);
        self.0.elapsed()
    }

    /// Finish the timer with developer error
    pub fn finish_developer_error(mut self) -> Duration {
        self.0
            .replace_tag(MetricTag::STATUS_ERROR, MetricTag::STATUS_DEVELOPER_ERROR);
        self.0.elapsed()
    }

    /// Finish the timer with the given status
    /// Commonly used as
    ///
    /// .finish_with(e.metric_status_tag_value())
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_tag(
            MetricTag::STATUS_ERROR,
            metric_tag_const_value("status", status),
        );
        self.0.elapsed()
    }
}

/// Timer that defaults to CANCELED, but switches to
/// ERROR/SUCCESS once you call .finish()
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct CancelableTimer(Timer<HistogramVec>);

impl CancelableTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = Timer::new_tagged(histogram);
        timer.add_tag(MetricTag::STATUS_CANCELED);
        Self(timer)
    }

    pub fn add_tag(&mut self, tag: MetricTag) {
        self.0.tags.insert(tag);
    }

    pub fn finish(mut self, is_ok: bool) -> Duration {
        self.0
            .replace_tag(MetricTag::STATUS_CANCELED, MetricTag::status(is_ok));
        self.0.elapsed()
    }

    /// Finish the timer with the given status
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_tag(
            MetricTag::STATUS_CANCELED,
            metric_tag_const_value("status", status),
        );
        self.0.elapsed()
    }
}
