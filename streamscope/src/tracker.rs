//! Stateful trackers mirroring the remote domain.
//!
//! A [`DomainTracker`] owns one [`InstanceTracker`] per tracked instance, and each instance tracker
//! owns a [`JobMap`] of [`JobDetails`]. Each tracker guards its state with a single lock; the
//! domain lock is always taken before any instance lock.

mod aggregator;
mod domain;
mod error;
mod info;
mod instance;
mod job_details;
mod job_map;

use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, Opts};

pub use aggregator::{
    Aggregator, AggregatorStatus, AllJobMetrics, AllJobSnapshots, BulkSource, MetricsSource, SnapshotSource,
};
pub use domain::DomainTracker;
pub use error::TrackerError;
pub use info::{DomainInfo, InstanceInfo, JobInfo, PeInfo};
pub use instance::{InstancePhase, InstanceTracker, RefreshReport};
pub use job_details::{JobAggregates, JobDetails};
pub use job_map::JobMap;

use crate::exporter::MetricsExporter;
use crate::management::{BeanSourceProvider, WebClient};
use crate::settings::TrackerSettings;

/// Collaborators and settings shared by every tracker in the hierarchy.
#[derive(Debug, Clone)]
pub struct TrackerContext {
    pub domain: String,
    pub settings: TrackerSettings,
    pub provider: Arc<dyn BeanSourceProvider>,
    pub web: Arc<dyn WebClient>,
    pub exporter: Arc<dyn MetricsExporter>,
}

impl TrackerContext {
    pub fn new(
        domain: impl Into<String>, settings: TrackerSettings, provider: Arc<dyn BeanSourceProvider>,
        web: Arc<dyn WebClient>, exporter: Arc<dyn MetricsExporter>,
    ) -> Self {
        Self { domain: domain.into(), settings, provider, web, exporter }
    }

    pub fn snapshot_source(&self) -> SnapshotSource {
        SnapshotSource {
            max_depth: self.settings.snapshot_max_depth,
            include_static: self.settings.snapshot_include_static,
        }
    }
}

pub static TRACKER_REFRESH_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("tracker_refresh_time", "Time spent refreshing trackers in seconds")
            .buckets(vec![0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0]),
        &["scope"],
    )
    .expect("failed creating tracker_refresh_time metric")
});

#[inline]
fn start_refresh_timer(scope: &str) -> HistogramTimer {
    TRACKER_REFRESH_TIME.with_label_values(&[scope]).start_timer()
}

pub static AGGREGATOR_REFRESH_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "aggregator_refresh_time",
            "Time spent retrieving bulk job documents in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 10.0, 20.0]),
        &["document"],
    )
    .expect("failed creating aggregator_refresh_time metric")
});

#[inline]
fn start_aggregator_timer(document: &str) -> HistogramTimer {
    AGGREGATOR_REFRESH_TIME.with_label_values(&[document]).start_timer()
}

pub static TRACKER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tracker_errors", "Number of errors encountered by the trackers"),
        &["action", "error_type"],
    )
    .expect("failed creating tracker_errors metric")
});

#[inline]
pub(crate) fn track_errors(action: &str, error: &TrackerError) {
    TRACKER_ERRORS.with_label_values(&[action, error.label()]).inc()
}
