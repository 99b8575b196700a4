use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heck::ToSnakeCase;
use serde::Serialize;
use strum_macros::Display;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    start_refresh_timer, track_errors, AggregatorStatus, AllJobMetrics, AllJobSnapshots, InstanceInfo, JobDetails,
    JobInfo, JobMap, MetricsSource, TrackerContext, TrackerError,
};
use crate::exporter::{EntityType, ExporterError};
use crate::management::{BeanSourceId, InstanceHandle, Notification, NotificationStream};
use crate::model::{JobId, JobMetricsDocument, JobSnapshot, JobsDocument, StatusMetric};

const METRIC_STATUS: &str = "status";
const METRIC_HEALTH: &str = "health";
const METRIC_START_TIME: &str = "startTime";
const METRIC_JOB_COUNT: &str = "jobCount";
const METRIC_SNAPSHOTS_LAST_REFRESH: &str = "snapshotsLastRefreshTime";
const METRIC_SNAPSHOTS_LAST_FAILURE: &str = "snapshotsLastFailureTime";
const METRIC_SNAPSHOTS_FAILED: &str = "snapshotsFailed";
const METRIC_METRICS_LAST_REFRESH: &str = "metricsLastRefreshTime";
const METRIC_METRICS_LAST_FAILURE: &str = "metricsLastFailureTime";
const METRIC_METRICS_FAILED: &str = "metricsFailed";

const INSTANCE_METRICS: &[(&str, &str)] = &[
    (METRIC_STATUS, "Instance status: 1 running, 0.5 partial or transitional, 0 otherwise or unavailable"),
    (METRIC_HEALTH, "Instance health: 1 healthy, 0.5 partially healthy, 0 otherwise or unavailable"),
    (METRIC_START_TIME, "Instance start time in seconds since the epoch; 0 while unavailable"),
    (METRIC_JOB_COUNT, "Number of jobs tracked in the instance"),
    (METRIC_SNAPSHOTS_LAST_REFRESH, "Time of the last successful job snapshot retrieval"),
    (METRIC_SNAPSHOTS_LAST_FAILURE, "Time of the last failed job snapshot retrieval"),
    (METRIC_SNAPSHOTS_FAILED, "Whether the last job snapshot retrieval failed"),
    (METRIC_METRICS_LAST_REFRESH, "Time of the last successful job metrics retrieval"),
    (METRIC_METRICS_LAST_FAILURE, "Time of the last failed job metrics retrieval"),
    (METRIC_METRICS_FAILED, "Whether the last job metrics retrieval failed"),
];

const RESOURCE_STATUS_HELP: &str = "Resource status: 1 running, 0.5 partial or transitional, 0 otherwise";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    Uninitialized,
    Available,
    Unavailable,
}

/// Job inventory changes from one snapshot reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<JobId>,
    pub updated: Vec<JobId>,
    pub removed: Vec<JobId>,
}

/// Tracks one instance: its availability, its jobs and their exported metrics.
///
/// Remote failures never escape [`InstanceTracker::refresh`] when they are recoverable. They reset
/// the tracker instead, and the next refresh starts over from initialization.
pub struct InstanceTracker {
    name: String,
    context: TrackerContext,
    inner: Mutex<InstanceInner>,
}

struct InstanceInner {
    phase: InstancePhase,
    info: InstanceInfo,
    handle: Option<Arc<dyn InstanceHandle>>,
    source_id: Option<BeanSourceId>,
    jobs: JobMap,
    snapshots: AllJobSnapshots,
    metrics: AllJobMetrics,
    resources: BTreeSet<String>,
    notifications: Option<JoinHandle<()>>,
    /// Failure the notification listener could not absorb, reported by the next refresh.
    deferred_failure: Option<TrackerError>,
    closed: bool,
}

impl fmt::Debug for InstanceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceTracker")
            .field("name", &self.name)
            .field("domain", &self.context.domain)
            .finish()
    }
}

impl InstanceTracker {
    pub fn new(name: impl Into<String>, context: TrackerContext) -> Arc<Self> {
        let name = name.into();
        let inner = InstanceInner {
            phase: InstancePhase::Uninitialized,
            info: InstanceInfo::new(name.as_str()),
            handle: None,
            source_id: None,
            jobs: JobMap::new(name.as_str()),
            snapshots: AllJobSnapshots::new(context.snapshot_source()),
            metrics: AllJobMetrics::new(MetricsSource),
            resources: BTreeSet::new(),
            notifications: None,
            deferred_failure: None,
            closed: false,
        };

        Arc::new(Self { name, context, inner: Mutex::new(inner) })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Acquires the instance handle and subscribes to instance notifications. Recoverable
    /// failures leave the tracker unavailable rather than failing.
    #[tracing::instrument(level = "info", skip(self), fields(instance=%self.name))]
    pub async fn initialize(self: &Arc<Self>) -> Result<InstancePhase, TrackerError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(inner.phase);
        }

        match self.initialize_locked(&mut inner).await {
            Ok(phase) => Ok(phase),
            Err(err) => self
                .handle_failure(&mut inner, "instance_initialize", err)
                .map(|()| inner.phase),
        }
    }

    /// One refresh cycle: instance state, resource metrics, job snapshots then job metrics, and
    /// finally the metric export of every job. An unavailable tracker first tries to initialize.
    #[tracing::instrument(level = "info", skip(self), fields(instance=%self.name))]
    pub async fn refresh(self: &Arc<Self>) -> Result<RefreshReport, TrackerError> {
        let _timer = start_refresh_timer("instance");
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(RefreshReport::default());
        }

        if let Some(err) = inner.deferred_failure.take() {
            return Err(err);
        }

        if inner.phase != InstancePhase::Available {
            match self.initialize_locked(&mut inner).await {
                Ok(InstancePhase::Available) => {},
                Ok(phase) => {
                    tracing::debug!(%phase, "instance not available for refresh");
                    return Ok(RefreshReport::default());
                },
                Err(err) => {
                    return self
                        .handle_failure(&mut inner, "instance_initialize", err)
                        .map(|()| RefreshReport::default());
                },
            }
        }

        match self.refresh_locked(&mut inner).await {
            Ok(report) => Ok(report),
            Err(err) => self
                .handle_failure(&mut inner, "instance_refresh", err)
                .map(|()| RefreshReport::default()),
        }
    }

    /// Marks the instance unavailable, clears its jobs and aggregators and rewrites its own metrics
    /// as unavailable. Nothing remote is touched; the tracker stays usable.
    #[tracing::instrument(level = "info", skip(self), fields(instance=%self.name))]
    pub async fn reset_tracker(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.closed {
            self.reset_locked(&mut inner);
        }
    }

    /// Resets the tracker if it is using the connection that went stale.
    pub async fn on_disconnect(&self, stale: BeanSourceId) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }

        if inner.source_id == Some(stale) {
            tracing::warn!(instance=%self.name, %stale, "management connection lost; resetting instance tracker");
            self.reset_locked(&mut inner);
        } else {
            tracing::debug!(instance=%self.name, %stale, source_id=?inner.source_id, "ignoring disconnect of unused connection");
        }
    }

    /// Stops tracking: releases the notification subscription and removes every series under the
    /// instance. A closed tracker ignores further refreshes.
    #[tracing::instrument(level = "info", skip(self), fields(instance=%self.name))]
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }

        inner.closed = true;
        inner.phase = InstancePhase::Unavailable;
        inner.info.available = false;
        inner.handle = None;
        inner.source_id = None;
        Self::abort_notifications(&mut inner);
        inner.snapshots.clear();
        inner.metrics.clear();
        let nr_jobs = inner.jobs.clear();
        inner.resources.clear();
        let nr_series = self
            .context
            .exporter
            .remove_all_child_metrics(EntityType::Instance, &[self.name.as_str()]);
        tracing::info!(%nr_jobs, %nr_series, "instance tracker closed");
    }

    pub async fn phase(&self) -> InstancePhase {
        self.inner.lock().await.phase
    }

    pub async fn info(&self) -> InstanceInfo {
        let inner = self.inner.lock().await;
        let mut info = inner.info.clone();
        info.job_count = inner.jobs.len();
        info
    }

    pub async fn all_job_info(&self) -> Vec<JobInfo> {
        self.inner.lock().await.jobs.job_infos()
    }

    pub async fn job_info(&self, id: &JobId) -> Option<JobInfo> {
        self.inner.lock().await.jobs.job_info(id)
    }

    pub async fn job_snapshot(&self, id: &JobId) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.jobs.with_job(id, |details| details.raw_snapshot().to_string())
    }

    pub async fn job_metrics(&self, id: &JobId) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.jobs.with_job(id, |details| details.raw_metrics().map(str::to_string)).flatten()
    }

    /// Snapshot and metrics aggregator bookkeeping, in that order.
    pub async fn aggregator_status(&self) -> (AggregatorStatus, AggregatorStatus) {
        let inner = self.inner.lock().await;
        (inner.snapshots.status(), inner.metrics.status())
    }

    /// Runs `f` against the job map while holding the tracker lock.
    pub async fn inspect_jobs<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&JobMap) -> R,
    {
        let inner = self.inner.lock().await;
        f(&inner.jobs)
    }

    async fn initialize_locked(self: &Arc<Self>, inner: &mut InstanceInner) -> Result<InstancePhase, TrackerError> {
        let source = self.context.provider.bean_source().await?;
        let handle = match source.instance_handle(&self.context.domain, &self.name).await {
            Ok(handle) => handle,
            Err(err) => {
                if err.is_not_found() {
                    inner.info.exists = false;
                }
                return Err(err.into());
            },
        };

        let state = handle.state().await?;
        inner.info.update_from(&state);
        inner.source_id = Some(handle.source_id());

        if state.start_time.is_none() {
            tracing::info!(status=%state.status, "instance has not started");
            inner.handle = Some(handle);
            inner.phase = InstancePhase::Unavailable;
            inner.info.available = false;
            self.export_instance_metrics(inner)?;
            return Ok(inner.phase);
        }

        let notifications = handle.subscribe().await?;
        Self::abort_notifications(inner);
        inner.notifications = Some(self.spawn_notification_listener(notifications));
        inner.handle = Some(handle);
        inner.phase = InstancePhase::Available;
        inner.info.available = true;
        self.export_instance_metrics(inner)?;
        tracing::info!(status=%inner.info.status, health=%inner.info.health, "instance available");
        Ok(inner.phase)
    }

    async fn refresh_locked(&self, inner: &mut InstanceInner) -> Result<RefreshReport, TrackerError> {
        let handle = inner.handle.clone().ok_or(TrackerError::MissingHandle("instance"))?;
        let state = handle.state().await?;
        inner.info.update_from(&state);
        if state.start_time.is_none() {
            tracing::warn!(status=%state.status, "instance no longer reports a start time");
            self.reset_locked(inner);
            return Ok(RefreshReport::default());
        }

        self.update_resource_metrics(inner, &state.resources).await?;

        inner.snapshots.refresh(handle.as_ref(), self.context.web.as_ref()).await?;
        let report = self.reconcile_snapshots(inner)?;

        inner.metrics.refresh(handle.as_ref(), self.context.web.as_ref()).await?;
        self.apply_metrics(inner)?;

        let exported = inner.jobs.refresh_all();
        inner.info.job_count = inner.jobs.len();
        self.export_instance_metrics(inner)?;
        exported?;

        tracing::info!(
            added=?report.added, removed=?report.removed, nr_jobs=%inner.info.job_count,
            "instance refreshed"
        );
        Ok(report)
    }

    /// Resource series are replaced wholesale each cycle so a resource leaving the instance takes
    /// its series with it.
    async fn update_resource_metrics(
        &self, inner: &mut InstanceInner, resources: &BTreeSet<String>,
    ) -> Result<(), TrackerError> {
        let exporter = &self.context.exporter;
        for previous in inner.resources.iter() {
            exporter.remove_all_child_metrics(EntityType::Resource, &[self.name.as_str(), previous.as_str()]);
        }
        inner.resources.clear();

        if resources.is_empty() {
            return Ok(());
        }

        let source = self.context.provider.bean_source().await?;
        exporter.create_metric(METRIC_STATUS, EntityType::Resource, RESOURCE_STATUS_HELP)?;

        for resource_id in resources {
            let handle = source.resource_handle(&self.context.domain, resource_id).await?;
            let state = match handle.state(&self.name).await {
                Ok(state) => state,
                Err(err) if err.is_not_found() => {
                    tracing::debug!(%resource_id, "resource left the instance before its metrics were read");
                    continue;
                },
                Err(err) => return Err(err.into()),
            };

            let labels = [self.name.as_str(), resource_id.as_str()];
            exporter
                .get_metric(METRIC_STATUS, EntityType::Resource, &labels)?
                .set(state.status.metric_value());

            for (metric, value) in state.metrics.iter() {
                if metric.to_snake_case() == METRIC_STATUS {
                    tracing::debug!(%resource_id, %metric, "resource metric shadows resource status; skipping");
                    continue;
                }

                let outcome = exporter
                    .create_metric(metric, EntityType::Resource, "")
                    .and_then(|()| exporter.get_metric(metric, EntityType::Resource, &labels));
                match outcome {
                    Ok(gauge) => gauge.set(*value),
                    Err(error) => tracing::warn!(%resource_id, %metric, ?error, "skipping resource metric"),
                }
            }

            inner.resources.insert(resource_id.clone());
        }

        Ok(())
    }

    /// The snapshot document is authoritative for which jobs exist. Tracked jobs missing from it
    /// are removed.
    fn reconcile_snapshots(&self, inner: &mut InstanceInner) -> Result<RefreshReport, TrackerError> {
        let document = inner.snapshots.document().unwrap_or_default();
        let parsed = JobsDocument::parse(document).map_err(|source| self.schema_error("snapshot", source))?;

        let mut report = RefreshReport::default();
        let mut unseen = inner.jobs.ids();

        for value in parsed.jobs {
            let raw = value.to_string();
            let snapshot: JobSnapshot =
                serde_json::from_value(value).map_err(|source| self.schema_error("snapshot", source))?;
            let id = snapshot.id.clone();

            if inner.jobs.contains(&id) {
                if !unseen.remove(&id) {
                    tracing::warn!(job_id=%id, "job appears more than once in snapshot document");
                }
                inner.jobs.update_snapshot(snapshot, raw);
                report.updated.push(id);
            } else {
                tracing::info!(job_id=%id, job_name=%snapshot.name, "tracking new job");
                let details = JobDetails::new(self.name.as_str(), snapshot, raw, self.context.exporter.clone());
                inner.jobs.add(details);
                report.added.push(id);
            }
        }

        for id in unseen {
            if inner.jobs.remove(&id).is_some() {
                tracing::info!(job_id=%id, "job no longer reported; stopped tracking");
                report.removed.push(id);
            }
        }

        Ok(report)
    }

    /// Metrics only ever update jobs already tracked.
    fn apply_metrics(&self, inner: &mut InstanceInner) -> Result<(), TrackerError> {
        let document = inner.metrics.document().unwrap_or_default();
        let parsed = JobsDocument::parse(document).map_err(|source| self.schema_error("metrics", source))?;
        let mut unreported = inner.jobs.ids();

        for value in parsed.jobs {
            let raw = value.to_string();
            let metrics: JobMetricsDocument =
                serde_json::from_value(value).map_err(|source| self.schema_error("metrics", source))?;
            let id = metrics.id.clone();

            if inner.jobs.update_metrics(metrics, raw) {
                unreported.remove(&id);
            } else {
                tracing::warn!(job_id=%id, "metrics reported for untracked job");
            }
        }

        for id in unreported {
            inner.jobs.clear_metrics(&id);
        }

        Ok(())
    }

    fn schema_error(&self, document: &'static str, source: serde_json::Error) -> TrackerError {
        TrackerError::Schema { instance: self.name.clone(), document, source }
    }

    fn handle_failure(&self, inner: &mut InstanceInner, action: &str, err: TrackerError) -> Result<(), TrackerError> {
        track_errors(action, &err);
        if err.is_recoverable() {
            tracing::warn!(instance=%self.name, error=?err, "{action} failed; instance unavailable until next refresh");
            self.reset_locked(inner);
            Ok(())
        } else {
            tracing::error!(instance=%self.name, error=?err, "{action} failed");
            Err(err)
        }
    }

    fn reset_locked(&self, inner: &mut InstanceInner) {
        inner.phase = InstancePhase::Unavailable;
        inner.info.available = false;
        inner.handle = None;
        inner.source_id = None;
        Self::abort_notifications(inner);

        inner.snapshots.mark_failed();
        inner.snapshots.clear();
        inner.metrics.mark_failed();
        inner.metrics.clear();

        let nr_jobs = inner.jobs.clear();
        inner.info.job_count = 0;
        inner.resources.clear();

        let exporter = &self.context.exporter;
        let nr_series = exporter.remove_all_child_metrics(EntityType::Instance, &[self.name.as_str()]);
        if let Err(error) = self.export_instance_metrics(inner) {
            tracing::error!(instance=%self.name, ?error, "failed to export instance metrics after reset");
        }

        tracing::info!(instance=%self.name, %nr_jobs, %nr_series, "instance tracker reset");
    }

    /// An unavailable instance exports zero status, health and start time.
    fn export_instance_metrics(&self, inner: &InstanceInner) -> Result<(), ExporterError> {
        let exporter = &self.context.exporter;
        for (name, help) in INSTANCE_METRICS {
            exporter.create_metric(name, EntityType::Instance, help)?;
        }

        let info = &inner.info;
        let (status, health, start_time) = if info.available {
            (
                info.status.metric_value(),
                info.health.metric_value(),
                epoch_secs(info.start_time),
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let snapshots = inner.snapshots.status();
        let metrics = inner.metrics.status();
        let values = [
            (METRIC_STATUS, status),
            (METRIC_HEALTH, health),
            (METRIC_START_TIME, start_time),
            (METRIC_JOB_COUNT, inner.jobs.len() as f64),
            (METRIC_SNAPSHOTS_LAST_REFRESH, epoch_secs(snapshots.last_refresh_time)),
            (METRIC_SNAPSHOTS_LAST_FAILURE, epoch_secs(snapshots.last_failure_time)),
            (METRIC_SNAPSHOTS_FAILED, if snapshots.failed { 1.0 } else { 0.0 }),
            (METRIC_METRICS_LAST_REFRESH, epoch_secs(metrics.last_refresh_time)),
            (METRIC_METRICS_LAST_FAILURE, epoch_secs(metrics.last_failure_time)),
            (METRIC_METRICS_FAILED, if metrics.failed { 1.0 } else { 0.0 }),
        ];

        let labels = [self.name.as_str()];
        for (name, value) in values {
            exporter.get_metric(name, EntityType::Instance, &labels)?.set(value);
        }

        Ok(())
    }

    fn spawn_notification_listener(self: &Arc<Self>, mut notifications: NotificationStream) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let name = self.name.clone();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match tracker.upgrade() {
                    Some(tracker) => tracker.on_notification(notification).await,
                    None => break,
                }
            }
            tracing::debug!(instance=%name, "instance notification listener stopped");
        })
    }

    fn abort_notifications(inner: &mut InstanceInner) {
        if let Some(listener) = inner.notifications.take() {
            listener.abort();
        }
    }

    /// Attribute changes refresh the instance attributes immediately. Job inventory changes are
    /// left to the next snapshot reconciliation.
    async fn on_notification(&self, notification: Notification) {
        match notification {
            Notification::AttributeChange { attribute, value } => {
                tracing::debug!(instance=%self.name, %attribute, %value, "instance attribute changed");
                let mut inner = self.inner.lock().await;
                if inner.closed || inner.phase != InstancePhase::Available {
                    return;
                }

                let handle = match inner.handle.clone() {
                    Some(handle) => handle,
                    None => return,
                };

                match handle.state().await {
                    Ok(state) => {
                        inner.info.update_from(&state);
                        if state.start_time.is_none() {
                            self.reset_locked(&mut inner);
                        } else if let Err(error) = self.export_instance_metrics(&inner) {
                            tracing::error!(instance=%self.name, ?error, "failed to export instance metrics");
                        }
                    },
                    Err(err) => {
                        if let Err(error) = self.handle_failure(&mut inner, "instance_notification", err.into()) {
                            track_errors("instance_notification_deferred", &error);
                            tracing::warn!(
                                instance=%self.name, ?error,
                                "notification failure deferred to the next refresh"
                            );
                            inner.deferred_failure = Some(error);
                        }
                    },
                }
            },
            Notification::JobAdded(id) | Notification::JobRemoved(id) => {
                tracing::debug!(instance=%self.name, job_id=%id, "job inventory follows snapshot reconciliation");
            },
            other => {
                tracing::debug!(instance=%self.name, notification=?other, "ignoring notification");
            },
        }
    }
}

fn epoch_secs(time: Option<DateTime<Utc>>) -> f64 {
    time.map_or(0.0, |t| t.timestamp_millis() as f64 / 1_000.0)
}
