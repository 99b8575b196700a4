use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{start_aggregator_timer, TrackerError};
use crate::management::{BeanSourceError, InstanceHandle, WebClient};

/// Where an aggregator finds the location of its bulk document.
#[async_trait]
pub trait BulkSource: Debug + Send + Sync {
    fn document(&self) -> &'static str;

    async fn document_uri(&self, handle: &dyn InstanceHandle) -> Result<String, BeanSourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSource {
    pub max_depth: u32,
    pub include_static: bool,
}

#[async_trait]
impl BulkSource for SnapshotSource {
    fn document(&self) -> &'static str {
        "snapshot"
    }

    async fn document_uri(&self, handle: &dyn InstanceHandle) -> Result<String, BeanSourceError> {
        handle.snapshot_jobs_uri(self.max_depth, self.include_static).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSource;

#[async_trait]
impl BulkSource for MetricsSource {
    fn document(&self) -> &'static str {
        "metrics"
    }

    async fn document_uri(&self, handle: &dyn InstanceHandle) -> Result<String, BeanSourceError> {
        handle.job_metrics_uri().await
    }
}

pub type AllJobSnapshots = Aggregator<SnapshotSource>;
pub type AllJobMetrics = Aggregator<MetricsSource>;

/// Fetch bookkeeping exposed to readers. `failed` separates a failed aggregator from one that was
/// only cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStatus {
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failed: bool,
    pub has_document: bool,
}

/// Retrieves one consolidated document covering every job of an instance per refresh cycle.
#[derive(Debug)]
pub struct Aggregator<S> {
    source: S,
    document: Option<String>,
    last_refresh_time: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    failed: bool,
}

impl<S: BulkSource> Aggregator<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            document: None,
            last_refresh_time: None,
            last_failure_time: None,
            failed: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.source.document()
    }

    /// Asks the instance for a fresh document location and retrieves the document. A failure is
    /// recorded and returned to the caller, which decides whether to reset.
    #[tracing::instrument(level = "debug", skip(self, handle, web), fields(document=%self.name()))]
    pub async fn refresh(&mut self, handle: &dyn InstanceHandle, web: &dyn WebClient) -> Result<(), TrackerError> {
        let _timer = start_aggregator_timer(self.name());
        match self.fetch(handle, web).await {
            Ok(document) => {
                tracing::debug!(document_len=%document.len(), "bulk document retrieved");
                self.document = Some(document);
                self.last_refresh_time = Some(Utc::now());
                self.failed = false;
                Ok(())
            },
            Err(err) => {
                self.mark_failed();
                Err(err)
            },
        }
    }

    async fn fetch(&self, handle: &dyn InstanceHandle, web: &dyn WebClient) -> Result<String, TrackerError> {
        let uri = self.source.document_uri(handle).await?;
        let document = web.get(uri.as_str()).await?;
        Ok(document)
    }

    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }

    /// Drops the cached document. Refresh and failure bookkeeping are kept.
    pub fn clear(&mut self) {
        self.document = None;
    }

    pub fn mark_failed(&mut self) {
        self.last_failure_time = Some(Utc::now());
        self.failed = true;
    }

    pub fn status(&self) -> AggregatorStatus {
        AggregatorStatus {
            last_refresh_time: self.last_refresh_time,
            last_failure_time: self.last_failure_time,
            failed: self.failed,
            has_document: self.document.is_some(),
        }
    }
}
