//! Interfaces to the remote management server.
//!
//! The trackers only ever see the traits in this module. A [`BeanSourceProvider`] owns the
//! connection to the management server and hands out [`BeanSource`]s, which in turn resolve the
//! remote domain, instance and resource objects as handles. Handles are proxies: every call goes
//! to the remote server and may fail with a not-found or a connectivity error.

mod error;
pub mod rest;
mod web_client;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampMilliSeconds};
use tokio::sync::mpsc;

pub use error::BeanSourceError;
pub use rest::RestBeanSourceProvider;
#[cfg(test)]
pub use web_client::MockWebClient;
pub use web_client::{HttpWebClient, WebClient, WebClientError};

use crate::model::{Health, JobId, Status};

/// Identifies one connection generation of a [`BeanSource`]. Disconnect listeners receive the id
/// of the source that went stale so they can ignore notices about a connection they no longer
/// use.
pub type BeanSourceId = u64;

/// Stream of change notifications from a subscribed handle. Dropping the receiver releases the
/// subscription.
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AttributeChange { attribute: String, value: String },
    InstanceCreated(String),
    InstanceDeleted(String),
    JobAdded(JobId),
    JobRemoved(JobId),
}

#[async_trait]
pub trait BeanSourceProvider: Debug + Send + Sync {
    /// Returns a usable bean source, reconnecting if the previous one went stale, or fails.
    async fn bean_source(&self) -> Result<Arc<dyn BeanSource>, BeanSourceError>;

    fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>);

    /// Removing a listener that was never added is a no-op.
    fn remove_disconnect_listener(&self, listener: &Arc<dyn DisconnectListener>);
}

#[async_trait]
pub trait DisconnectListener: Send + Sync {
    async fn on_disconnect(&self, stale: BeanSourceId);
}

#[async_trait]
pub trait BeanSource: Debug + Send + Sync {
    fn id(&self) -> BeanSourceId;

    async fn domain_handle(&self, domain: &str) -> Result<Arc<dyn DomainHandle>, BeanSourceError>;

    async fn instance_handle(&self, domain: &str, instance: &str) -> Result<Arc<dyn InstanceHandle>, BeanSourceError>;

    async fn resource_handle(&self, domain: &str, resource_id: &str) -> Result<Arc<dyn ResourceHandle>, BeanSourceError>;
}

#[async_trait]
pub trait DomainHandle: Debug + Send + Sync {
    fn source_id(&self) -> BeanSourceId;

    async fn state(&self) -> Result<DomainState, BeanSourceError>;

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError>;
}

#[async_trait]
pub trait InstanceHandle: Debug + Send + Sync {
    fn source_id(&self) -> BeanSourceId;

    async fn state(&self) -> Result<InstanceState, BeanSourceError>;

    /// Location of a freshly generated snapshot document covering every job in the instance.
    async fn snapshot_jobs_uri(&self, max_depth: u32, include_static: bool) -> Result<String, BeanSourceError>;

    /// Location of a freshly generated metrics document covering every job in the instance.
    async fn job_metrics_uri(&self) -> Result<String, BeanSourceError>;

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError>;
}

#[async_trait]
pub trait ResourceHandle: Debug + Send + Sync {
    async fn state(&self, instance: &str) -> Result<ResourceState, BeanSourceError>;
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainState {
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub creation_user: Option<String>,
    #[serde(default)]
    pub resource_manager: Option<String>,
    #[serde(default)]
    pub instances: BTreeSet<String>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub creation_time: Option<DateTime<Utc>>,
    /// Absent until the instance has started.
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub jobs: BTreeSet<JobId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub id: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}
