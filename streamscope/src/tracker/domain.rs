use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{
    start_refresh_timer, track_errors, DomainInfo, InstanceInfo, InstanceTracker, TrackerContext, TrackerError,
};
use crate::exporter::{EntityType, ExporterError};
use crate::management::{BeanSourceId, DisconnectListener, DomainHandle, Notification, NotificationStream};
use crate::model::StatusMetric;
use crate::settings::TrackerSettings;

const METRIC_STATUS: &str = "status";
const METRIC_INSTANCE_COUNT: &str = "instanceCount";
const METRIC_RESOURCE_COUNT: &str = "resourceCount";

const DOMAIN_METRICS: &[(&str, &str)] = &[
    (METRIC_STATUS, "Domain status: 1 running, 0.5 partial or transitional, 0 otherwise or unavailable"),
    (METRIC_INSTANCE_COUNT, "Number of instances reported by the domain"),
    (METRIC_RESOURCE_COUNT, "Number of resources reported by the domain"),
];

/// Top of the tracker hierarchy. Owns the domain handle and one [`InstanceTracker`] per tracked
/// instance, and relays management disconnects down the hierarchy.
pub struct DomainTracker {
    context: TrackerContext,
    inner: Mutex<DomainInner>,
}

struct DomainInner {
    info: DomainInfo,
    handle: Option<Arc<dyn DomainHandle>>,
    source_id: Option<BeanSourceId>,
    instances: BTreeMap<String, Arc<InstanceTracker>>,
    notifications: Option<JoinHandle<()>>,
    relay: Option<Arc<dyn DisconnectListener>>,
    deferred_failure: Option<TrackerError>,
    closed: bool,
}

impl fmt::Debug for DomainTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainTracker").field("domain", &self.context.domain).finish()
    }
}

/// Holds the tracker weakly so the provider's listener list does not keep it alive.
struct DisconnectRelay(Weak<DomainTracker>);

#[async_trait]
impl DisconnectListener for DisconnectRelay {
    async fn on_disconnect(&self, stale: BeanSourceId) {
        if let Some(tracker) = self.0.upgrade() {
            tracker.on_disconnect(stale).await;
        }
    }
}

impl DomainTracker {
    /// Connects to the domain and creates the instance trackers. Failing to reach the domain here
    /// is fatal; later refreshes only log remote failures.
    #[tracing::instrument(level = "info", skip(context), fields(domain=%context.domain))]
    pub async fn initialize(context: TrackerContext) -> Result<Arc<Self>, TrackerError> {
        let tracker = Arc::new(Self {
            inner: Mutex::new(DomainInner {
                info: DomainInfo::new(context.domain.as_str()),
                handle: None,
                source_id: None,
                instances: BTreeMap::new(),
                notifications: None,
                relay: None,
                deferred_failure: None,
                closed: false,
            }),
            context,
        });

        let relay: Arc<dyn DisconnectListener> = Arc::new(DisconnectRelay(Arc::downgrade(&tracker)));
        tracker.context.provider.add_disconnect_listener(relay.clone());

        {
            let mut inner = tracker.inner.lock().await;
            inner.relay = Some(relay.clone());

            if let Err(err) = tracker.connect_locked(&mut inner).await {
                track_errors("domain_initialize", &err);
                inner.relay = None;
                tracker.context.provider.remove_disconnect_listener(&relay);
                return Err(TrackerError::Initialization {
                    domain: tracker.context.domain.clone(),
                    source: Box::new(err),
                });
            }

            tracker.reconcile_locked(&mut inner).await;
            tracker.export_domain_metrics(&inner)?;
            tracing::info!(instances=?inner.instances.keys().collect::<Vec<_>>(), "domain tracker initialized");
        }

        Ok(tracker)
    }

    pub fn domain(&self) -> &str {
        self.context.domain.as_str()
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.context.settings
    }

    /// One refresh cycle for the domain and then every instance tracker. Only fatal failures are
    /// returned; everything else leaves the affected tracker unavailable until a later cycle.
    #[tracing::instrument(level = "info", skip(self), fields(domain=%self.context.domain))]
    pub async fn refresh(self: &Arc<Self>) -> Result<(), TrackerError> {
        let _timer = start_refresh_timer("domain");

        let instances: Vec<Arc<InstanceTracker>> = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }

            if let Some(err) = inner.deferred_failure.take() {
                return Err(err);
            }

            let outcome = if inner.handle.is_some() {
                self.update_state_locked(&mut inner).await
            } else {
                tracing::info!("domain unavailable; reconnecting");
                self.connect_locked(&mut inner).await
            };

            match outcome {
                Ok(()) => self.reconcile_locked(&mut inner).await,
                Err(err) => self.handle_failure(&mut inner, "domain_refresh", err)?,
            }

            if let Err(error) = self.export_domain_metrics(&inner) {
                track_errors("domain_refresh", &TrackerError::from(error));
            }

            inner.instances.values().cloned().collect()
        };

        for tracker in instances {
            if let Err(err) = tracker.refresh().await {
                if err.is_fatal() {
                    return Err(err);
                }
                tracing::error!(instance=%tracker.name(), error=?err, "instance refresh failed");
            }
        }

        Ok(())
    }

    /// Marks the domain unavailable when its connection went stale and resets every instance
    /// tracker using that connection. Reconnecting is left to the next refresh.
    pub async fn on_disconnect(&self, stale: BeanSourceId) {
        let instances: Vec<Arc<InstanceTracker>> = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }

            if inner.source_id == Some(stale) {
                tracing::warn!(domain=%self.context.domain, %stale, "management connection lost; domain unavailable");
                self.mark_unavailable_locked(&mut inner);
            }

            inner.instances.values().cloned().collect()
        };

        for tracker in instances {
            tracker.on_disconnect(stale).await;
        }
    }

    /// Stops every tracker and removes all series under the domain.
    #[tracing::instrument(level = "info", skip(self), fields(domain=%self.context.domain))]
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }

        inner.closed = true;
        inner.handle = None;
        inner.source_id = None;
        inner.info.available = false;
        Self::abort_notifications(&mut inner);

        if let Some(relay) = inner.relay.take() {
            self.context.provider.remove_disconnect_listener(&relay);
        }

        let instances = std::mem::take(&mut inner.instances);
        for tracker in instances.values() {
            tracker.close().await;
        }

        let nr_series = self
            .context
            .exporter
            .remove_all_child_metrics(EntityType::Domain, &[self.context.domain.as_str()]);
        tracing::info!(nr_instances=%instances.len(), %nr_series, "domain tracker closed");
    }

    pub async fn info(&self) -> DomainInfo {
        self.inner.lock().await.info.clone()
    }

    pub async fn is_available(&self) -> bool {
        self.inner.lock().await.info.available
    }

    pub async fn instance(&self, name: &str) -> Option<Arc<InstanceTracker>> {
        self.inner.lock().await.instances.get(name).cloned()
    }

    pub async fn instances(&self) -> Vec<Arc<InstanceTracker>> {
        self.inner.lock().await.instances.values().cloned().collect()
    }

    /// Info of every tracked instance, ordered by name.
    pub async fn instance_infos(&self) -> Vec<InstanceInfo> {
        let instances = self.instances().await;
        let mut infos = Vec::with_capacity(instances.len());
        for tracker in instances {
            infos.push(tracker.info().await);
        }
        infos
    }

    async fn connect_locked(self: &Arc<Self>, inner: &mut DomainInner) -> Result<(), TrackerError> {
        let source = self.context.provider.bean_source().await?;
        let handle = source.domain_handle(&self.context.domain).await?;
        let state = handle.state().await?;
        inner.info.update_from(&state);

        let notifications = handle.subscribe().await?;
        Self::abort_notifications(inner);
        inner.notifications = Some(self.spawn_notification_listener(notifications));

        inner.source_id = Some(handle.source_id());
        inner.handle = Some(handle);
        inner.info.available = true;
        tracing::info!(status=%inner.info.status, source_id=?inner.source_id, "domain available");
        Ok(())
    }

    async fn update_state_locked(&self, inner: &mut DomainInner) -> Result<(), TrackerError> {
        let handle = inner.handle.clone().ok_or(TrackerError::MissingHandle("domain"))?;
        let state = handle.state().await?;
        inner.info.update_from(&state);
        Ok(())
    }

    /// Closes trackers of instances that left the target set and creates trackers for new ones.
    /// A new tracker failing recoverably is kept, unavailable, and retried by later refreshes.
    async fn reconcile_locked(&self, inner: &mut DomainInner) {
        let target = target_instances(&self.context.settings, &inner.info);

        let departed: Vec<String> = inner
            .instances
            .keys()
            .filter(|name| !target.contains(*name))
            .cloned()
            .collect();

        for name in departed {
            if let Some(tracker) = inner.instances.remove(&name) {
                tracing::info!(instance=%name, "instance no longer tracked");
                tracker.close().await;
            }
        }

        for name in target {
            if inner.instances.contains_key(&name) {
                continue;
            }

            let tracker = InstanceTracker::new(name.as_str(), self.context.clone());
            match tracker.initialize().await {
                Ok(phase) => {
                    tracing::info!(instance=%name, %phase, "tracking instance");
                    inner.instances.insert(name, tracker);
                },
                Err(err) => {
                    tracing::error!(instance=%name, error=?err, "failed to create instance tracker");
                    tracker.close().await;
                },
            }
        }
    }

    fn handle_failure(&self, inner: &mut DomainInner, action: &str, err: TrackerError) -> Result<(), TrackerError> {
        track_errors(action, &err);
        if err.is_fatal() {
            tracing::error!(domain=%self.context.domain, error=?err, "{action} failed");
            return Err(err);
        }

        tracing::warn!(domain=%self.context.domain, error=?err, "{action} failed; domain unavailable until next refresh");
        if err.is_recoverable() {
            self.mark_unavailable_locked(inner);
        }
        Ok(())
    }

    fn mark_unavailable_locked(&self, inner: &mut DomainInner) {
        inner.handle = None;
        inner.source_id = None;
        inner.info.available = false;
        Self::abort_notifications(inner);

        if let Err(error) = self.export_domain_metrics(inner) {
            tracing::error!(domain=%self.context.domain, ?error, "failed to export domain metrics");
        }
    }

    fn export_domain_metrics(&self, inner: &DomainInner) -> Result<(), ExporterError> {
        let exporter = &self.context.exporter;
        for (name, help) in DOMAIN_METRICS {
            exporter.create_metric(name, EntityType::Domain, help)?;
        }

        let info = &inner.info;
        let status = if info.available { info.status.metric_value() } else { 0.0 };
        let labels = [self.context.domain.as_str()];
        exporter.get_metric(METRIC_STATUS, EntityType::Domain, &labels)?.set(status);
        exporter
            .get_metric(METRIC_INSTANCE_COUNT, EntityType::Domain, &labels)?
            .set(info.instances.len() as f64);
        exporter
            .get_metric(METRIC_RESOURCE_COUNT, EntityType::Domain, &labels)?
            .set(info.resources.len() as f64);
        Ok(())
    }

    fn spawn_notification_listener(self: &Arc<Self>, mut notifications: NotificationStream) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        let domain = self.context.domain.clone();

        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                match tracker.upgrade() {
                    Some(tracker) => tracker.on_notification(notification).await,
                    None => break,
                }
            }
            tracing::debug!(%domain, "domain notification listener stopped");
        })
    }

    fn abort_notifications(inner: &mut DomainInner) {
        if let Some(listener) = inner.notifications.take() {
            listener.abort();
        }
    }

    async fn on_notification(&self, notification: Notification) {
        match notification {
            Notification::AttributeChange { .. } | Notification::InstanceCreated(_) | Notification::InstanceDeleted(_) => {
                tracing::debug!(domain=%self.context.domain, ?notification, "domain changed");
                let mut inner = self.inner.lock().await;
                if inner.closed || inner.handle.is_none() {
                    return;
                }

                match self.update_state_locked(&mut inner).await {
                    Ok(()) => {
                        self.reconcile_locked(&mut inner).await;
                        if let Err(error) = self.export_domain_metrics(&inner) {
                            tracing::error!(domain=%self.context.domain, ?error, "failed to export domain metrics");
                        }
                    },
                    Err(err) => {
                        if let Err(error) = self.handle_failure(&mut inner, "domain_notification", err) {
                            track_errors("domain_notification_deferred", &error);
                            tracing::warn!(
                                domain=%self.context.domain, ?error,
                                "notification failure deferred to the next refresh"
                            );
                            inner.deferred_failure = Some(error);
                        }
                    },
                }
            },
            other => {
                tracing::debug!(domain=%self.context.domain, notification=?other, "ignoring notification");
            },
        }
    }
}

/// Instances the domain tracker should hold a tracker for: every reported instance, or the
/// configured allow-list whether or not the domain reports those instances.
fn target_instances(settings: &TrackerSettings, info: &DomainInfo) -> BTreeSet<String> {
    if settings.tracks_all_instances() {
        info.instances.clone()
    } else {
        settings.instances.iter().cloned().collect()
    }
}
