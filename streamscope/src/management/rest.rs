use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramTimer, HistogramVec};
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use url::Url;

use super::{
    BeanSource, BeanSourceError, BeanSourceId, BeanSourceProvider, DisconnectListener, DomainHandle, DomainState,
    InstanceHandle, InstanceState, Notification, NotificationStream, ResourceHandle, ResourceState,
};
use crate::settings::{Credentials, ManagementSettings};

pub static MANAGEMENT_QUERY_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "management_query_time",
            "Time spent querying the stream processing management server in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["entity"],
    )
    .expect("failed creating management_query_time metric")
});

#[inline]
fn start_management_query_timer(entity: &str) -> HistogramTimer {
    MANAGEMENT_QUERY_TIME.with_label_values(&[entity]).start_timer()
}

#[allow(clippy::cognitive_complexity)]
fn log_response(label: &str, url: &Url, response: &reqwest::Response) {
    const PREAMBLE: &str = "management response received";
    let status = response.status();
    if status.is_success() || status.is_informational() {
        tracing::debug!(%url, ?response, "{PREAMBLE}: {label}");
    } else {
        tracing::warn!(%url, ?response, "{PREAMBLE}: {label}");
    }
}

pub fn make_http_client(settings: &ManagementSettings) -> Result<ClientWithMiddleware, BeanSourceError> {
    let headers = settings
        .header_map()
        .map_err(|err| BeanSourceError::InvalidRequestHeader(err.to_string()))?;

    let client_builder = reqwest::Client::builder()
        .pool_idle_timeout(settings.pool_idle_timeout)
        .default_headers(headers);

    let client_builder = if let Some(pool_max_idle_per_host) = settings.pool_max_idle_per_host {
        client_builder.pool_max_idle_per_host(pool_max_idle_per_host)
    } else {
        client_builder
    };

    let client = client_builder.build()?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(settings.max_retries);
    Ok(ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Bean source provider over the management server's JSON REST interface.
///
/// One bean source is shared until a request through it fails at the connection level. At that
/// point the source is marked stale, every registered disconnect listener is told its id, and the
/// next call to [`BeanSourceProvider::bean_source`] connects afresh.
#[derive(Debug, Clone)]
pub struct RestBeanSourceProvider {
    inner: Arc<Connection>,
}

struct Connection {
    client: ClientWithMiddleware,
    base_url: Url,
    credentials: Option<Credentials>,
    poll_interval: Duration,
    next_id: AtomicU64,
    current: Mutex<Option<Arc<RestBeanSource>>>,
    listeners: RwLock<Vec<Arc<dyn DisconnectListener>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl Connection {
    fn notify_disconnect(&self, stale: BeanSourceId) {
        let listeners: Vec<Arc<dyn DisconnectListener>> =
            self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
        tracing::info!(nr_listeners=%listeners.len(), %stale, "notifying listeners of management disconnect");

        // listeners run on their own tasks since the failing caller may hold a tracker lock
        for listener in listeners {
            tokio::spawn(async move { listener.on_disconnect(stale).await });
        }
    }
}

impl RestBeanSourceProvider {
    pub fn new(
        client: ClientWithMiddleware, base_url: Url, credentials: Option<Credentials>, poll_interval: Duration,
    ) -> Result<Self, BeanSourceError> {
        if base_url.cannot_be_a_base() {
            return Err(BeanSourceError::NotABaseUrl(base_url));
        }

        Ok(Self {
            inner: Arc::new(Connection {
                client,
                base_url,
                credentials,
                poll_interval,
                next_id: AtomicU64::new(1),
                current: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
            }),
        })
    }

    pub fn from_settings(client: ClientWithMiddleware, settings: &ManagementSettings) -> Result<Self, BeanSourceError> {
        let base_url = settings.base_url()?;
        Self::new(
            client,
            base_url,
            settings.credentials.clone(),
            settings.notification_poll_interval,
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }
}

#[async_trait]
impl BeanSourceProvider for RestBeanSourceProvider {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn bean_source(&self) -> Result<Arc<dyn BeanSource>, BeanSourceError> {
        let mut current = self.inner.current.lock().await;
        if let Some(source) = current.as_ref() {
            if !source.is_stale() {
                return Ok(source.clone());
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let source = Arc::new(RestBeanSource {
            id,
            client: self.inner.client.clone(),
            base_url: self.inner.base_url.clone(),
            credentials: self.inner.credentials.clone(),
            poll_interval: self.inner.poll_interval,
            stale: Arc::new(AtomicBool::new(false)),
            connection: Arc::downgrade(&self.inner),
        });

        source.probe().await?;
        tracing::info!(source_id=%id, base_url=%self.inner.base_url, "connected to management server");
        *current = Some(source.clone());
        Ok(source)
    }

    fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn remove_disconnect_listener(&self, listener: &Arc<dyn DisconnectListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }
}

pub struct RestBeanSource {
    id: BeanSourceId,
    client: ClientWithMiddleware,
    base_url: Url,
    credentials: Option<Credentials>,
    poll_interval: Duration,
    stale: Arc<AtomicBool>,
    connection: Weak<Connection>,
}

impl fmt::Debug for RestBeanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestBeanSource")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("stale", &self.stale)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct UriResponse {
    uri: String,
}

impl RestBeanSource {
    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn mark_stale(&self) {
        if !self.stale.swap(true, Ordering::SeqCst) {
            tracing::warn!(source_id=%self.id, "management connection lost");
            if let Some(connection) = self.connection.upgrade() {
                connection.notify_disconnect(self.id);
            }
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BeanSourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BeanSourceError::NotABaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, url: Url) -> reqwest_middleware::RequestBuilder {
        let request = self.client.request(Method::GET, url);
        match self.credentials {
            Some(ref credentials) => request.basic_auth(
                credentials.username.as_str(),
                Some(credentials.password.expose_secret()),
            ),
            None => request,
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn probe(&self) -> Result<(), BeanSourceError> {
        let response = self.request(self.base_url.clone()).send().await?;
        log_response("probe", &self.base_url, &response);
        if response.status().is_server_error() {
            return Err(BeanSourceError::HttpStatus { status: response.status(), url: self.base_url.clone() });
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(
        &self, url: Url, entity: &'static str, name: &str,
    ) -> Result<T, BeanSourceError> {
        if self.is_stale() {
            return Err(BeanSourceError::Disconnected(format!("bean source {} is stale", self.id)));
        }

        let _timer = start_management_query_timer(entity);
        let span = tracing::debug_span!("management REST call", %entity, %name);
        let response = match self.request(url.clone()).send().instrument(span.clone()).await {
            Ok(response) => response,
            Err(err) => {
                let err = BeanSourceError::from(err);
                if err.is_connection_failure() {
                    self.mark_stale();
                }
                return Err(err);
            },
        };

        log_response(entity, &url, &response);
        match response.status() {
            StatusCode::NOT_FOUND => Err(BeanSourceError::not_found(entity, name)),
            status if status.is_success() => {
                let body = response.text().instrument(span).await?;
                serde_json::from_str(body.as_str()).map_err(|err| err.into())
            },
            status => Err(BeanSourceError::HttpStatus { status, url }),
        }
    }
}

#[async_trait]
impl BeanSource for RestBeanSource {
    fn id(&self) -> BeanSourceId {
        self.id
    }

    async fn domain_handle(&self, domain: &str) -> Result<Arc<dyn DomainHandle>, BeanSourceError> {
        let url = self.endpoint(&["domains", domain])?;
        let handle = RestDomainHandle { source: self.clone_ref(), domain: domain.to_string(), url };
        handle.state().await?;
        Ok(Arc::new(handle))
    }

    async fn instance_handle(&self, domain: &str, instance: &str) -> Result<Arc<dyn InstanceHandle>, BeanSourceError> {
        let url = self.endpoint(&["domains", domain, "instances", instance])?;
        let handle = RestInstanceHandle { source: self.clone_ref(), instance: instance.to_string(), url };
        handle.state().await?;
        Ok(Arc::new(handle))
    }

    async fn resource_handle(
        &self, domain: &str, resource_id: &str,
    ) -> Result<Arc<dyn ResourceHandle>, BeanSourceError> {
        let url = self.endpoint(&["domains", domain, "resources", resource_id])?;
        Ok(Arc::new(RestResourceHandle {
            source: self.clone_ref(),
            resource_id: resource_id.to_string(),
            url,
        }))
    }
}

impl RestBeanSource {
    /// Handles share the source's connection state so a failure through any of them marks the
    /// whole source stale.
    fn clone_ref(&self) -> Arc<Self> {
        Arc::new(Self {
            id: self.id,
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            credentials: self.credentials.clone(),
            poll_interval: self.poll_interval,
            stale: self.stale.clone(),
            connection: self.connection.clone(),
        })
    }
}

#[derive(Debug, Clone)]
struct RestDomainHandle {
    source: Arc<RestBeanSource>,
    domain: String,
    url: Url,
}

#[async_trait]
impl DomainHandle for RestDomainHandle {
    fn source_id(&self) -> BeanSourceId {
        self.source.id
    }

    async fn state(&self) -> Result<DomainState, BeanSourceError> {
        self.source.get_json(self.url.clone(), "domain", &self.domain).await
    }

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError> {
        let initial = self.state().await?;
        let handle = self.clone();
        Ok(watch(
            self.source.poll_interval,
            initial,
            move || {
                let handle = handle.clone();
                async move { handle.state().await }
            },
            diff_domain_states,
        ))
    }
}

fn diff_domain_states(previous: &DomainState, current: &DomainState) -> Vec<Notification> {
    let mut notifications = Vec::new();
    if previous.status != current.status {
        notifications.push(Notification::AttributeChange {
            attribute: "status".to_string(),
            value: current.status.to_string(),
        });
    }

    for created in current.instances.difference(&previous.instances) {
        notifications.push(Notification::InstanceCreated(created.clone()));
    }

    for deleted in previous.instances.difference(&current.instances) {
        notifications.push(Notification::InstanceDeleted(deleted.clone()));
    }

    notifications
}

#[derive(Debug, Clone)]
struct RestInstanceHandle {
    source: Arc<RestBeanSource>,
    instance: String,
    url: Url,
}

impl RestInstanceHandle {
    fn operation_url(&self, operation: &str) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(operation);
        }
        url
    }
}

#[async_trait]
impl InstanceHandle for RestInstanceHandle {
    fn source_id(&self) -> BeanSourceId {
        self.source.id
    }

    async fn state(&self) -> Result<InstanceState, BeanSourceError> {
        self.source.get_json(self.url.clone(), "instance", &self.instance).await
    }

    async fn snapshot_jobs_uri(&self, max_depth: u32, include_static: bool) -> Result<String, BeanSourceError> {
        let mut url = self.operation_url("snapshotjobs");
        url.query_pairs_mut()
            .append_pair("maxdepth", max_depth.to_string().as_str())
            .append_pair("includestatic", include_static.to_string().as_str());
        let response: UriResponse = self.source.get_json(url, "instance", &self.instance).await?;
        Ok(response.uri)
    }

    async fn job_metrics_uri(&self) -> Result<String, BeanSourceError> {
        let url = self.operation_url("jobmetrics");
        let response: UriResponse = self.source.get_json(url, "instance", &self.instance).await?;
        Ok(response.uri)
    }

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError> {
        let initial = self.state().await?;
        let handle = self.clone();
        Ok(watch(
            self.source.poll_interval,
            initial,
            move || {
                let handle = handle.clone();
                async move { handle.state().await }
            },
            diff_instance_states,
        ))
    }
}

fn diff_instance_states(previous: &InstanceState, current: &InstanceState) -> Vec<Notification> {
    let mut notifications = Vec::new();
    if previous.status != current.status {
        notifications.push(Notification::AttributeChange {
            attribute: "status".to_string(),
            value: current.status.to_string(),
        });
    }

    if previous.health != current.health {
        notifications.push(Notification::AttributeChange {
            attribute: "health".to_string(),
            value: current.health.to_string(),
        });
    }

    for added in current.jobs.difference(&previous.jobs) {
        notifications.push(Notification::JobAdded(added.clone()));
    }

    for removed in previous.jobs.difference(&current.jobs) {
        notifications.push(Notification::JobRemoved(removed.clone()));
    }

    notifications
}

#[derive(Debug)]
struct RestResourceHandle {
    source: Arc<RestBeanSource>,
    resource_id: String,
    url: Url,
}

#[async_trait]
impl ResourceHandle for RestResourceHandle {
    async fn state(&self, instance: &str) -> Result<ResourceState, BeanSourceError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("instance", instance);
        self.source.get_json(url, "resource", &self.resource_id).await
    }
}

/// The REST interface has no push channel, so subscriptions poll the handle and emit the
/// differences between consecutive states. The watcher ends when the subscriber drops the stream
/// or the handle stops answering.
fn watch<T, F, Fut, D>(poll_interval: Duration, initial: T, fetch: F, diff: D) -> NotificationStream
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, BeanSourceError>> + Send,
    D: Fn(&T, &T) -> Vec<Notification> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut previous = initial;
        let mut ticks = tokio::time::interval(poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;

        loop {
            ticks.tick().await;
            if tx.is_closed() {
                tracing::debug!("notification subscriber released watcher");
                break;
            }

            match fetch().await {
                Ok(current) => {
                    for notification in diff(&previous, &current) {
                        if tx.send(notification).is_err() {
                            return;
                        }
                    }
                    previous = current;
                },
                Err(error) => {
                    tracing::info!(?error, "stopping notification watcher");
                    break;
                },
            }
        }
    });

    rx
}
