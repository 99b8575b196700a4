use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use prometheus::{Gauge, Registry, TextEncoder};
use serde_json::{json, Value};
use streamscope::exporter::{EntityType, ExporterError, MetricsExporter, PrometheusMetricsExporter};
use streamscope::management::{
    BeanSource, BeanSourceError, BeanSourceId, BeanSourceProvider, DisconnectListener, DomainHandle, DomainState,
    InstanceHandle, InstanceState, Notification, NotificationStream, ResourceHandle, ResourceState, WebClient,
    WebClientError,
};
use streamscope::model::{Health, Status};
use streamscope::settings::TrackerSettings;
use streamscope::tracker::TrackerContext;
use tokio::sync::mpsc;

pub const DOMAIN: &str = "StreamsDomain";

#[derive(Debug, Default)]
struct ClusterState {
    domain: DomainState,
    instances: BTreeMap<String, InstanceState>,
    resources: BTreeMap<String, ResourceState>,
    snapshots: BTreeMap<String, String>,
    metrics: BTreeMap<String, String>,
    unreachable: bool,
    corrupt_instance_states: BTreeSet<String>,
    nr_corrupt_state_reads: usize,
    document_delay: Duration,
    subscribers: Vec<mpsc::UnboundedSender<Notification>>,
}

/// In-memory management server. Sources carry the generation they were created in and fail once
/// the cluster moves on to a new generation, the way a dropped connection behaves.
#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
    generation: Arc<AtomicU64>,
    listeners: Arc<Mutex<Vec<Arc<dyn DisconnectListener>>>>,
}

impl fmt::Debug for FakeCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeCluster")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let state = ClusterState {
            domain: DomainState {
                name: DOMAIN.to_string(),
                status: Status::Running,
                start_time: Some(Utc.timestamp_millis_opt(1_620_234_000_000).unwrap()),
                ..DomainState::default()
            },
            ..ClusterState::default()
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            generation: Arc::new(AtomicU64::new(1)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn generation(&self) -> BeanSourceId {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn nr_listeners(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Adds a running instance with no jobs.
    pub fn add_instance(&self, name: &str) {
        self.add_instance_with_start(name, true);
    }

    pub fn add_instance_with_start(&self, name: &str, started: bool) {
        let mut state = self.state.lock().unwrap();
        state.domain.instances.insert(name.to_string());
        state.instances.insert(
            name.to_string(),
            InstanceState {
                name: name.to_string(),
                status: if started { Status::Running } else { Status::Starting },
                health: if started { Health::Healthy } else { Health::Unknown },
                creation_time: Some(Utc.timestamp_millis_opt(1_620_233_000_000).unwrap()),
                start_time: if started { Some(Utc.timestamp_millis_opt(1_620_234_500_000).unwrap()) } else { None },
                ..InstanceState::default()
            },
        );
        state.snapshots.insert(name.to_string(), json!({ "jobs": [] }).to_string());
        state.metrics.insert(name.to_string(), json!({ "jobs": [] }).to_string());
    }

    pub fn set_instance_health(&self, name: &str, health: Health) {
        let mut state = self.state.lock().unwrap();
        if let Some(inst) = state.instances.get_mut(name) {
            inst.health = health;
        }
    }

    /// While set, reading the instance's state fails with a malformed-response error.
    pub fn set_instance_state_corrupt(&self, name: &str, corrupt: bool) {
        let mut state = self.state.lock().unwrap();
        if corrupt {
            state.corrupt_instance_states.insert(name.to_string());
        } else {
            state.corrupt_instance_states.remove(name);
        }
    }

    pub fn nr_corrupt_state_reads(&self) -> usize {
        self.state.lock().unwrap().nr_corrupt_state_reads
    }

    /// Delays every bulk document served by [`FakeWebClient`].
    pub fn set_document_delay(&self, delay: Duration) {
        self.state.lock().unwrap().document_delay = delay;
    }

    pub fn remove_instance(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.domain.instances.remove(name);
        state.instances.remove(name);
        state.snapshots.remove(name);
        state.metrics.remove(name);
    }

    /// Sets the jobs of an instance; each job is `(id, name, pes)` with pes as `(pe id, resource)`.
    pub fn set_jobs(&self, instance: &str, jobs: &[(&str, &str, &[(&str, &str)])]) {
        let snapshots: Vec<Value> = jobs.iter().map(|(id, name, pes)| job_snapshot(id, name, pes)).collect();
        let metrics: Vec<Value> = jobs.iter().map(|(id, name, pes)| job_metrics(id, name, pes)).collect();

        let mut state = self.state.lock().unwrap();
        if let Some(inst) = state.instances.get_mut(instance) {
            inst.jobs = jobs.iter().map(|(id, _, _)| (*id).into()).collect();
        }
        state
            .snapshots
            .insert(instance.to_string(), json!({ "jobs": snapshots }).to_string());
        state
            .metrics
            .insert(instance.to_string(), json!({ "jobs": metrics }).to_string());
    }

    pub fn set_snapshot_document(&self, instance: &str, body: &str) {
        let mut state = self.state.lock().unwrap();
        state.snapshots.insert(instance.to_string(), body.to_string());
    }

    /// Places resources on an instance, each with a single `cpuSpeed` metric.
    pub fn set_resources(&self, instance: &str, resources: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let ids: BTreeSet<String> = resources.iter().map(|r| (*r).to_string()).collect();
        for id in ids.iter() {
            state.resources.insert(
                id.clone(),
                ResourceState {
                    id: id.clone(),
                    status: Status::Running,
                    metrics: maplit::btreemap! { "cpuSpeed".to_string() => 2_400.0 },
                },
            );
        }
        state.domain.resources = state.resources.keys().cloned().collect();
        if let Some(inst) = state.instances.get_mut(instance) {
            inst.resources = ids;
        }
    }

    pub fn set_resource_metric(&self, resource: &str, name: &str, value: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(res) = state.resources.get_mut(resource) {
            res.metrics.insert(name.to_string(), value);
        }
    }

    /// Drops the connection: later calls fail until [`FakeCluster::reconnect`], and every
    /// disconnect listener hears about the stale generation.
    pub async fn disconnect(&self) {
        let stale = {
            let mut state = self.state.lock().unwrap();
            state.unreachable = true;
            state.subscribers.clear();
            self.generation.fetch_add(1, Ordering::SeqCst)
        };

        let listeners: Vec<Arc<dyn DisconnectListener>> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_disconnect(stale).await;
        }
    }

    pub fn reconnect(&self) {
        self.state.lock().unwrap().unreachable = false;
    }

    /// Pushes a notification to every live subscription.
    pub fn notify(&self, notification: Notification) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn check(&self, source_id: BeanSourceId) -> Result<(), BeanSourceError> {
        let unreachable = self.state.lock().unwrap().unreachable;
        if unreachable || source_id != self.generation() {
            return Err(BeanSourceError::Disconnected(format!("source {source_id} is stale")));
        }
        Ok(())
    }

    fn subscribe(&self) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }
}

#[async_trait]
impl BeanSourceProvider for FakeCluster {
    async fn bean_source(&self) -> Result<Arc<dyn BeanSource>, BeanSourceError> {
        if self.state.lock().unwrap().unreachable {
            return Err(BeanSourceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "management server unreachable",
            )));
        }

        Ok(Arc::new(FakeSource { id: self.generation(), cluster: self.clone() }))
    }

    fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn remove_disconnect_listener(&self, listener: &Arc<dyn DisconnectListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| Arc::as_ptr(l) as *const () != target);
    }
}

#[derive(Debug)]
struct FakeSource {
    id: BeanSourceId,
    cluster: FakeCluster,
}

#[async_trait]
impl BeanSource for FakeSource {
    fn id(&self) -> BeanSourceId {
        self.id
    }

    async fn domain_handle(&self, domain: &str) -> Result<Arc<dyn DomainHandle>, BeanSourceError> {
        self.cluster.check(self.id)?;
        if domain != DOMAIN {
            return Err(BeanSourceError::not_found("domain", domain));
        }
        Ok(Arc::new(FakeHandle { id: self.id, name: domain.to_string(), cluster: self.cluster.clone() }))
    }

    async fn instance_handle(&self, _domain: &str, instance: &str) -> Result<Arc<dyn InstanceHandle>, BeanSourceError> {
        self.cluster.check(self.id)?;
        if !self.cluster.state.lock().unwrap().instances.contains_key(instance) {
            // the remote layer reports a missing instance through its opaque wrapper
            return Err(BeanSourceError::undeclared(BeanSourceError::not_found("instance", instance)));
        }
        Ok(Arc::new(FakeHandle { id: self.id, name: instance.to_string(), cluster: self.cluster.clone() }))
    }

    async fn resource_handle(&self, _domain: &str, resource_id: &str) -> Result<Arc<dyn ResourceHandle>, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(Arc::new(FakeHandle { id: self.id, name: resource_id.to_string(), cluster: self.cluster.clone() }))
    }
}

#[derive(Debug)]
struct FakeHandle {
    id: BeanSourceId,
    name: String,
    cluster: FakeCluster,
}

#[async_trait]
impl DomainHandle for FakeHandle {
    fn source_id(&self) -> BeanSourceId {
        self.id
    }

    async fn state(&self) -> Result<DomainState, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(self.cluster.state.lock().unwrap().domain.clone())
    }

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(self.cluster.subscribe())
    }
}

#[async_trait]
impl InstanceHandle for FakeHandle {
    fn source_id(&self) -> BeanSourceId {
        self.id
    }

    async fn state(&self) -> Result<InstanceState, BeanSourceError> {
        self.cluster.check(self.id)?;
        let mut state = self.cluster.state.lock().unwrap();
        if state.corrupt_instance_states.contains(&self.name) {
            state.nr_corrupt_state_reads += 1;
            let malformed = serde_json::from_str::<Value>("{ \"name\": ").unwrap_err();
            return Err(BeanSourceError::Json(malformed));
        }

        state
            .instances
            .get(&self.name)
            .cloned()
            .ok_or_else(|| BeanSourceError::not_found("instance", self.name.as_str()))
    }

    async fn snapshot_jobs_uri(&self, _max_depth: u32, _include_static: bool) -> Result<String, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(format!("fake://{}/snapshot", self.name))
    }

    async fn job_metrics_uri(&self) -> Result<String, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(format!("fake://{}/metrics", self.name))
    }

    async fn subscribe(&self) -> Result<NotificationStream, BeanSourceError> {
        self.cluster.check(self.id)?;
        Ok(self.cluster.subscribe())
    }
}

#[async_trait]
impl ResourceHandle for FakeHandle {
    async fn state(&self, _instance: &str) -> Result<ResourceState, BeanSourceError> {
        self.cluster.check(self.id)?;
        self.cluster
            .state
            .lock()
            .unwrap()
            .resources
            .get(&self.name)
            .cloned()
            .ok_or_else(|| BeanSourceError::not_found("resource", self.name.as_str()))
    }
}

/// Serves the bulk documents of a [`FakeCluster`] from `fake://{instance}/{snapshot|metrics}`.
#[derive(Debug, Clone)]
pub struct FakeWebClient {
    cluster: FakeCluster,
}

impl FakeWebClient {
    pub fn new(cluster: &FakeCluster) -> Self {
        Self { cluster: cluster.clone() }
    }
}

#[async_trait]
impl WebClient for FakeWebClient {
    async fn get(&self, uri: &str) -> Result<String, WebClientError> {
        let url = url::Url::parse(uri).map_err(|source| WebClientError::Uri { uri: uri.to_string(), source })?;
        let delay = self.cluster.state.lock().unwrap().document_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.cluster.state.lock().unwrap();
        let instance = url.host_str().unwrap_or_default();
        let documents = match url.path() {
            "/snapshot" => &state.snapshots,
            _ => &state.metrics,
        };

        match documents.get(instance) {
            Some(body) if !state.unreachable => Ok(body.clone()),
            _ => Err(WebClientError::HttpStatus { status: reqwest::StatusCode::SERVICE_UNAVAILABLE, url }),
        }
    }
}

/// Prometheus exporter that records every prefix removal.
#[derive(Debug)]
pub struct RecordingExporter {
    inner: PrometheusMetricsExporter,
    removals: Mutex<Vec<(EntityType, Vec<String>)>>,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self {
            inner: PrometheusMetricsExporter::new("streams", Registry::new()),
            removals: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.inner.registry()
    }

    pub fn nr_series(&self) -> usize {
        self.inner.nr_series()
    }

    pub fn nr_removals(&self, entity: EntityType, prefix: &[&str]) -> usize {
        self.removals
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, p)| *e == entity && p.iter().map(String::as_str).eq(prefix.iter().copied()))
            .count()
    }

    /// Exposition text without the lines that move with the clock.
    pub fn stable_exposition(&self) -> String {
        let families = self.inner.registry().gather();
        let text = TextEncoder::new().encode_to_string(&families).unwrap();
        text.lines()
            .filter(|line| !line.contains("last_refresh_time") && !line.contains("last_failure_time"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl MetricsExporter for RecordingExporter {
    fn create_metric(&self, name: &str, entity: EntityType, help: &str) -> Result<(), ExporterError> {
        self.inner.create_metric(name, entity, help)
    }

    fn get_metric(&self, name: &str, entity: EntityType, labels: &[&str]) -> Result<Gauge, ExporterError> {
        self.inner.get_metric(name, entity, labels)
    }

    fn remove_all_child_metrics(&self, entity: EntityType, prefix: &[&str]) -> usize {
        self.removals
            .lock()
            .unwrap()
            .push((entity, prefix.iter().map(|p| (*p).to_string()).collect()));
        self.inner.remove_all_child_metrics(entity, prefix)
    }

    fn value_of(&self, name: &str, entity: EntityType, labels: &[&str]) -> Option<f64> {
        self.inner.value_of(name, entity, labels)
    }
}

pub struct Harness {
    pub cluster: FakeCluster,
    pub exporter: Arc<RecordingExporter>,
    pub context: TrackerContext,
}

impl Harness {
    pub fn new(cluster: FakeCluster) -> Self {
        Self::with_settings(cluster, TrackerSettings::default())
    }

    pub fn with_settings(cluster: FakeCluster, settings: TrackerSettings) -> Self {
        let exporter = Arc::new(RecordingExporter::new());
        let context = TrackerContext::new(
            DOMAIN,
            settings,
            Arc::new(cluster.clone()),
            Arc::new(FakeWebClient::new(&cluster)),
            exporter.clone(),
        );
        Self { cluster, exporter, context }
    }
}

pub fn job_snapshot(id: &str, name: &str, pes: &[(&str, &str)]) -> Value {
    let pes: Vec<Value> = pes
        .iter()
        .map(|(pe_id, resource)| {
            json!({
                "id": pe_id,
                "status": "running",
                "health": "healthy",
                "resource": resource,
                "launchCount": 1,
                "operators": [{
                    "name": format!("Op{pe_id}"),
                    "kind": "spl.relational::Functor",
                    "inputPorts": [{ "index": 0, "name": "In" }],
                    "outputPorts": [{ "index": 0, "name": "Out" }]
                }],
                "outputPorts": [{ "index": 0, "connections": [{ "id": format!("c{pe_id}") }] }]
            })
        })
        .collect();

    json!({
        "id": id,
        "name": name,
        "status": "running",
        "health": "healthy",
        "submitTime": 1_620_234_667_000_i64,
        "applicationName": name,
        "pes": pes,
    })
}

pub fn job_metrics(id: &str, name: &str, pes: &[(&str, &str)]) -> Value {
    let pes: Vec<Value> = pes
        .iter()
        .map(|(pe_id, _)| {
            json!({
                "id": pe_id,
                "metrics": [
                    { "name": "nCpuMilliseconds", "value": 100.0 },
                    { "name": "nResidentMemoryConsumption", "value": 10.0 },
                    { "name": "nMemoryConsumption", "value": 20.0 }
                ],
                "operators": [{
                    "name": format!("Op{pe_id}"),
                    "metrics": [{ "name": "nTuplesProcessed", "value": 7.0 }],
                    "inputPorts": [{ "index": 0, "metrics": [{ "name": "nTuplesProcessed", "value": 7.0 }] }],
                    "outputPorts": [{ "index": 0, "metrics": [{ "name": "nTuplesSubmitted", "value": 7.0 }] }]
                }],
                "outputPorts": [{
                    "index": 0,
                    "metrics": [{ "name": "nTuplesTransmitted", "value": 7.0 }],
                    "connections": [{ "id": format!("c{pe_id}"), "metrics": [{ "name": "congestionFactor", "value": 3.0 }] }]
                }]
            })
        })
        .collect();

    json!({ "id": id, "name": name, "pes": pes })
}
