use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use heck::ToSnakeCase;

use crate::exporter::{EntityType, ExporterError, MetricsExporter};
use crate::model::{
    Health, JobId, JobMetricsDocument, JobSnapshot, MetricValue, PeId, PeMetrics, Status, StatusMetric,
};
use crate::tracker::{JobInfo, PeInfo};

pub const METRIC_STATUS: &str = "status";
pub const METRIC_HEALTH: &str = "health";
pub const METRIC_SUBMIT_TIME: &str = "submitTime";
pub const METRIC_PE_COUNT: &str = "peCount";
pub const METRIC_LAUNCH_COUNT: &str = "launchCount";
pub const METRIC_CPU: &str = "nCpuMilliseconds";
pub const METRIC_RESIDENT_MEMORY: &str = "nResidentMemoryConsumption";
pub const METRIC_MEMORY: &str = "nMemoryConsumption";
pub const METRIC_CONGESTION: &str = "congestionFactor";
pub const METRIC_CONGESTION_MIN: &str = "congestionFactorMin";
pub const METRIC_CONGESTION_MAX: &str = "congestionFactorMax";
pub const METRIC_CONGESTION_AVG: &str = "congestionFactorAvg";
pub const METRIC_CONGESTION_SUM: &str = "congestionFactorSum";

const JOB_METRICS: &[(&str, &str)] = &[
    (METRIC_STATUS, "Job status: 1 running, 0.5 partial or transitional, 0 otherwise"),
    (METRIC_HEALTH, "Job health: 1 healthy, 0.5 partially healthy, 0 otherwise"),
    (METRIC_SUBMIT_TIME, "Job submission time in seconds since the epoch"),
    (METRIC_PE_COUNT, "Number of processing elements in the job"),
    (METRIC_CPU, "Total CPU milliseconds consumed by the job's processing elements"),
    (METRIC_RESIDENT_MEMORY, "Total resident memory of the job's processing elements"),
    (METRIC_MEMORY, "Total memory consumed by the job's processing elements"),
    (METRIC_CONGESTION_MIN, "Minimum congestion factor across the job's connections"),
    (METRIC_CONGESTION_MAX, "Maximum congestion factor across the job's connections"),
    (METRIC_CONGESTION_AVG, "Average congestion factor across the job's connections"),
    (METRIC_CONGESTION_SUM, "Sum of congestion factors across the job's connections"),
];

const PE_METRICS: &[(&str, &str)] = &[
    (METRIC_STATUS, "Processing element status: 1 running, 0.5 partial or transitional, 0 otherwise"),
    (METRIC_HEALTH, "Processing element health: 1 healthy, 0.5 partially healthy, 0 otherwise"),
    (METRIC_LAUNCH_COUNT, "Number of times the processing element has been launched"),
];

/// Totals over one job's processing elements and connections, recomputed from scratch on every
/// refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobAggregates {
    pub cpu_millis: f64,
    pub resident_memory: f64,
    pub memory: f64,
    pub congestion_min: f64,
    pub congestion_max: f64,
    pub congestion_avg: f64,
    pub congestion_sum: f64,
}

impl JobAggregates {
    /// Sums cover every reported PE regardless of health; a job without connections reports zero
    /// congestion.
    pub fn from_metrics(metrics: &JobMetricsDocument) -> Self {
        let sum_of = |name: &str| metrics.pes.iter().filter_map(|pe| pe.metric(name)).sum::<f64>();

        let congestion: Vec<f64> = metrics
            .pes
            .iter()
            .flat_map(|pe| pe.output_ports.iter())
            .flat_map(|port| port.connections.iter())
            .filter_map(|c| c.metric(METRIC_CONGESTION))
            .collect();

        let (congestion_min, congestion_max, congestion_avg, congestion_sum) = if congestion.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let sum: f64 = congestion.iter().sum();
            let min = congestion.iter().copied().fold(f64::INFINITY, f64::min);
            let max = congestion.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max, sum / congestion.len() as f64, sum)
        };

        Self {
            cpu_millis: sum_of(METRIC_CPU),
            resident_memory: sum_of(METRIC_RESIDENT_MEMORY),
            memory: sum_of(METRIC_MEMORY),
            congestion_min,
            congestion_max,
            congestion_avg,
            congestion_sum,
        }
    }
}

/// One job's latest snapshot and metrics together with their projection onto exported metrics.
///
/// The lookup maps are rebuilt whole from each snapshot. The metrics document identifies ports
/// only by index, so port names and PE placement come from the most recent snapshot.
pub struct JobDetails {
    instance: String,
    snapshot: JobSnapshot,
    raw_snapshot: String,
    metrics: Option<JobMetricsDocument>,
    raw_metrics: Option<String>,
    pe_info: BTreeMap<PeId, PeInfo>,
    operator_kind: HashMap<String, String>,
    input_port_names: HashMap<String, HashMap<u64, String>>,
    output_port_names: HashMap<String, HashMap<u64, String>>,
    exported_name: Option<String>,
    exporter: Arc<dyn MetricsExporter>,
    closed: bool,
}

impl fmt::Debug for JobDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDetails")
            .field("instance", &self.instance)
            .field("id", &self.snapshot.id)
            .field("name", &self.snapshot.name)
            .field("status", &self.snapshot.status)
            .field("health", &self.snapshot.health)
            .field("nr_pes", &self.pe_info.len())
            .field("has_metrics", &self.metrics.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl JobDetails {
    pub fn new(
        instance: impl Into<String>, snapshot: JobSnapshot, raw_snapshot: String, exporter: Arc<dyn MetricsExporter>,
    ) -> Self {
        let mut details = Self {
            instance: instance.into(),
            snapshot,
            raw_snapshot,
            metrics: None,
            raw_metrics: None,
            pe_info: BTreeMap::new(),
            operator_kind: HashMap::new(),
            input_port_names: HashMap::new(),
            output_port_names: HashMap::new(),
            exported_name: None,
            exporter,
            closed: false,
        };
        details.rebuild_lookups();
        details
    }

    pub const fn id(&self) -> &JobId {
        &self.snapshot.id
    }

    pub fn name(&self) -> &str {
        self.snapshot.name.as_str()
    }

    pub fn instance(&self) -> &str {
        self.instance.as_str()
    }

    pub const fn status(&self) -> Status {
        self.snapshot.status
    }

    pub const fn health(&self) -> Health {
        self.snapshot.health
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn info(&self) -> JobInfo {
        JobInfo::from_snapshot(self.instance.as_str(), &self.snapshot)
    }

    pub fn raw_snapshot(&self) -> &str {
        self.raw_snapshot.as_str()
    }

    pub fn raw_metrics(&self) -> Option<&str> {
        self.raw_metrics.as_deref()
    }

    pub const fn pe_info(&self) -> &BTreeMap<PeId, PeInfo> {
        &self.pe_info
    }

    pub fn operator_kind(&self, operator: &str) -> Option<&str> {
        self.operator_kind.get(operator).map(String::as_str)
    }

    pub fn input_port_name(&self, operator: &str, index: u64) -> Option<&str> {
        self.input_port_names.get(operator)?.get(&index).map(String::as_str)
    }

    pub fn output_port_name(&self, operator: &str, index: u64) -> Option<&str> {
        self.output_port_names.get(operator)?.get(&index).map(String::as_str)
    }

    /// Replaces the snapshot and rebuilds every lookup map from it. A snapshot of another job is
    /// ignored.
    pub fn update_snapshot(&mut self, snapshot: JobSnapshot, raw_snapshot: String) {
        if snapshot.id != self.snapshot.id {
            tracing::warn!(
                instance=%self.instance, job_id=%self.snapshot.id, snapshot_id=%snapshot.id,
                "ignoring snapshot for a different job"
            );
            return;
        }

        self.snapshot = snapshot;
        self.raw_snapshot = raw_snapshot;
        self.rebuild_lookups();
    }

    fn rebuild_lookups(&mut self) {
        let mut pe_info = BTreeMap::new();
        let mut operator_kind = HashMap::new();
        let mut input_port_names: HashMap<String, HashMap<u64, String>> = HashMap::new();
        let mut output_port_names: HashMap<String, HashMap<u64, String>> = HashMap::new();

        for pe in self.snapshot.pes.iter() {
            pe_info.insert(pe.id.clone(), PeInfo::from(pe));

            for op in pe.operators.iter() {
                operator_kind.insert(op.name.clone(), op.kind.clone());

                let inputs = input_port_names.entry(op.name.clone()).or_default();
                inputs.extend(op.input_ports.iter().map(|p| (p.index, p.name.clone())));

                let outputs = output_port_names.entry(op.name.clone()).or_default();
                outputs.extend(op.output_ports.iter().map(|p| (p.index, p.name.clone())));
            }
        }

        self.pe_info = pe_info;
        self.operator_kind = operator_kind;
        self.input_port_names = input_port_names;
        self.output_port_names = output_port_names;
    }

    pub fn update_metrics(&mut self, metrics: JobMetricsDocument, raw_metrics: String) {
        if metrics.id != self.snapshot.id {
            tracing::warn!(
                instance=%self.instance, job_id=%self.snapshot.id, metrics_id=%metrics.id,
                "ignoring metrics for a different job"
            );
            return;
        }

        self.metrics = Some(metrics);
        self.raw_metrics = Some(raw_metrics);
    }

    /// Forgets metrics when the job no longer appears in the metrics document.
    pub fn clear_metrics(&mut self) {
        self.metrics = None;
        self.raw_metrics = None;
    }

    pub fn aggregates(&self) -> Option<JobAggregates> {
        self.metrics.as_ref().map(JobAggregates::from_metrics)
    }

    /// Re-exports the job: removes every series previously written for it, defines the metrics
    /// again and writes the current values. Series of a relocated PE or renamed port therefore do
    /// not linger.
    #[tracing::instrument(level = "trace", skip(self), fields(instance=%self.instance, job_id=%self.snapshot.id))]
    pub fn refresh(&mut self) -> Result<(), ExporterError> {
        if self.closed {
            return Ok(());
        }

        self.remove_exported();
        self.define_metrics()?;
        self.exported_name = Some(self.snapshot.name.clone());

        let instance = self.instance.as_str();
        let job = self.snapshot.name.as_str();

        self.set(METRIC_STATUS, EntityType::Job, &[instance, job], self.snapshot.status.metric_value())?;
        self.set(METRIC_HEALTH, EntityType::Job, &[instance, job], self.snapshot.health.metric_value())?;
        let submit_secs = self.snapshot.submit_time.map_or(0.0, |t| t.timestamp_millis() as f64 / 1_000.0);
        self.set(METRIC_SUBMIT_TIME, EntityType::Job, &[instance, job], submit_secs)?;
        self.set(METRIC_PE_COUNT, EntityType::Job, &[instance, job], self.pe_info.len() as f64)?;

        for (pe_id, pe) in self.pe_info.iter() {
            let labels = [instance, job, pe.resource.as_str(), pe_id.as_str()];
            self.set(METRIC_STATUS, EntityType::Pe, &labels, pe.status.metric_value())?;
            self.set(METRIC_HEALTH, EntityType::Pe, &labels, pe.health.metric_value())?;
            self.set(METRIC_LAUNCH_COUNT, EntityType::Pe, &labels, pe.launch_count as f64)?;
        }

        if let Some(ref metrics) = self.metrics {
            let aggregates = JobAggregates::from_metrics(metrics);
            let labels = [instance, job];
            self.set(METRIC_CPU, EntityType::Job, &labels, aggregates.cpu_millis)?;
            self.set(METRIC_RESIDENT_MEMORY, EntityType::Job, &labels, aggregates.resident_memory)?;
            self.set(METRIC_MEMORY, EntityType::Job, &labels, aggregates.memory)?;
            self.set(METRIC_CONGESTION_MIN, EntityType::Job, &labels, aggregates.congestion_min)?;
            self.set(METRIC_CONGESTION_MAX, EntityType::Job, &labels, aggregates.congestion_max)?;
            self.set(METRIC_CONGESTION_AVG, EntityType::Job, &labels, aggregates.congestion_avg)?;
            self.set(METRIC_CONGESTION_SUM, EntityType::Job, &labels, aggregates.congestion_sum)?;

            for pe in metrics.pes.iter() {
                self.export_pe_metrics(pe);
            }
        }

        Ok(())
    }

    fn export_pe_metrics(&self, pe: &PeMetrics) {
        let info = match self.pe_info.get(&pe.id) {
            Some(info) => info,
            None => {
                tracing::warn!(
                    instance=%self.instance, job_id=%self.snapshot.id, pe_id=%pe.id,
                    "metrics reported for a processing element missing from the snapshot"
                );
                return;
            },
        };

        // resource attribution of an unhealthy PE may be mid-relocation
        if !info.health.is_healthy() {
            tracing::info!(
                instance=%self.instance, job_id=%self.snapshot.id, pe_id=%pe.id, health=%info.health,
                "skipping metrics of unhealthy processing element"
            );
            return;
        }

        let instance = self.instance.as_str();
        let job = self.snapshot.name.as_str();
        let resource = info.resource.as_str();
        let pe_id = pe.id.as_str();

        self.set_all(&pe.metrics, EntityType::Pe, &[instance, job, resource, pe_id]);

        for port in pe.input_ports.iter() {
            let index = port.index.to_string();
            let labels = [instance, job, resource, pe_id, index.as_str()];
            self.set_all(&port.metrics, EntityType::PeInputPort, &labels);
        }

        for port in pe.output_ports.iter() {
            let index = port.index.to_string();
            let labels = [instance, job, resource, pe_id, index.as_str()];
            self.set_all(&port.metrics, EntityType::PeOutputPort, &labels);

            for connection in port.connections.iter() {
                let labels = [instance, job, resource, pe_id, index.as_str(), connection.id.as_str()];
                self.set_all(&connection.metrics, EntityType::PeConnection, &labels);
            }
        }

        for op in pe.operators.iter() {
            let operator = op.name.as_str();
            self.set_all(&op.metrics, EntityType::Operator, &[instance, job, resource, pe_id, operator]);

            for port in op.input_ports.iter() {
                let name = self.port_label(self.input_port_name(operator, port.index), port.index);
                let labels = [instance, job, resource, pe_id, operator, name.as_str()];
                self.set_all(&port.metrics, EntityType::OperatorInputPort, &labels);
            }

            for port in op.output_ports.iter() {
                let name = self.port_label(self.output_port_name(operator, port.index), port.index);
                let labels = [instance, job, resource, pe_id, operator, name.as_str()];
                self.set_all(&port.metrics, EntityType::OperatorOutputPort, &labels);
            }
        }
    }

    fn port_label(&self, name: Option<&str>, index: u64) -> String {
        match name {
            Some(name) => name.to_string(),
            None => {
                tracing::debug!(
                    instance=%self.instance, job_id=%self.snapshot.id, %index,
                    "port missing from snapshot; labeling by index"
                );
                index.to_string()
            },
        }
    }

    fn define_metrics(&self) -> Result<(), ExporterError> {
        for (name, help) in JOB_METRICS {
            self.exporter.create_metric(name, EntityType::Job, help)?;
        }

        for (name, help) in PE_METRICS {
            self.exporter.create_metric(name, EntityType::Pe, help)?;
        }

        Ok(())
    }

    fn set(&self, name: &str, entity: EntityType, labels: &[&str], value: f64) -> Result<(), ExporterError> {
        self.exporter.get_metric(name, entity, labels)?.set(value);
        Ok(())
    }

    /// Writes free-form payload metrics, defining each on first sight. A payload metric that would
    /// land on one of the tracker's own series, or that cannot be exported, is skipped.
    fn set_all(&self, metrics: &[MetricValue], entity: EntityType, labels: &[&str]) {
        let reserved = reserved_metrics(entity);

        for metric in metrics {
            let name = metric.name.as_str();
            if is_reserved(name, reserved) {
                tracing::debug!(
                    instance=%self.instance, job_id=%self.snapshot.id, %entity, metric=%name,
                    "payload metric shadows a tracked metric; skipping"
                );
                continue;
            }

            let outcome = self
                .exporter
                .create_metric(name, entity, "")
                .and_then(|()| self.set(name, entity, labels, metric.value));

            if let Err(error) = outcome {
                tracing::warn!(
                    instance=%self.instance, job_id=%self.snapshot.id, %entity, metric=%name, error=?error,
                    "skipping payload metric"
                );
            }
        }
    }

    fn remove_exported(&mut self) {
        if let Some(name) = self.exported_name.take() {
            self.exporter
                .remove_all_child_metrics(EntityType::Job, &[self.instance.as_str(), name.as_str()]);
        }

        // a renamed job may still have series under its new name from an earlier life
        self.exporter.remove_all_child_metrics(
            EntityType::Job,
            &[self.instance.as_str(), self.snapshot.name.as_str()],
        );
    }

    /// Tears down the job's exported series. Returns false if the job was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }

        self.remove_exported();
        self.closed = true;
        tracing::debug!(instance=%self.instance, job_id=%self.snapshot.id, job_name=%self.snapshot.name, "closed job");
        true
    }
}

fn reserved_metrics(entity: EntityType) -> &'static [(&'static str, &'static str)] {
    match entity {
        EntityType::Job => JOB_METRICS,
        EntityType::Pe => PE_METRICS,
        _ => &[],
    }
}

fn is_reserved(name: &str, reserved: &[(&str, &str)]) -> bool {
    let name = name.to_snake_case();
    reserved.iter().any(|(r, _)| r.to_snake_case() == name)
}
