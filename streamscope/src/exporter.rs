//! Exported metric registry for tracked entities.
//!
//! Trackers define a metric once per (name, entity) pair and then write values under the label
//! values identifying one entity. Series live exactly as long as the entity they describe; when an
//! entity goes away its tracker removes every series under the entity's label prefix.

mod entity;

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use heck::ToSnakeCase;
use prometheus::{Gauge, GaugeVec, Opts, Registry};
use thiserror::Error;

pub use entity::EntityType;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("no {entity} metric named {name} has been created")]
    UnknownMetric { name: String, entity: EntityType },

    #[error("{entity} metric {name} would be exported as {full_name}, which is already a {existing} metric")]
    NameConflict {
        name: String,
        entity: EntityType,
        full_name: String,
        existing: EntityType,
    },

    #[error("{0}")]
    Prometheus(#[from] prometheus::Error),
}

impl ExporterError {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UnknownMetric { .. } => "exporter::unknown_metric",
            Self::NameConflict { .. } => "exporter::name_conflict",
            Self::Prometheus(_) => "exporter::prometheus",
        }
    }
}

pub trait MetricsExporter: Debug + Send + Sync {
    /// Defines a metric for an entity type. Defining an existing metric again is a no-op, as is
    /// defining a differently spelled name that exports under the same name for the same entity.
    /// A name that would export onto another entity type's metric is refused.
    fn create_metric(&self, name: &str, entity: EntityType, help: &str) -> Result<(), ExporterError>;

    /// Returns the series for the entity identified by `labels`, creating it if needed.
    fn get_metric(&self, name: &str, entity: EntityType, labels: &[&str]) -> Result<Gauge, ExporterError>;

    /// Removes every series of `entity` and of the entities nested in it whose leading label
    /// values equal `prefix`. Returns the number of series removed.
    fn remove_all_child_metrics(&self, entity: EntityType, prefix: &[&str]) -> usize;

    /// Current value of a series, without creating it.
    fn value_of(&self, name: &str, entity: EntityType, labels: &[&str]) -> Option<f64>;
}

#[derive(Debug)]
struct MetricFamily {
    name: String,
    entity: EntityType,
    gauges: GaugeVec,
    children: Mutex<HashSet<Vec<String>>>,
}

impl MetricFamily {
    fn children(&self) -> std::sync::MutexGuard<'_, HashSet<Vec<String>>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `name` may share this family's exposition name.
    fn accept(&self, name: &str, entity: EntityType, full_name: &str) -> Result<(), ExporterError> {
        if self.entity != entity {
            return Err(ExporterError::NameConflict {
                name: name.to_string(),
                entity,
                full_name: full_name.to_string(),
                existing: self.entity,
            });
        }

        if self.name != name {
            tracing::debug!(
                %entity, %name, defined_as=%self.name, %full_name,
                "metric name aliases an existing metric"
            );
        }
        Ok(())
    }
}

/// [`MetricsExporter`] over a prometheus registry, one gauge vector per exposition name.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsExporter {
    namespace: String,
    registry: Registry,
    families: Arc<DashMap<String, Arc<MetricFamily>>>,
}

impl PrometheusMetricsExporter {
    pub fn new(namespace: impl Into<String>, registry: Registry) -> Self {
        Self {
            namespace: namespace.into(),
            registry,
            families: Arc::new(DashMap::new()),
        }
    }

    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Exposition name of a metric, e.g. `streams_job_n_cpu_milliseconds`.
    pub fn full_name(&self, name: &str, entity: EntityType) -> String {
        let name = sanitize(&name.to_snake_case());
        if self.namespace.is_empty() {
            format!("{}_{name}", entity.prefix())
        } else {
            format!("{}_{}_{name}", sanitize(&self.namespace), entity.prefix())
        }
    }

    fn family(&self, name: &str, entity: EntityType) -> Result<Arc<MetricFamily>, ExporterError> {
        self.families
            .get(&self.full_name(name, entity))
            .map(|f| f.value().clone())
            .filter(|f| f.entity == entity)
            .ok_or_else(|| ExporterError::UnknownMetric { name: name.to_string(), entity })
    }

    /// Number of live series across all metrics.
    pub fn nr_series(&self) -> usize {
        self.families.iter().map(|f| f.value().children().len()).sum()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl MetricsExporter for PrometheusMetricsExporter {
    fn create_metric(&self, name: &str, entity: EntityType, help: &str) -> Result<(), ExporterError> {
        let full_name = self.full_name(name, entity);
        if let Some(family) = self.families.get(&full_name) {
            return family.value().accept(name, entity, &full_name);
        }

        let help = if help.is_empty() { name } else { help };
        let gauges = GaugeVec::new(Opts::new(full_name.clone(), help), entity.label_names())?;

        match self.families.entry(full_name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().accept(name, entity, entry.key()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                self.registry.register(Box::new(gauges.clone()))?;
                entry.insert(Arc::new(MetricFamily {
                    name: name.to_string(),
                    entity,
                    gauges,
                    children: Mutex::new(HashSet::new()),
                }));
                Ok(())
            },
        }
    }

    fn get_metric(&self, name: &str, entity: EntityType, labels: &[&str]) -> Result<Gauge, ExporterError> {
        let family = self.family(name, entity)?;
        let gauge = family.gauges.get_metric_with_label_values(labels)?;
        family.children().insert(labels.iter().map(|l| (*l).to_string()).collect());
        Ok(gauge)
    }

    fn remove_all_child_metrics(&self, entity: EntityType, prefix: &[&str]) -> usize {
        let mut removed = 0;

        for family in self.families.iter() {
            let family = family.value();
            if !family.entity.is_nested_under(entity, prefix.len()) {
                continue;
            }

            let mut children = family.children();
            let doomed: Vec<Vec<String>> = children
                .iter()
                .filter(|labels| labels.iter().zip(prefix).all(|(actual, expected)| actual == expected))
                .cloned()
                .collect();

            for labels in doomed {
                let values: Vec<&str> = labels.iter().map(String::as_str).collect();
                if let Err(error) = family.gauges.remove_label_values(&values) {
                    tracing::debug!(?error, ?labels, "series already absent from registry");
                }
                children.remove(&labels);
                removed += 1;
            }
        }

        tracing::trace!(%entity, ?prefix, %removed, "removed exported series");
        removed
    }

    fn value_of(&self, name: &str, entity: EntityType, labels: &[&str]) -> Option<f64> {
        let family = self.family(name, entity).ok()?;
        let key: Vec<String> = labels.iter().map(|l| (*l).to_string()).collect();
        if !family.children().contains(&key) {
            return None;
        }

        family.gauges.get_metric_with_label_values(labels).ok().map(|g| g.get())
    }
}
