use serde::{Deserialize, Serialize};

use super::{JobId, PeId};

/// One job's entry in the bulk job metrics document. Ports are identified only by their index,
/// so names must be resolved through the most recent snapshot of the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetricsDocument {
    pub id: JobId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pes: Vec<PeMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeMetrics {
    pub id: PeId,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
    #[serde(default)]
    pub operators: Vec<OperatorMetrics>,
    #[serde(default)]
    pub input_ports: Vec<PePortMetrics>,
    #[serde(default)]
    pub output_ports: Vec<PeOutputPortMetrics>,
}

impl PeMetrics {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMetrics {
    pub name: String,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
    #[serde(default)]
    pub input_ports: Vec<OperatorPortMetrics>,
    #[serde(default)]
    pub output_ports: Vec<OperatorPortMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorPortMetrics {
    #[serde(alias = "indexWithinOperator")]
    pub index: u64,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PePortMetrics {
    #[serde(alias = "indexWithinPE")]
    pub index: u64,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeOutputPortMetrics {
    #[serde(alias = "indexWithinPE")]
    pub index: u64,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
    #[serde(default)]
    pub connections: Vec<ConnectionMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub id: String,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
}

impl ConnectionMetrics {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }
}
