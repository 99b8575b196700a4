mod ids;
mod job_metrics;
mod snapshot;
mod status;

pub use ids::{JobId, PeId};
pub use job_metrics::{
    ConnectionMetrics, JobMetricsDocument, MetricValue, OperatorMetrics, OperatorPortMetrics, PeMetrics,
    PeOutputPortMetrics, PePortMetrics,
};
pub use snapshot::{
    ConnectionSnapshot, JobSnapshot, OperatorSnapshot, PeOutputPortSnapshot, PeSnapshot, PortSnapshot,
};
pub use status::{Health, Status, StatusMetric};

use serde::{Deserialize, Serialize};

/// Envelope shared by the bulk job documents. The individual job entries are kept as raw JSON so
/// each job's slice of the document can be retained verbatim alongside its parsed form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsDocument {
    #[serde(default)]
    pub jobs: Vec<serde_json::Value>,
}

impl JobsDocument {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}
