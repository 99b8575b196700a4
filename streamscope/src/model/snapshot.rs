use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampMilliSeconds};

use super::{Health, JobId, PeId, Status};

/// One job's entry in the bulk job snapshot document. The snapshot is authoritative for job
/// existence and for the topology (PE placement, operator kinds and port names) used to
/// interpret the metrics document.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    #[serde_as(as = "Option<TimestampMilliSeconds<i64>>")]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default)]
    pub pes: Vec<PeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeSnapshot {
    pub id: PeId,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub health: Health,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub launch_count: u64,
    #[serde(default)]
    pub operators: Vec<OperatorSnapshot>,
    #[serde(default)]
    pub output_ports: Vec<PeOutputPortSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSnapshot {
    pub name: String,
    #[serde(default, alias = "operatorKind")]
    pub kind: String,
    #[serde(default)]
    pub input_ports: Vec<PortSnapshot>,
    #[serde(default)]
    pub output_ports: Vec<PortSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSnapshot {
    #[serde(alias = "indexWithinOperator")]
    pub index: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeOutputPortSnapshot {
    #[serde(alias = "indexWithinPE")]
    pub index: u64,
    #[serde(default)]
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_pe_id: Option<PeId>,
}
