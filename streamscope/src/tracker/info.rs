use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::management::{DomainState, InstanceState};
use crate::model::{Health, JobId, JobSnapshot, PeSnapshot, Status};

/// The domain as last reported by the management server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub status: Status,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub creation_user: Option<String>,
    pub resource_manager: Option<String>,
    pub instances: BTreeSet<String>,
    pub resources: BTreeSet<String>,
    pub available: bool,
}

impl DomainInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Takes every attribute from the remote state; nothing here is inferred locally.
    pub fn update_from(&mut self, state: &DomainState) {
        self.status = state.status;
        self.creation_time = state.creation_time;
        self.start_time = state.start_time;
        self.creation_user = state.creation_user.clone();
        self.resource_manager = state.resource_manager.clone();
        self.instances = state.instances.clone();
        self.resources = state.resources.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub status: Status,
    pub health: Health,
    pub creation_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    /// False until the management server has confirmed the instance exists.
    pub exists: bool,
    /// True only once the start time is known and no reset has happened since.
    pub available: bool,
    pub job_count: usize,
}

impl InstanceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn update_from(&mut self, state: &InstanceState) {
        self.exists = true;
        self.status = state.status;
        self.health = state.health;
        self.creation_time = state.creation_time;
        self.start_time = state.start_time;
    }

    pub const fn is_available(&self) -> bool {
        self.available
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub instance: String,
    pub status: Status,
    pub health: Health,
    pub submit_time: Option<DateTime<Utc>>,
    pub application_name: Option<String>,
    pub pe_count: usize,
}

impl JobInfo {
    pub fn from_snapshot(instance: impl Into<String>, snapshot: &JobSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            instance: instance.into(),
            status: snapshot.status,
            health: snapshot.health,
            submit_time: snapshot.submit_time,
            application_name: snapshot.application_name.clone(),
            pe_count: snapshot.pes.len(),
        }
    }
}

/// Placement and condition of one processing element, as of the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeInfo {
    pub status: Status,
    pub health: Health,
    pub resource: String,
    pub launch_count: u64,
}

impl From<&PeSnapshot> for PeInfo {
    fn from(pe: &PeSnapshot) -> Self {
        Self {
            status: pe.status,
            health: pe.health,
            resource: pe.resource.clone(),
            launch_count: pe.launch_count,
        }
    }
}
