use std::collections::BTreeSet;

use dashmap::DashMap;

use super::{JobDetails, JobInfo};
use crate::exporter::ExporterError;
use crate::model::{JobId, JobMetricsDocument, JobSnapshot};

/// Jobs of one instance keyed by id, with a name index. Entries leaving the map are closed, which
/// tears down their exported series.
#[derive(Debug)]
pub struct JobMap {
    instance: String,
    jobs: DashMap<JobId, JobDetails>,
    names: DashMap<String, JobId>,
}

impl JobMap {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            jobs: DashMap::new(),
            names: DashMap::new(),
        }
    }

    pub fn instance(&self) -> &str {
        self.instance.as_str()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn ids(&self) -> BTreeSet<JobId> {
        self.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn id_for_name(&self, name: &str) -> Option<JobId> {
        self.names.get(name).map(|id| id.value().clone())
    }

    /// Adds a job, closing any entry it replaces.
    pub fn add(&self, details: JobDetails) {
        let id = details.id().clone();
        let name = details.name().to_string();

        if let Some(mut previous) = self.jobs.insert(id.clone(), details) {
            tracing::warn!(instance=%self.instance, job_id=%id, "replacing tracked job");
            self.names.remove_if(previous.name(), |_, indexed| indexed == &id);
            previous.close();
        }

        if let Some(other) = self.names.insert(name.clone(), id.clone()) {
            if other != id {
                tracing::warn!(instance=%self.instance, job_name=%name, job_id=%id, previous_id=%other, "job name now refers to a different job");
            }
        }
    }

    /// Removes and closes a job.
    pub fn remove(&self, id: &JobId) -> Option<JobDetails> {
        let (_, mut details) = self.jobs.remove(id)?;
        self.names.remove_if(details.name(), |_, indexed| indexed == id);
        details.close();
        Some(details)
    }

    /// Removes and closes every job, returning how many were removed.
    pub fn clear(&self) -> usize {
        let ids = self.ids();
        let nr_removed = ids.iter().filter_map(|id| self.remove(id)).count();
        self.names.clear();
        nr_removed
    }

    /// Replaces a job's snapshot, keeping the name index in step when the job was renamed.
    pub fn update_snapshot(&self, snapshot: JobSnapshot, raw_snapshot: String) -> bool {
        let id = snapshot.id.clone();
        let new_name = snapshot.name.clone();

        let old_name = match self.jobs.get_mut(&id) {
            Some(mut details) => {
                let old_name = details.name().to_string();
                details.update_snapshot(snapshot, raw_snapshot);
                old_name
            },
            None => return false,
        };

        if old_name != new_name {
            tracing::info!(instance=%self.instance, job_id=%id, %old_name, %new_name, "tracked job renamed");
            self.names.remove_if(&old_name, |_, indexed| indexed == &id);
            self.names.insert(new_name, id);
        }

        true
    }

    pub fn update_metrics(&self, metrics: JobMetricsDocument, raw_metrics: String) -> bool {
        match self.jobs.get_mut(&metrics.id) {
            Some(mut details) => {
                details.update_metrics(metrics, raw_metrics);
                true
            },
            None => false,
        }
    }

    pub fn clear_metrics(&self, id: &JobId) {
        if let Some(mut details) = self.jobs.get_mut(id) {
            details.clear_metrics();
        }
    }

    /// Re-exports every job's metrics. A job that fails to export does not stop the rest; the
    /// first failure is returned once every job has been visited.
    pub fn refresh_all(&self) -> Result<(), ExporterError> {
        let mut first_error = None;
        for mut entry in self.jobs.iter_mut() {
            if let Err(error) = entry.value_mut().refresh() {
                tracing::error!(instance=%self.instance, job_id=%entry.key(), ?error, "failed to export job");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn job_info(&self, id: &JobId) -> Option<JobInfo> {
        self.jobs.get(id).map(|details| details.info())
    }

    /// Job info ordered by job id.
    pub fn job_infos(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self.jobs.iter().map(|entry| entry.value().info()).collect();
        infos.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        infos
    }

    pub fn with_job<F, R>(&self, id: &JobId, f: F) -> Option<R>
    where
        F: FnOnce(&JobDetails) -> R,
    {
        self.jobs.get(id).map(|details| f(details.value()))
    }

    /// Every name in the index refers to a tracked job of that name, and every tracked job is
    /// reachable through its name.
    pub fn is_consistent(&self) -> bool {
        let names_resolve = self.names.iter().all(|entry| {
            self.jobs
                .get(entry.value())
                .map_or(false, |details| details.name() == entry.key().as_str())
        });

        let jobs_indexed = self.jobs.iter().all(|entry| {
            self.names
                .get(entry.value().name())
                .map_or(false, |id| id.value() == entry.key())
        });

        names_resolve && jobs_indexed && self.names.len() == self.jobs.len()
    }
}
