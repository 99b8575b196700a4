use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct TrackerSettings {
    /// Zero disables the refresh scheduler.
    #[serde(rename = "refresh_interval_secs")]
    #[serde_as(as = "DurationSeconds")]
    pub refresh_interval: Duration,

    /// Instances to track. When empty every instance the domain reports is tracked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<String>,

    pub snapshot_max_depth: u32,

    pub snapshot_include_static: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
            instances: Vec::default(),
            snapshot_max_depth: Self::DEFAULT_SNAPSHOT_MAX_DEPTH,
            snapshot_include_static: false,
        }
    }
}

impl TrackerSettings {
    const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
    const DEFAULT_SNAPSHOT_MAX_DEPTH: u32 = 5;

    pub fn automatic_refresh(&self) -> Option<Duration> {
        if self.refresh_interval.is_zero() {
            None
        } else {
            Some(self.refresh_interval)
        }
    }

    pub fn tracks_all_instances(&self) -> bool {
        self.instances.is_empty()
    }
}
