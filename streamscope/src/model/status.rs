use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum_macros::{Display, EnumIter, EnumString};

/// Projects a lifecycle state onto the three level scale used by dashboards and alerts:
/// fully up is `1.0`, partial or transitional is `0.5`, anything else is `0.0`.
pub trait StatusMetric {
    fn metric_value(&self) -> f64;
}

/// Lifecycle state reported for domains, instances, resources, jobs and processing elements.
/// States the management server reports but this crate does not know map to `Unknown`.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum Status {
    Unknown,
    Constructed,
    Submitted,
    Starting,
    Running,
    PartiallyRunning,
    Restarting,
    Relocating,
    Quiescing,
    Quiesced,
    Resuming,
    Canceling,
    Canceled,
    Stopping,
    Stopped,
    PartiallyFailed,
    Failed,
}

impl Default for Status {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Status {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub const fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Constructed
                | Self::Submitted
                | Self::Starting
                | Self::PartiallyRunning
                | Self::Restarting
                | Self::Relocating
                | Self::Quiescing
                | Self::Resuming
                | Self::Canceling
                | Self::Stopping
                | Self::PartiallyFailed
        )
    }
}

impl StatusMetric for Status {
    fn metric_value(&self) -> f64 {
        if self.is_running() {
            1.0
        } else if self.is_transitional() {
            0.5
        } else {
            0.0
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rep = String::deserialize(deserializer)?;
        Ok(Self::from_str(rep.as_str()).unwrap_or_else(|_| {
            tracing::debug!(status=%rep, "unrecognized status treated as unknown");
            Self::Unknown
        }))
    }
}

#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase", ascii_case_insensitive)]
pub enum Health {
    Unknown,
    Healthy,
    PartiallyHealthy,
    PartiallyUnhealthy,
    Unhealthy,
}

impl Default for Health {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Health {
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl StatusMetric for Health {
    fn metric_value(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::PartiallyHealthy | Self::PartiallyUnhealthy => 0.5,
            Self::Unhealthy | Self::Unknown => 0.0,
        }
    }
}

impl Serialize for Health {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Health {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rep = String::deserialize(deserializer)?;
        Ok(Self::from_str(rep.as_str()).unwrap_or_else(|_| {
            tracing::debug!(health=%rep, "unrecognized health treated as unknown");
            Self::Unknown
        }))
    }
}
