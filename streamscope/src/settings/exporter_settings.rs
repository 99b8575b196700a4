use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ExporterSettings {
    /// Prefix applied to every exported tracker metric name.
    pub namespace: String,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self { namespace: "streams".to_string() }
    }
}
