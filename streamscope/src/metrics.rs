use prometheus::Registry;

use crate::management::rest;
use crate::tracker;

/// Registers the static self-metrics. Tracker entity series live in the exporter's own registry.
#[tracing::instrument(level = "trace")]
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(tracker::TRACKER_REFRESH_TIME.clone()))?;
    registry.register(Box::new(tracker::AGGREGATOR_REFRESH_TIME.clone()))?;
    registry.register(Box::new(tracker::TRACKER_ERRORS.clone()))?;

    registry.register(Box::new(rest::MANAGEMENT_QUERY_TIME.clone()))?;

    Ok(())
}
