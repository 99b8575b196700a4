use std::time::Duration;

use claim::*;
use pretty_assertions::assert_eq;
use streamscope::exporter::{EntityType, MetricsExporter};
use streamscope::management::Notification;
use streamscope::model::{Health, JobId};
use streamscope::tracker::{InstancePhase, InstanceTracker, TrackerError};

use crate::fixtures::{FakeCluster, Harness};

const INSTANCE: &str = "inst1";

fn cluster_with_jobs(jobs: &[(&str, &str, &[(&str, &str)])]) -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_instance(INSTANCE);
    cluster.set_jobs(INSTANCE, jobs);
    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instance_tracker_end_to_end() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_instance_tracker_end_to_end");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[("17", "app1", &[("1", "r1"), ("2", "r1")])]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());

    let phase = assert_ok!(tracker.initialize().await);
    assert_eq!(phase, InstancePhase::Available);

    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report.added, vec![JobId::new("17")]);
    assert!(report.removed.is_empty());

    let jobs = tracker.all_job_info().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "app1");
    assert_eq!(jobs[0].pe_count, 2);

    let exporter = &harness.exporter;
    assert_eq!(exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]), Some(1.0));
    assert_eq!(exporter.value_of("peCount", EntityType::Job, &[INSTANCE, "app1"]), Some(2.0));
    assert_eq!(exporter.value_of("nCpuMilliseconds", EntityType::Job, &[INSTANCE, "app1"]), Some(200.0));
    assert_eq!(exporter.value_of("congestionFactorMax", EntityType::Job, &[INSTANCE, "app1"]), Some(3.0));
    assert_eq!(exporter.value_of("jobCount", EntityType::Instance, &[INSTANCE]), Some(1.0));
    assert_eq!(exporter.value_of("status", EntityType::Instance, &[INSTANCE]), Some(1.0));
    assert_eq!(
        exporter.value_of("nCpuMilliseconds", EntityType::Pe, &[INSTANCE, "app1", "r1", "1"]),
        Some(100.0)
    );
    assert_eq!(
        exporter.value_of("congestionFactor", EntityType::PeConnection, &[INSTANCE, "app1", "r1", "2", "0", "c2"]),
        Some(3.0)
    );
    assert_eq!(
        exporter.value_of("nTuplesProcessed", EntityType::OperatorInputPort, &[INSTANCE, "app1", "r1", "1", "Op1", "In"]),
        Some(7.0)
    );

    let snapshot = assert_some!(tracker.job_snapshot(&JobId::new("17")).await);
    let snapshot: serde_json::Value = serde_json::from_str(&snapshot)?;
    assert_eq!(snapshot["name"], "app1");
    assert_some!(tracker.job_metrics(&JobId::new("17")).await);

    harness.cluster.set_jobs(INSTANCE, &[]);
    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report.removed, vec![JobId::new("17")]);
    assert!(tracker.all_job_info().await.is_empty());
    assert_none!(exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]));
    assert_none!(exporter.value_of("status", EntityType::Pe, &[INSTANCE, "app1", "r1", "1"]));
    assert_eq!(exporter.value_of("jobCount", EntityType::Instance, &[INSTANCE]), Some(0.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_is_idempotent() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_refresh_is_idempotent");
    let _ = main_span.enter();

    let cluster = cluster_with_jobs(&[("1", "app1", &[("1", "r1")]), ("2", "app2", &[("2", "r2")])]);
    cluster.set_resources(INSTANCE, &["r1", "r2"]);
    let harness = Harness::new(cluster);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());

    assert_ok!(tracker.refresh().await);
    let first = harness.exporter.stable_exposition();
    let first_jobs = tracker.all_job_info().await;

    let report = assert_ok!(tracker.refresh().await);
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(report.updated.len(), 2);

    assert_eq!(harness.exporter.stable_exposition(), first);
    assert_eq!(tracker.all_job_info().await, first_jobs);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_missing_from_snapshot_are_removed() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_jobs_missing_from_snapshot_are_removed");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[
        ("1", "app1", &[("1", "r1")]),
        ("2", "app2", &[("2", "r1")]),
        ("3", "app3", &[("3", "r1")]),
    ]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);
    assert_eq!(tracker.all_job_info().await.len(), 3);

    harness.cluster.set_jobs(INSTANCE, &[("1", "app1", &[("1", "r1")]), ("3", "app3", &[("3", "r1")])]);
    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report.removed, vec![JobId::new("2")]);
    assert_none!(tracker.job_info(&JobId::new("2")).await);
    assert_some!(tracker.job_info(&JobId::new("1")).await);
    assert_some!(tracker.job_info(&JobId::new("3")).await);

    let exporter = &harness.exporter;
    assert_none!(exporter.value_of("status", EntityType::Job, &[INSTANCE, "app2"]));
    assert_none!(exporter.value_of("nCpuMilliseconds", EntityType::Pe, &[INSTANCE, "app2", "r1", "2"]));
    assert_some!(exporter.value_of("status", EntityType::Job, &[INSTANCE, "app3"]));

    let removals = exporter.nr_removals(EntityType::Job, &[INSTANCE, "app2"]);
    assert_ok!(tracker.refresh().await);
    assert_eq!(exporter.nr_removals(EntityType::Job, &[INSTANCE, "app2"]), removals);
    assert_none!(exporter.value_of("status", EntityType::Job, &[INSTANCE, "app2"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_and_restore_after_disconnect() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_reset_and_restore_after_disconnect");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[("17", "app1", &[("1", "r1")])]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);
    assert_eq!(tracker.phase().await, InstancePhase::Available);

    harness.cluster.disconnect().await;
    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report, Default::default());
    assert_eq!(tracker.phase().await, InstancePhase::Unavailable);
    assert!(tracker.all_job_info().await.is_empty());

    let exporter = &harness.exporter;
    assert_none!(exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]));
    assert_eq!(exporter.value_of("status", EntityType::Instance, &[INSTANCE]), Some(0.0));
    assert_eq!(exporter.value_of("startTime", EntityType::Instance, &[INSTANCE]), Some(0.0));
    assert_eq!(exporter.value_of("snapshotsFailed", EntityType::Instance, &[INSTANCE]), Some(1.0));

    harness.cluster.reconnect();
    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report.added, vec![JobId::new("17")]);
    assert_eq!(tracker.phase().await, InstancePhase::Available);
    assert_eq!(exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]), Some(1.0));
    assert_eq!(exporter.value_of("status", EntityType::Instance, &[INSTANCE]), Some(1.0));
    assert_eq!(exporter.value_of("snapshotsFailed", EntityType::Instance, &[INSTANCE]), Some(0.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_resources_leave_no_series() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_departed_resources_leave_no_series");
    let _ = main_span.enter();

    let cluster = cluster_with_jobs(&[]);
    cluster.set_resources(INSTANCE, &["A", "B"]);
    let harness = Harness::new(cluster);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);

    let exporter = &harness.exporter;
    assert_eq!(exporter.value_of("cpuSpeed", EntityType::Resource, &[INSTANCE, "A"]), Some(2_400.0));
    assert_eq!(exporter.value_of("status", EntityType::Resource, &[INSTANCE, "B"]), Some(1.0));

    harness.cluster.set_resources(INSTANCE, &["A"]);
    assert_ok!(tracker.refresh().await);
    assert_some!(exporter.value_of("cpuSpeed", EntityType::Resource, &[INSTANCE, "A"]));
    assert_none!(exporter.value_of("cpuSpeed", EntityType::Resource, &[INSTANCE, "B"]));
    assert_none!(exporter.value_of("status", EntityType::Resource, &[INSTANCE, "B"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instance_not_started_is_unavailable() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_instance_not_started_is_unavailable");
    let _ = main_span.enter();

    let cluster = FakeCluster::new();
    cluster.add_instance_with_start(INSTANCE, false);
    let harness = Harness::new(cluster);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());

    let phase = assert_ok!(tracker.initialize().await);
    assert_eq!(phase, InstancePhase::Unavailable);
    let info = tracker.info().await;
    assert!(info.exists);
    assert!(!info.available);

    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report, Default::default());
    assert_eq!(harness.exporter.value_of("status", EntityType::Instance, &[INSTANCE]), Some(0.0));
    assert_eq!(harness.exporter.value_of("startTime", EntityType::Instance, &[INSTANCE]), Some(0.0));

    harness.cluster.add_instance(INSTANCE);
    assert_ok!(tracker.refresh().await);
    assert_eq!(tracker.phase().await, InstancePhase::Available);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_instance_does_not_exist() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_missing_instance_does_not_exist");
    let _ = main_span.enter();

    let harness = Harness::new(FakeCluster::new());
    let tracker = InstanceTracker::new("ghost", harness.context.clone());

    let phase = assert_ok!(tracker.initialize().await);
    assert_eq!(phase, InstancePhase::Unavailable);
    let info = tracker.info().await;
    assert!(!info.exists);
    assert!(!info.available);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_snapshot_is_fatal() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_malformed_snapshot_is_fatal");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[]));
    harness
        .cluster
        .set_snapshot_document(INSTANCE, r#"{ "jobs": [{ "id": "1", "name": 42 }] }"#);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());

    let error = assert_err!(tracker.refresh().await);
    assert!(error.is_fatal());
    assert!(matches!(error, TrackerError::Schema { document: "snapshot", .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_on_disconnect_resets_only_for_own_connection() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_on_disconnect_resets_only_for_own_connection");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[("17", "app1", &[("1", "r1")])]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);

    let current = harness.cluster.generation();
    tracker.on_disconnect(current + 100).await;
    assert_eq!(tracker.phase().await, InstancePhase::Available);
    assert_eq!(tracker.all_job_info().await.len(), 1);

    tracker.on_disconnect(current).await;
    assert_eq!(tracker.phase().await, InstancePhase::Unavailable);
    assert!(tracker.all_job_info().await.is_empty());
    assert_none!(harness.exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_removes_instance_series() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_close_removes_instance_series");
    let _ = main_span.enter();

    let cluster = cluster_with_jobs(&[("17", "app1", &[("1", "r1")])]);
    cluster.set_resources(INSTANCE, &["r1"]);
    let harness = Harness::new(cluster);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);
    assert!(0 < harness.exporter.nr_series());

    tracker.close().await;
    assert_eq!(harness.exporter.nr_series(), 0);

    let report = assert_ok!(tracker.refresh().await);
    assert_eq!(report, Default::default());
    assert_eq!(harness.exporter.nr_series(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_attribute_change_updates_instance_metrics() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_attribute_change_updates_instance_metrics");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_eq!(assert_ok!(tracker.initialize().await), InstancePhase::Available);
    assert_eq!(harness.exporter.value_of("health", EntityType::Instance, &[INSTANCE]), Some(1.0));

    harness.cluster.set_instance_health(INSTANCE, Health::PartiallyHealthy);
    harness.cluster.notify(Notification::AttributeChange {
        attribute: "health".to_string(),
        value: "partiallyHealthy".to_string(),
    });

    let mut health = None;
    for _ in 0..50 {
        health = harness.exporter.value_of("health", EntityType::Instance, &[INSTANCE]);
        if health == Some(0.5) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(health, Some(0.5));
    assert_eq!(tracker.info().await.health, Health::PartiallyHealthy);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resource_metrics_cannot_overwrite_resource_status() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_resource_metrics_cannot_overwrite_resource_status");
    let _ = main_span.enter();

    let cluster = cluster_with_jobs(&[]);
    cluster.set_resources(INSTANCE, &["A"]);
    cluster.set_resource_metric("A", "status", 0.25);
    cluster.set_resource_metric("A", "Status", 0.5);
    cluster.set_resource_metric("A", "loadAverage", 3.0);
    let harness = Harness::new(cluster);
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_ok!(tracker.refresh().await);
    assert_ok!(tracker.refresh().await);

    let exporter = &harness.exporter;
    assert_eq!(exporter.value_of("status", EntityType::Resource, &[INSTANCE, "A"]), Some(1.0));
    assert_eq!(exporter.value_of("loadAverage", EntityType::Resource, &[INSTANCE, "A"]), Some(3.0));
    assert_eq!(exporter.value_of("cpuSpeed", EntityType::Resource, &[INSTANCE, "A"]), Some(2_400.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notification_failure_is_reported_by_next_refresh() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_notification_failure_is_reported_by_next_refresh");
    let _ = main_span.enter();

    let harness = Harness::new(cluster_with_jobs(&[("17", "app1", &[("1", "r1")])]));
    let tracker = InstanceTracker::new(INSTANCE, harness.context.clone());
    assert_eq!(assert_ok!(tracker.initialize().await), InstancePhase::Available);

    harness.cluster.set_instance_state_corrupt(INSTANCE, true);
    harness.cluster.notify(Notification::AttributeChange {
        attribute: "health".to_string(),
        value: "healthy".to_string(),
    });

    for _ in 0..50 {
        if 0 < harness.cluster.nr_corrupt_state_reads() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.cluster.nr_corrupt_state_reads(), 1);
    harness.cluster.set_instance_state_corrupt(INSTANCE, false);

    let error = assert_err!(tracker.refresh().await);
    assert!(!error.is_recoverable());
    assert!(matches!(error, TrackerError::Remote(_)));
    assert_eq!(tracker.phase().await, InstancePhase::Available);

    assert_ok!(tracker.refresh().await);
    assert_eq!(harness.exporter.value_of("health", EntityType::Job, &[INSTANCE, "app1"]), Some(1.0));
    Ok(())
}
