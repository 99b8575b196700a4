use std::time::Duration;

use claim::*;
use pretty_assertions::assert_eq;
use streamscope::exporter::{EntityType, MetricsExporter};
use streamscope::settings::TrackerSettings;
use streamscope::tracker::{DomainTracker, InstancePhase, TrackerError};

use crate::fixtures::{FakeCluster, Harness, DOMAIN};

fn two_instance_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_instance("inst1");
    cluster.add_instance("inst2");
    cluster.set_jobs("inst1", &[("17", "app1", &[("1", "r1"), ("2", "r1")])]);
    cluster.set_jobs("inst2", &[("21", "app2", &[("1", "r2")])]);
    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_domain_tracks_every_reported_instance() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_domain_tracks_every_reported_instance");
    let _ = main_span.enter();

    let harness = Harness::new(two_instance_cluster());
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);
    assert!(tracker.is_available().await);
    assert_eq!(harness.cluster.nr_listeners(), 1);

    let names: Vec<String> = tracker.instances().await.iter().map(|t| t.name().to_string()).collect();
    assert_eq!(names, vec!["inst1".to_string(), "inst2".to_string()]);

    assert_ok!(tracker.refresh().await);
    let exporter = &harness.exporter;
    assert_eq!(exporter.value_of("status", EntityType::Domain, &[DOMAIN]), Some(1.0));
    assert_eq!(exporter.value_of("instanceCount", EntityType::Domain, &[DOMAIN]), Some(2.0));
    assert_eq!(exporter.value_of("health", EntityType::Job, &["inst1", "app1"]), Some(1.0));
    assert_eq!(exporter.value_of("health", EntityType::Job, &["inst2", "app2"]), Some(1.0));

    let infos = tracker.instance_infos().await;
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|info| info.available && info.exists));
    assert_eq!(infos[0].job_count, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_domain_tracks_allow_list() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_domain_tracks_allow_list");
    let _ = main_span.enter();

    let settings = TrackerSettings {
        instances: vec!["inst2".to_string(), "ghost".to_string()],
        ..TrackerSettings::default()
    };
    let harness = Harness::with_settings(two_instance_cluster(), settings);
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);

    assert_none!(tracker.instance("inst1").await);
    let inst2 = assert_some!(tracker.instance("inst2").await);
    assert_eq!(inst2.phase().await, InstancePhase::Available);

    let ghost = assert_some!(tracker.instance("ghost").await);
    assert_eq!(ghost.phase().await, InstancePhase::Unavailable);
    assert!(!ghost.info().await.exists);

    assert_ok!(tracker.refresh().await);
    assert_none!(harness.exporter.value_of("health", EntityType::Job, &["inst1", "app1"]));
    assert_some!(harness.exporter.value_of("health", EntityType::Job, &["inst2", "app2"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_domain_fails_initialization() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_unreachable_domain_fails_initialization");
    let _ = main_span.enter();

    let cluster = two_instance_cluster();
    cluster.disconnect().await;
    let harness = Harness::new(cluster);

    let error = assert_err!(DomainTracker::initialize(harness.context.clone()).await);
    assert!(error.is_fatal());
    assert!(matches!(error, TrackerError::Initialization { .. }));
    assert_eq!(harness.cluster.nr_listeners(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_instance_is_closed() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_departed_instance_is_closed");
    let _ = main_span.enter();

    let harness = Harness::new(two_instance_cluster());
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);
    assert_ok!(tracker.refresh().await);
    let inst2 = assert_some!(tracker.instance("inst2").await);

    harness.cluster.remove_instance("inst2");
    assert_ok!(tracker.refresh().await);

    assert_none!(tracker.instance("inst2").await);
    assert_eq!(inst2.phase().await, InstancePhase::Unavailable);
    let exporter = &harness.exporter;
    assert_none!(exporter.value_of("status", EntityType::Instance, &["inst2"]));
    assert_none!(exporter.value_of("health", EntityType::Job, &["inst2", "app2"]));
    assert_eq!(exporter.value_of("instanceCount", EntityType::Domain, &[DOMAIN]), Some(1.0));
    assert_some!(exporter.value_of("health", EntityType::Job, &["inst1", "app1"]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_domain_recovers_after_disconnect() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_domain_recovers_after_disconnect");
    let _ = main_span.enter();

    let harness = Harness::new(two_instance_cluster());
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);
    assert_ok!(tracker.refresh().await);

    harness.cluster.disconnect().await;
    assert!(!tracker.is_available().await);
    let exporter = &harness.exporter;
    assert_eq!(exporter.value_of("status", EntityType::Domain, &[DOMAIN]), Some(0.0));
    for instance in tracker.instances().await {
        assert_eq!(instance.phase().await, InstancePhase::Unavailable);
        assert!(instance.all_job_info().await.is_empty());
    }
    assert_none!(exporter.value_of("health", EntityType::Job, &["inst1", "app1"]));

    // still unreachable: remote failures are absorbed
    assert_ok!(tracker.refresh().await);
    assert!(!tracker.is_available().await);

    harness.cluster.reconnect();
    assert_ok!(tracker.refresh().await);
    assert!(tracker.is_available().await);
    assert_eq!(exporter.value_of("status", EntityType::Domain, &[DOMAIN]), Some(1.0));
    assert_eq!(exporter.value_of("health", EntityType::Job, &["inst1", "app1"]), Some(1.0));
    assert_eq!(exporter.value_of("health", EntityType::Job, &["inst2", "app2"]), Some(1.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_survives_repeated_disconnects() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_refresh_survives_repeated_disconnects");
    let _ = main_span.enter();

    let harness = Harness::new(two_instance_cluster());
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);

    let mut refreshers = Vec::new();
    for _ in 0..4 {
        let tracker = tracker.clone();
        refreshers.push(tokio::spawn(async move {
            for _ in 0..25 {
                tracker.refresh().await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, TrackerError>(())
        }));
    }

    let cluster = harness.cluster.clone();
    let chaos = tokio::spawn(async move {
        for _ in 0..10 {
            cluster.disconnect().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
            cluster.reconnect();
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    });

    for refresher in refreshers {
        assert_ok!(refresher.await?);
    }
    chaos.await?;

    // one cycle notices a connection that went stale mid-refresh, the next restores it
    assert_ok!(tracker.refresh().await);
    assert_ok!(tracker.refresh().await);
    assert!(tracker.is_available().await);
    for instance in tracker.instances().await {
        assert_eq!(instance.phase().await, InstancePhase::Available);
        assert!(instance.inspect_jobs(|jobs| jobs.is_consistent()).await);
        assert_eq!(instance.all_job_info().await.len(), 1);
    }
    assert_eq!(harness.exporter.value_of("health", EntityType::Job, &["inst1", "app1"]), Some(1.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_removes_every_series() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&streamscope::logging::TEST_TRACING);
    let main_span = tracing::info_span!("test_close_removes_every_series");
    let _ = main_span.enter();

    let cluster = two_instance_cluster();
    cluster.set_resources("inst1", &["r1"]);
    let harness = Harness::new(cluster);
    let tracker = assert_ok!(DomainTracker::initialize(harness.context.clone()).await);
    assert_ok!(tracker.refresh().await);
    assert!(0 < harness.exporter.nr_series());

    tracker.close().await;
    assert_eq!(harness.exporter.nr_series(), 0);
    assert_eq!(harness.cluster.nr_listeners(), 0);
    assert!(tracker.instances().await.is_empty());

    assert_ok!(tracker.refresh().await);
    assert_eq!(harness.exporter.nr_series(), 0);
    Ok(())
}
