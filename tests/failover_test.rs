//! Integration tests for crash recovery and misfire handling
//!
//! These tests verify:
//! - A crashed instance's running item is queued, claimed and re-run
//! - A graceful shutdown leaves nothing to fail over
//! - Misfired triggers produce exactly one catch-up run

mod common;

use common::{eventually, settle, BlockingJob, Cluster, RecordingJob};
use jobshard::scheduler::TriggerEvent;
use jobshard::ExecutionSource;
use std::sync::Arc;

#[tokio::test]
async fn test_crash_failover_round_trip() {
    let cluster = Cluster::start(3, common::job_config("job", 3)).await;
    cluster.run_cycle(&[0, 1, 2], &RecordingJob::default()).await;
    assert_eq!(
        cluster.assignment("job").await.get(&2).map(String::as_str),
        Some("10.0.0.3@-@3")
    );

    // Third instance starts item 2 and dies mid-run
    let blocking = BlockingJob::new();
    let in_flight = {
        let coordinator = Arc::clone(&cluster.nodes[2].coordinator);
        let job = Arc::clone(&blocking);
        tokio::spawn(async move { coordinator.execute(&*job).await })
    };
    blocking.started.notified().await;
    assert!(cluster.exists("/job/sharding/2/running").await);

    in_flight.abort();
    cluster.crash(2).await;

    let c = &cluster;
    assert!(eventually(|| async move { c.exists("/job/failover/job/2").await }).await);
    assert!(!cluster.exists("/job/sharding/2/running").await);
    assert!(!cluster.exists("/job/instances/10.0.0.3@-@3").await);

    // A live instance claims the record
    let survivor = &cluster.nodes[0].coordinator;
    let mut triggers = survivor.subscribe_triggers();
    let claimed = survivor.services().failover.failover_if_necessary().await.unwrap();
    assert_eq!(claimed, vec![2]);
    assert!(!cluster.exists("/job/failover/job/2").await);
    assert_eq!(
        survivor.services().failover.get_local_failover_items().await.unwrap(),
        vec![2]
    );

    // The claim runs as a failover execution and is then cleared
    let job = RecordingJob::default();
    let report = survivor.execute(&job).await.unwrap();
    assert_eq!(report.items_for(ExecutionSource::Failover), vec![2]);
    assert!(!cluster.exists("/job/sharding/2/failover").await);
    assert!(triggers.try_recv().is_err());

    // Item 2 is back to normal ownership
    settle().await;
    let job = RecordingJob::default();
    cluster.run_cycle(&[0, 1], &job).await;
    let assignment = cluster.assignment("job").await;
    assert_eq!(assignment.len(), 3);
    assert!(assignment.values().all(|id| id != "10.0.0.3@-@3"));
    assert_eq!(job.items_from(ExecutionSource::NormalTrigger).await, vec![0, 1, 2]);
    assert!(job.items_from(ExecutionSource::Failover).await.is_empty());
}

#[tokio::test]
async fn test_claim_is_published_after_cycle() {
    let cluster = Cluster::start(2, common::job_config("job", 2)).await;
    cluster.run_cycle(&[0, 1], &RecordingJob::default()).await;

    let blocking = BlockingJob::new();
    let in_flight = {
        let coordinator = Arc::clone(&cluster.nodes[1].coordinator);
        let job = Arc::clone(&blocking);
        tokio::spawn(async move { coordinator.execute(&*job).await })
    };
    blocking.started.notified().await;
    in_flight.abort();
    cluster.crash(1).await;

    let c = &cluster;
    assert!(eventually(|| async move { c.exists("/job/failover/job/1").await }).await);
    settle().await;

    let survivor = &cluster.nodes[0].coordinator;
    let mut triggers = survivor.subscribe_triggers();
    let job = RecordingJob::default();
    let report = survivor.execute(&job).await.unwrap();

    // Resharding hands both items to the survivor, then it claims the crashed one
    assert_eq!(report.items_for(ExecutionSource::NormalTrigger), vec![0, 1]);
    assert_eq!(report.failover_claimed, vec![1]);
    match triggers.try_recv().unwrap() {
        TriggerEvent::FailoverClaimed { job_name, items, .. } => {
            assert_eq!(job_name, "job");
            assert_eq!(items, vec![1]);
        }
        other => panic!("unexpected trigger {:?}", other),
    }

    // The follow-up trigger runs the claim instead of the regular items
    let report = survivor.execute(&job).await.unwrap();
    assert_eq!(report.items_for(ExecutionSource::Failover), vec![1]);
    assert!(report.items_for(ExecutionSource::NormalTrigger).is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_queues_nothing() {
    let cluster = Cluster::start(2, common::job_config("job", 4)).await;
    cluster.run_cycle(&[0, 1], &RecordingJob::default()).await;

    cluster.nodes[1].coordinator.shutdown().await.unwrap();
    settle().await;

    assert!(!cluster.exists("/job/instances/10.0.0.2@-@2").await);
    assert!(cluster
        .nodes[0]
        .coordinator
        .services()
        .failover
        .get_queued_items()
        .await
        .unwrap()
        .is_empty());

    let job = RecordingJob::default();
    cluster.run_cycle(&[0], &job).await;
    assert_eq!(job.items_from(ExecutionSource::NormalTrigger).await, vec![0, 1, 2, 3]);

    // A stopped coordinator does not execute
    let report = cluster.nodes[1].coordinator.execute(&job).await.unwrap();
    assert!(report.executed.is_empty());
}

#[tokio::test]
async fn test_misfire_runs_exactly_one_catch_up() {
    let cluster = Cluster::start(1, common::job_config("job", 1)).await;
    cluster.run_cycle(&[0], &RecordingJob::default()).await;

    let coordinator = Arc::clone(&cluster.nodes[0].coordinator);
    let blocking = BlockingJob::new();
    let first = {
        let coordinator = Arc::clone(&coordinator);
        let job = Arc::clone(&blocking);
        tokio::spawn(async move { coordinator.execute(&*job).await })
    };
    blocking.started.notified().await;

    // Two triggers fire while item 0 is still running
    let skipped = RecordingJob::default();
    for _ in 0..2 {
        let report = coordinator.execute(&skipped).await.unwrap();
        assert_eq!(report.misfired, vec![0]);
        assert!(report.executed.is_empty());
    }
    assert!(skipped.runs().await.is_empty());
    assert!(cluster.exists("/job/sharding/0/misfire").await);

    blocking.release();
    let report = first.await.unwrap().unwrap();

    assert_eq!(report.items_for(ExecutionSource::NormalTrigger), vec![0]);
    assert_eq!(report.items_for(ExecutionSource::Misfire), vec![0]);
    assert_eq!(
        blocking.runs.lock().await.clone(),
        vec![
            (ExecutionSource::NormalTrigger, 0),
            (ExecutionSource::Misfire, 0)
        ]
    );
    assert!(!cluster.exists("/job/sharding/0/misfire").await);
    assert!(!cluster.exists("/job/sharding/0/running").await);
}

#[tokio::test]
async fn test_misfire_disabled_records_nothing() {
    let job_config = jobshard::config::JobConfig::builder("job", "0 * * * * ?", 1)
        .misfire(false)
        .build()
        .unwrap();
    let cluster = Cluster::start(1, job_config).await;
    cluster.run_cycle(&[0], &RecordingJob::default()).await;

    let coordinator = Arc::clone(&cluster.nodes[0].coordinator);
    let blocking = BlockingJob::new();
    let first = {
        let coordinator = Arc::clone(&coordinator);
        let job = Arc::clone(&blocking);
        tokio::spawn(async move { coordinator.execute(&*job).await })
    };
    blocking.started.notified().await;

    let report = coordinator.execute(&RecordingJob::default()).await.unwrap();
    assert_eq!(report.misfired, vec![0]);
    assert!(!cluster.exists("/job/sharding/0/misfire").await);

    blocking.release();
    let report = first.await.unwrap().unwrap();
    assert!(report.items_for(ExecutionSource::Misfire).is_empty());
}
