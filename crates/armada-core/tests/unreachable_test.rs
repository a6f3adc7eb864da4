//! Unreachable instance handling: replacement, expunge, stray cleanup.

use std::time::Duration;

use armada_core::clock::Clock;
use armada_core::driver::BusTaskReason;
use armada_core::instance::Condition;
use armada_core::reconcile::{scan_overdue, ReconcileConfig};
use armada_test_utils::{app, big_offer, lost_status, running_status, TestCluster};

#[tokio::test]
async fn unreachable_instance_is_replaced_then_expunged() {
    let cluster = TestCluster::start().await;
    let spec = app("/svc")
        .instances(1)
        .unreachable(Duration::from_secs(60), Duration::from_secs(3600))
        .build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.confirm_all_running().await;
    cluster.settle().await;

    let spec_id: armada_core::spec::PathId = "/svc".parse().unwrap();
    let task_id = cluster.driver.launched_task_ids()[0].clone();
    let original = task_id.instance_id.clone();

    // The agent disconnects: TASK_LOST with a recoverable reason.
    cluster.clock.advance(Duration::from_secs(10));
    cluster
        .send_status(lost_status(
            &task_id,
            BusTaskReason::AgentDisconnected,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;
    assert_eq!(
        cluster.scope.tracker().get(&original).unwrap().state.condition,
        Condition::Unreachable
    );

    // 65 seconds later reconciliation re-delivers the unreachable status;
    // the condition advances and a replacement is queued.
    cluster.clock.advance(Duration::from_secs(65));
    cluster
        .send_status(lost_status(
            &task_id,
            BusTaskReason::AgentDisconnected,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;
    assert_eq!(
        cluster.scope.tracker().get(&original).unwrap().state.condition,
        Condition::UnreachableInactive
    );

    cluster.send_offer(big_offer("o2", "node-2")).await;
    cluster.settle().await;
    let instances = cluster.scope.tracker().spec_instances(&spec_id);
    assert_eq!(instances.len(), 2, "replacement launched beside the unreachable");
    let replacement = instances
        .iter()
        .find(|i| i.id != original)
        .expect("replacement exists");
    assert_eq!(replacement.state.condition, Condition::Staging);

    // At the expunge window the overdue scan drops the original.
    cluster.clock.advance(Duration::from_secs(3600));
    let (candidates, _rx) = tokio::sync::mpsc::channel(16);
    scan_overdue(
        cluster.scope.tracker(),
        &candidates,
        &ReconcileConfig::default(),
        cluster.clock.now(),
    )
    .await;
    cluster.settle().await;
    assert!(cluster.scope.tracker().get(&original).is_none());

    // The task comes back after the expunge: the kill service shoots it.
    let kills_before = cluster.driver.kill_count();
    cluster
        .send_status(running_status(&task_id, cluster.clock.now()))
        .await;
    cluster.settle().await;
    assert!(cluster.driver.kill_count() > kills_before);
}

#[tokio::test]
async fn disabled_strategy_never_replaces() {
    let cluster = TestCluster::start().await;
    let spec = app("/svc").instances(1).build(); // Disabled by default in the builder.
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;
    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.confirm_all_running().await;
    cluster.settle().await;

    let task_id = cluster.driver.launched_task_ids()[0].clone();
    cluster
        .send_status(lost_status(
            &task_id,
            BusTaskReason::NetworkPartition,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;

    let spec_id: armada_core::spec::PathId = "/svc".parse().unwrap();
    let instances = cluster.scope.tracker().spec_instances(&spec_id);
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state.condition, Condition::Unreachable);

    // No replacement demand: a fresh offer is declined.
    cluster.send_offer(big_offer("o2", "node-2")).await;
    cluster.settle().await;
    assert_eq!(cluster.driver.launch_op_count(), 1);
}
