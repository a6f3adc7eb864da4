//! End-to-end launch flow: desired state in, launches out.

use std::time::Duration;

use armada_core::clock::Clock;
use armada_core::driver::{BusTaskState, OfferOperation};
use armada_core::instance::Condition;
use armada_test_utils::{app, big_offer, offer, task_status, TestCluster};

/// A three-instance app with two dynamic ports each launches fully from a
/// single sufficiently large offer.
#[tokio::test]
async fn basic_launch_fills_from_one_offer() {
    let cluster = TestCluster::start().await;
    let spec = app("/app")
        .instances(3)
        .resources(0.1, 32.0)
        .dynamic_ports(2)
        .build();

    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    let offer = offer("o1", "node-1")
        .cpus(4.0)
        .mem(1024.0)
        .ports(31000, 32000)
        .build();
    cluster.send_offer(offer).await;
    cluster.settle().await;

    // Three LAUNCH operations went out on the one offer.
    assert_eq!(cluster.driver.launch_op_count(), 3);
    assert!(cluster.driver.declines.lock().unwrap().is_empty());

    // All instances are staging with two host ports from the range.
    let spec_id = "/app".parse().unwrap();
    let instances = cluster.scope.tracker().spec_instances(&spec_id);
    assert_eq!(instances.len(), 3);
    for instance in &instances {
        assert_eq!(instance.state.condition, Condition::Staging);
        let task = instance.tasks.values().next().unwrap();
        assert_eq!(task.host_ports.len(), 2);
        for port in &task.host_ports {
            assert!((31000..=32000).contains(port), "port {port} out of range");
        }
    }

    // Running updates move each to Running; the tracker counts 3.
    cluster.confirm_all_running().await;
    cluster.settle().await;
    assert_eq!(cluster.scope.tracker().tasks_running(&spec_id), 3);

    // The start deployment drains once everything is ready.
    cluster.settle().await;
    assert!(cluster.scope.list_deployments().await.is_empty());
}

/// An offer that fits nothing is declined with the configured filter.
#[tokio::test]
async fn unusable_offer_is_declined() {
    let cluster = TestCluster::start().await;
    let spec = app("/app").instances(1).resources(8.0, 4096.0).build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    let small = offer("o1", "node-1").cpus(1.0).mem(256.0).build();
    cluster.send_offer(small).await;
    cluster.settle().await;

    assert_eq!(cluster.driver.launch_op_count(), 0);
    assert_eq!(cluster.driver.declines.lock().unwrap().len(), 1);
}

/// A crashed task is expunged, backed off, and relaunched from a later
/// offer; the queue surface reports the failure in between.
#[tokio::test]
async fn failed_task_is_replaced_after_backoff() {
    let cluster = TestCluster::start().await;
    let spec = app("/app")
        .instances(1)
        .backoff(Duration::from_secs(30), 2.0, Duration::from_secs(300))
        .build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.confirm_all_running().await;
    cluster.settle().await;

    let spec_id: armada_core::spec::PathId = "/app".parse().unwrap();
    assert_eq!(cluster.scope.tracker().tasks_running(&spec_id), 1);

    // The task dies.
    let task_id = cluster.driver.launched_task_ids()[0].clone();
    cluster
        .send_status(task_status(
            &task_id,
            BusTaskState::Failed,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;

    // The dead record is gone and the failure is on the queue surface.
    assert!(cluster
        .scope
        .tracker()
        .get(&task_id.instance_id)
        .is_none());
    let failure = cluster.scope.last_task_failure(&spec_id).await.unwrap();
    assert_eq!(failure.condition, Condition::Failed);

    // Inside the backoff window offers are not consumed for the spec.
    cluster.send_offer(big_offer("o2", "node-1")).await;
    cluster.settle().await;
    assert_eq!(cluster.driver.launch_op_count(), 1, "still only the first launch");

    // Past the backoff the replacement launches.
    cluster.clock.advance(Duration::from_secs(31));
    cluster.send_offer(big_offer("o3", "node-1")).await;
    cluster.settle().await;
    assert_eq!(cluster.driver.launch_op_count(), 2);
}

/// Killing with scale-down folds the removal into the declared count via a
/// scale deployment instead of relaunching.
#[tokio::test]
async fn kill_with_scale_reduces_declared_count() {
    let cluster = TestCluster::start().await;
    let spec = app("/app").instances(2).build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;
    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.confirm_all_running().await;
    cluster.settle().await;

    let spec_id: armada_core::spec::PathId = "/app".parse().unwrap();
    let victim = cluster.scope.tracker().spec_instances(&spec_id)[0].id.clone();

    cluster.clock.advance(Duration::from_secs(1));
    cluster
        .scope
        .kill_instances(vec![victim.clone()], true, false)
        .await
        .unwrap()
        .expect("scale kill returns a deployment");
    cluster.settle().await;

    // The declared count shrank in the desired tree.
    let root = cluster.scope.root_group();
    assert_eq!(root.find_run_spec(&spec_id).unwrap().instances, 1);

    // The scale supervisor kills one instance; confirm its termination.
    for task_id in cluster.driver.kills.lock().unwrap().iter() {
        assert_eq!(task_id.instance_id.run_spec_id, spec_id);
    }
}

/// Stray tasks of expunged instances get killed when they reappear.
#[tokio::test]
async fn stray_task_after_expunge_is_killed() {
    let cluster = TestCluster::start().await;
    let spec = app("/app").instances(1).build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;
    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.settle().await;

    let task_id = cluster.driver.launched_task_ids()[0].clone();
    cluster
        .scope
        .kill_instances(vec![task_id.instance_id.clone()], false, true)
        .await
        .unwrap();
    cluster.settle().await;
    cluster
        .send_status(task_status(
            &task_id,
            BusTaskState::Killed,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;
    assert!(cluster.scope.tracker().get(&task_id.instance_id).is_none());

    let kills_before = cluster.driver.kill_count();
    // The agent reports it running again after the record is gone.
    cluster
        .send_status(task_status(
            &task_id,
            BusTaskState::Running,
            cluster.clock.now(),
        ))
        .await;
    cluster.settle().await;
    assert!(cluster.driver.kill_count() > kills_before, "stray must be killed");
}

/// Revive goes out when demand appears; suppress once it drains.
#[tokio::test]
async fn revive_and_suppress_follow_demand() {
    let cluster = TestCluster::start().await;
    let spec = app("/app").instances(1).build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;
    assert!(*cluster.driver.revives.lock().unwrap() >= 1, "demand must revive offers");

    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.confirm_all_running().await;
    cluster.settle().await;
    assert!(*cluster.driver.suppresses.lock().unwrap() >= 1, "drained demand must suppress");
}

/// Unused operations sanity: accepted operations only reference offered
/// agents.
#[tokio::test]
async fn launches_reference_the_offering_agent() {
    let cluster = TestCluster::start().await;
    let spec = app("/app").instances(1).build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;
    cluster.send_offer(big_offer("o1", "node-7")).await;
    cluster.settle().await;

    let accepts = cluster.driver.accepts.lock().unwrap();
    let (_, operations) = &accepts[0];
    for op in operations {
        if let OfferOperation::Launch { tasks } = op {
            for task in tasks {
                assert_eq!(task.agent_id.0, "agent-node-7");
            }
        }
    }
}
