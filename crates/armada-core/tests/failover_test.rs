//! Leader failover: a new leader resumes half-applied work from the store.

use armada_test_utils::{app, offer, test_config, TestCluster};

/// A deployment interrupted mid-step resumes on the next leader; steps are
/// state goals, so the resumed step only launches what is still missing.
#[tokio::test]
async fn new_leader_resumes_deployment_from_stored_step() {
    let store;
    let clock;
    {
        let cluster = TestCluster::start().await;
        store = cluster.store.clone();
        clock = cluster.clock.clone();

        let spec = app("/web").instances(2).build();
        cluster.scope.upsert_run_spec(spec, false).await.unwrap();
        cluster.settle().await;

        // Capacity for exactly one instance: the start step stays incomplete.
        let one_slot = offer("o1", "node-1").cpus(0.1).mem(32.0).build();
        cluster.send_offer(one_slot).await;
        cluster.confirm_all_running().await;
        cluster.settle().await;

        let spec_id: armada_core::spec::PathId = "/web".parse().unwrap();
        assert_eq!(cluster.scope.tracker().tasks_running(&spec_id), 1);
        assert_eq!(cluster.scope.list_deployments().await.len(), 1);

        // The leader dies.
        cluster.scope.shut_down();
    }

    // A new leader elects over the same store.
    let successor = TestCluster::start_with(test_config(), store, clock).await;
    successor.settle().await;

    let spec_id: armada_core::spec::PathId = "/web".parse().unwrap();
    // Tracker state survived.
    assert_eq!(successor.scope.tracker().tasks_running(&spec_id), 1);
    // The half-applied plan resumed.
    assert_eq!(successor.scope.list_deployments().await.len(), 1);

    // The resumed step launches only the missing instance.
    successor
        .send_offer(offer("o2", "node-2").cpus(8.0).mem(4096.0).ports(31000, 32000).build())
        .await;
    successor.confirm_all_running().await;
    successor.settle().await;

    assert_eq!(successor.driver.launch_op_count(), 1);
    assert_eq!(successor.scope.tracker().tasks_running(&spec_id), 2);
    assert!(successor.scope.list_deployments().await.is_empty());
}

/// Without an owning deployment, a new leader converges plain capacity
/// shortfalls from the declared counts.
#[tokio::test]
async fn new_leader_converges_declared_counts() {
    let store;
    let clock;
    let spec_id: armada_core::spec::PathId = "/svc".parse().unwrap();
    {
        let cluster = TestCluster::start().await;
        store = cluster.store.clone();
        clock = cluster.clock.clone();

        let spec = app("/svc").instances(3).build();
        cluster.scope.upsert_run_spec(spec, false).await.unwrap();
        cluster.settle().await;
        cluster
            .send_offer(armada_test_utils::big_offer("o1", "node-1"))
            .await;
        cluster.confirm_all_running().await;
        cluster.settle().await;
        assert_eq!(cluster.scope.tracker().tasks_running(&spec_id), 3);
        assert!(cluster.scope.list_deployments().await.is_empty());

        // One instance's record vanishes out of band (simulated operator
        // surgery on the store), then the leader dies.
        let victim = cluster.scope.tracker().spec_instances(&spec_id)[0].clone();
        cluster
            .scope
            .tracker()
            .process(armada_core::instance::state_machine::InstanceOp::ForceExpunge {
                instance_id: victim.id,
            })
            .await
            .unwrap();
        cluster.scope.shut_down();
    }

    let successor = TestCluster::start_with(test_config(), store, clock).await;
    successor.settle().await;

    // The successor queues the missing launch straight from the tree.
    successor
        .send_offer(armada_test_utils::big_offer("o2", "node-2"))
        .await;
    successor.confirm_all_running().await;
    successor.settle().await;
    assert_eq!(successor.scope.tracker().tasks_running(&spec_id), 3);
}
