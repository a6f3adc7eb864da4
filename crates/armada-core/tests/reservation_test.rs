//! Resident (reserved) instance lifecycle: reserve, launch, timeout,
//! cleanup of stranded reservations.

use std::time::Duration;

use armada_core::clock::Clock;
use armada_core::driver::{OfferOperation, OfferedResource, ReservationLabels, ResourceValue};
use armada_core::instance::{Condition, ReservationState};
use armada_core::reconcile::{scan_overdue, ReconcileConfig};
use armada_test_utils::{app, big_offer, offer, TestCluster};

fn reserved_resource(
    name: &str,
    role: &str,
    amount: f64,
    instance_id: &str,
) -> OfferedResource {
    OfferedResource {
        name: name.to_string(),
        role: role.to_string(),
        value: ResourceValue::Scalar(amount),
        reservation: Some(ReservationLabels {
            instance_id: Some(instance_id.to_string()),
        }),
        persistence_id: None,
    }
}

#[tokio::test]
async fn resident_app_reserves_then_launches_on_reserved_offer() {
    let cluster = TestCluster::start().await;
    let spec = app("/db")
        .instances(1)
        .role("db")
        .persistent_volume("data", 512)
        .build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    // Phase 1: a plain offer produces RESERVE + CREATE, not a launch.
    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.settle().await;

    let (reserve_ops, create_ops, launch_ops) = count_ops(&cluster);
    assert_eq!((reserve_ops, create_ops, launch_ops), (1, 1, 0));

    let spec_id: armada_core::spec::PathId = "/db".parse().unwrap();
    let instances = cluster.scope.tracker().spec_instances(&spec_id);
    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert_eq!(instance.state.condition, Condition::Reserved);
    let reservation = instance.reservation.as_ref().unwrap();
    assert!(matches!(reservation.state, ReservationState::New { deadline: Some(_) }));

    // Phase 2: the reserved resources come back in an offer labeled for
    // this instance; the launch happens on the reservation.
    let id_string = instance.id.to_string();
    let reserved_offer = offer("o2", "node-1")
        .resource(reserved_resource("cpus", "db", 2.0, &id_string))
        .resource(reserved_resource("mem", "db", 1024.0, &id_string))
        .resource(reserved_resource("disk", "db", 2048.0, &id_string))
        .build();
    cluster.send_offer(reserved_offer).await;
    cluster.settle().await;

    let (_, _, launch_ops) = count_ops(&cluster);
    assert_eq!(launch_ops, 1);
    let instance = cluster.scope.tracker().get(&instance.id).unwrap();
    assert_eq!(instance.state.condition, Condition::Staging);
    assert!(matches!(
        instance.reservation.as_ref().unwrap().state,
        ReservationState::Launched
    ));
}

#[tokio::test]
async fn reservation_timeout_expunges_and_releases() {
    let cluster = TestCluster::start().await;
    let spec = app("/db")
        .instances(1)
        .role("db")
        .persistent_volume("data", 256)
        .build();
    cluster.scope.upsert_run_spec(spec, false).await.unwrap();
    cluster.settle().await;

    cluster.send_offer(big_offer("o1", "node-1")).await;
    cluster.settle().await;

    let spec_id: armada_core::spec::PathId = "/db".parse().unwrap();
    let instance = cluster.scope.tracker().spec_instances(&spec_id)[0].clone();
    let id_string = instance.id.to_string();

    // The launch never happens; at the deadline the overdue loop triggers
    // the reservation timeout and the record is expunged.
    cluster.clock.advance(Duration::from_secs(120));
    let (candidates, _rx) = tokio::sync::mpsc::channel(16);
    scan_overdue(
        cluster.scope.tracker(),
        &candidates,
        &ReconcileConfig::default(),
        cluster.clock.now(),
    )
    .await;
    cluster.settle().await;
    assert!(cluster.scope.tracker().get(&instance.id).is_none());

    // The reserved resources resurface: they are unreserved and the
    // volumes destroyed.
    let stranded = offer("o2", "node-1")
        .resource(reserved_resource("cpus", "db", 2.0, &id_string))
        .resource(OfferedResource {
            name: "disk".to_string(),
            role: "db".to_string(),
            value: ResourceValue::Scalar(256.0),
            reservation: Some(ReservationLabels {
                instance_id: Some(id_string.clone()),
            }),
            persistence_id: Some(format!("data#{id_string}")),
        })
        .build();
    cluster.send_offer(stranded).await;
    cluster.settle().await;

    let accepts = cluster.driver.accepts.lock().unwrap();
    let (_, last_ops) = accepts.last().unwrap();
    assert!(last_ops.iter().any(|op| matches!(op, OfferOperation::Unreserve { .. })));
    assert!(last_ops
        .iter()
        .any(|op| matches!(op, OfferOperation::DestroyVolumes { .. })));
}

fn count_ops(cluster: &TestCluster) -> (usize, usize, usize) {
    let accepts = cluster.driver.accepts.lock().unwrap();
    let mut reserve = 0;
    let mut create = 0;
    let mut launch = 0;
    for (_, ops) in accepts.iter() {
        for op in ops {
            match op {
                OfferOperation::Reserve { .. } => reserve += 1,
                OfferOperation::CreateVolumes { .. } => create += 1,
                OfferOperation::Launch { .. } => launch += 1,
                _ => {}
            }
        }
    }
    (reserve, create, launch)
}
