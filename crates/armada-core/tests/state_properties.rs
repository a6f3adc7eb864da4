//! Property tests for the instance state machine.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use armada_core::driver::{BusTaskState, BusTaskStatus};
use armada_core::instance::condition::{aggregate_health, resolve};
use armada_core::instance::state_machine::{process, Effect, InstanceOp};
use armada_core::instance::{
    AgentInfo, Condition, Goal, Instance, InstanceId, InstanceState, Task, TaskStatus,
};

fn ts(secs: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn any_condition() -> impl Strategy<Value = Condition> {
    prop::sample::select(vec![
        Condition::Scheduled,
        Condition::Provisioned,
        Condition::Reserved,
        Condition::Created,
        Condition::Staging,
        Condition::Starting,
        Condition::Running,
        Condition::Killing,
        Condition::Killed,
        Condition::Failed,
        Condition::Finished,
        Condition::Error,
        Condition::Gone,
        Condition::Dropped,
        Condition::Unreachable,
        Condition::Unknown,
    ])
}

fn instance_with(conditions: &[Condition], healthy: &[Option<bool>]) -> Instance {
    let id = InstanceId::new("/prop".parse().unwrap());
    let mut tasks = BTreeMap::new();
    for (index, condition) in conditions.iter().enumerate() {
        let task_id = id.task_id(&format!("c{index}"));
        tasks.insert(
            task_id.clone(),
            Task {
                id: task_id,
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: *condition,
                    staged_at: ts(0),
                    started_at: None,
                    healthy: healthy.get(index).copied().flatten(),
                    since: ts(0),
                },
            },
        );
    }
    let condition = resolve(tasks.values());
    let healthy = aggregate_health(tasks.values());
    Instance {
        id,
        run_spec_version: ts(0),
        agent: Some(AgentInfo {
            hostname: "node".into(),
            agent_id: None,
            attributes: Vec::new(),
        }),
        state: InstanceState {
            condition,
            since: ts(0),
            goal: Goal::Running,
            healthy,
        },
        tasks,
        reservation: None,
        unreachable_strategy: armada_core::spec::UnreachableStrategy::Disabled,
    }
}

proptest! {
    /// Resolution ignores task order.
    #[test]
    fn resolution_is_permutation_invariant(
        mut conditions in prop::collection::vec(any_condition(), 1..6)
    ) {
        let forward = instance_with(&conditions, &[]);
        conditions.reverse();
        let backward = instance_with(&conditions, &[]);
        prop_assert_eq!(
            resolve(forward.tasks.values()),
            resolve(backward.tasks.values())
        );
    }

    /// When every task shares an agreement-listed condition, the instance
    /// takes exactly that condition.
    #[test]
    fn unanimous_agreement_state_wins(
        condition in prop::sample::select(vec![
            Condition::Created,
            Condition::Reserved,
            Condition::Running,
            Condition::Finished,
            Condition::Killed,
        ]),
        count in 1usize..5
    ) {
        let conditions = vec![condition; count];
        let instance = instance_with(&conditions, &[]);
        prop_assert_eq!(instance.state.condition, condition);
    }

    /// The aggregate health flag is true only when every reporting task is
    /// healthy, and absent when nothing reports.
    #[test]
    fn health_aggregation_properties(
        reports in prop::collection::vec(prop::option::of(any::<bool>()), 0..5)
    ) {
        let conditions = vec![Condition::Running; reports.len()];
        let instance = instance_with(&conditions, &reports);
        let expected = if reports.iter().any(|r| *r == Some(false)) {
            Some(false)
        } else if reports.iter().any(|r| *r == Some(true)) {
            Some(true)
        } else {
            None
        };
        prop_assert_eq!(instance.state.healthy, expected);
    }

    /// Applying an op and then reverting to the prior snapshot restores
    /// the exact pre-op state with no events.
    #[test]
    fn revert_restores_pre_op_state(
        goal in prop::sample::select(vec![Goal::Stopped, Goal::Decommissioned]),
        conditions in prop::collection::vec(any_condition(), 1..4)
    ) {
        let original = instance_with(&conditions, &[]);
        let effect = process(
            Some(&original),
            InstanceOp::ChangeGoal {
                instance_id: original.id.clone(),
                goal,
                now: ts(5),
            },
        );
        // Only Update effects have a snapshot to revert; expunges remove
        // the record entirely and are reverted by re-creating it.
        if let Effect::Update { instance: updated, previous, .. } = effect {
            prop_assert_eq!(previous.as_ref(), Some(&original));
            let reverted = process(
                Some(&updated),
                InstanceOp::Revert { previous: original.clone() },
            );
            match reverted {
                Effect::Update { instance, events, .. } => {
                    prop_assert_eq!(instance, original);
                    prop_assert!(events.is_empty());
                }
                other => prop_assert!(false, "unexpected revert effect: {:?}", other),
            }
        }
    }

    /// A status update leaves the instance condition equal to the resolve
    /// function over its tasks (with the unreachable advance layered on
    /// top, which the default strategy does not trigger here).
    #[test]
    fn condition_is_always_derived_from_tasks(
        conditions in prop::collection::vec(any_condition(), 1..4),
        new_state in prop::sample::select(vec![
            BusTaskState::Staging,
            BusTaskState::Starting,
            BusTaskState::Running,
            BusTaskState::Killing,
            BusTaskState::Finished,
            BusTaskState::Failed,
            BusTaskState::Killed,
        ])
    ) {
        let original = instance_with(&conditions, &[]);
        let task_id = original.tasks.keys().next().unwrap().clone();
        let effect = process(
            Some(&original),
            InstanceOp::StatusUpdate {
                status: BusTaskStatus {
                    task_id,
                    state: new_state,
                    reason: None,
                    message: None,
                    healthy: None,
                    agent_id: None,
                    timestamp: ts(9),
                },
                now: ts(9),
            },
        );
        if let Effect::Update { instance, .. } = effect {
            prop_assert_eq!(instance.state.condition, resolve(instance.tasks.values()));
        }
    }
}
