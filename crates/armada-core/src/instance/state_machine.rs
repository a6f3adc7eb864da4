//! The instance state machine.
//!
//! `process(current, op)` is a pure function from an optional instance and
//! an update operation to an [`Effect`]. The tracker persists and publishes
//! the effect; nothing here touches the store or the bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::driver::{BusTaskState, BusTaskStatus};
use crate::events::Event;
use crate::instance::condition::{aggregate_health, resolve};
use crate::instance::{
    AgentInfo, Condition, Goal, Instance, InstanceId, Reservation, ReservationState, Task, TaskId,
};
use crate::spec::UnreachableStrategy;

/// Message fragments the bus uses when an agent has no record of a task
/// (older masters say "slave"). Such a task is gone for good no matter what
/// the reason field claims.
const UNKNOWN_TO_AGENT: [&str; 2] = ["unknown to the agent", "unknown to the slave"];

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// An update operation addressed at a single instance.
#[derive(Debug, Clone)]
pub enum InstanceOp {
    /// Create a fresh non-resident instance; illegal if the id exists.
    LaunchEphemeral { instance: Instance },
    /// Create a fresh reserved instance (resources reserved, not launched);
    /// illegal if the id exists.
    Reserve { instance: Instance },
    /// Launch tasks onto an existing reservation, re-arming it.
    LaunchOnReservation {
        instance_id: InstanceId,
        run_spec_version: DateTime<Utc>,
        agent: AgentInfo,
        tasks: BTreeMap<TaskId, Task>,
        now: DateTime<Utc>,
    },
    /// Apply a bus status update to the addressed task.
    StatusUpdate {
        status: BusTaskStatus,
        now: DateTime<Utc>,
    },
    /// The reservation's wait deadline passed.
    ReservationTimeout {
        instance_id: InstanceId,
        now: DateTime<Utc>,
    },
    /// Drop the instance no matter its state.
    ForceExpunge { instance_id: InstanceId },
    /// Change operator intent.
    ChangeGoal {
        instance_id: InstanceId,
        goal: Goal,
        now: DateTime<Utc>,
    },
    /// Restore a previous snapshot after a failed persistence.
    Revert { previous: Instance },
}

impl InstanceOp {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::LaunchEphemeral { instance } | Self::Reserve { instance } => &instance.id,
            Self::LaunchOnReservation { instance_id, .. }
            | Self::ReservationTimeout { instance_id, .. }
            | Self::ForceExpunge { instance_id }
            | Self::ChangeGoal { instance_id, .. } => instance_id,
            Self::StatusUpdate { status, .. } => &status.task_id.instance_id,
            Self::Revert { previous } => &previous.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// Outcome of applying an op. The tracker persists `Update`/`Expunge` before
/// publishing the attached events.
#[derive(Debug, Clone)]
pub enum Effect {
    Update {
        instance: Instance,
        previous: Option<Instance>,
        events: Vec<Event>,
    },
    Expunge {
        instance: Instance,
        events: Vec<Event>,
    },
    Noop {
        instance_id: InstanceId,
    },
    Failure {
        instance_id: InstanceId,
        reason: String,
    },
}

impl Effect {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

fn changed_event(instance: &Instance) -> Event {
    Event::InstanceChanged {
        id: instance.id.clone(),
        run_spec_id: instance.run_spec_id().clone(),
        run_spec_version: instance.run_spec_version,
        condition: instance.state.condition,
        goal: instance.state.goal,
    }
}

fn health_event(instance: &Instance) -> Event {
    Event::InstanceHealthChanged {
        id: instance.id.clone(),
        run_spec_id: instance.run_spec_id().clone(),
        healthy: instance.state.healthy,
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// Apply `op` to `current`. Pure; the caller owns persistence and fan-out.
pub fn process(current: Option<&Instance>, op: InstanceOp) -> Effect {
    match op {
        InstanceOp::LaunchEphemeral { instance } => create_fresh(current, instance, "launch"),
        InstanceOp::Reserve { instance } => {
            if instance.reservation.is_none() {
                return Effect::Failure {
                    instance_id: instance.id.clone(),
                    reason: "reserve op carries no reservation".to_string(),
                };
            }
            create_fresh(current, instance, "reserve")
        }
        InstanceOp::LaunchOnReservation {
            instance_id,
            run_spec_version,
            agent,
            tasks,
            now,
        } => launch_on_reservation(current, instance_id, run_spec_version, agent, tasks, now),
        InstanceOp::StatusUpdate { status, now } => status_update(current, status, now),
        InstanceOp::ReservationTimeout { instance_id, now: _ } => {
            reservation_timeout(current, instance_id)
        }
        InstanceOp::ForceExpunge { instance_id } => match current {
            Some(instance) => Effect::Expunge {
                instance: instance.clone(),
                events: vec![changed_event(instance)],
            },
            None => Effect::Noop { instance_id },
        },
        InstanceOp::ChangeGoal {
            instance_id,
            goal,
            now,
        } => change_goal(current, instance_id, goal, now),
        InstanceOp::Revert { previous } => Effect::Update {
            instance: previous,
            previous: None,
            events: Vec::new(),
        },
    }
}

fn create_fresh(current: Option<&Instance>, instance: Instance, what: &str) -> Effect {
    if let Some(existing) = current {
        return Effect::Failure {
            instance_id: existing.id.clone(),
            reason: format!("cannot {what}: instance already exists"),
        };
    }
    let events = vec![changed_event(&instance)];
    Effect::Update {
        instance,
        previous: None,
        events,
    }
}

fn launch_on_reservation(
    current: Option<&Instance>,
    instance_id: InstanceId,
    run_spec_version: DateTime<Utc>,
    agent: AgentInfo,
    tasks: BTreeMap<TaskId, Task>,
    now: DateTime<Utc>,
) -> Effect {
    let Some(existing) = current else {
        return Effect::Failure {
            instance_id,
            reason: "cannot launch on reservation: instance not found".to_string(),
        };
    };
    let Some(reservation) = &existing.reservation else {
        return Effect::Failure {
            instance_id,
            reason: "cannot launch on reservation: instance holds no reservation".to_string(),
        };
    };
    // Legal for the whole has-reservation family: a New reservation awaiting
    // first launch, or a Suspended one after its tasks terminated. A
    // Launched reservation still has live tasks.
    if matches!(reservation.state, ReservationState::Launched) && !existing.all_tasks_terminal() {
        return Effect::Failure {
            instance_id,
            reason: "cannot launch on reservation: tasks still present".to_string(),
        };
    }

    let mut updated = existing.clone();
    updated.run_spec_version = run_spec_version;
    updated.agent = Some(agent);
    updated.tasks = tasks;
    updated.reservation = Some(Reservation {
        volume_ids: reservation.volume_ids.clone(),
        state: ReservationState::Launched,
    });
    updated.state.goal = Goal::Running;
    updated.state.condition = resolve(updated.tasks.values());
    updated.state.since = now;
    updated.state.healthy = aggregate_health(updated.tasks.values());

    let events = vec![changed_event(&updated)];
    Effect::Update {
        instance: updated,
        previous: Some(existing.clone()),
        events,
    }
}

fn reservation_timeout(current: Option<&Instance>, instance_id: InstanceId) -> Effect {
    let Some(existing) = current else {
        return Effect::Failure {
            instance_id,
            reason: "reservation timeout for unknown instance".to_string(),
        };
    };
    match &existing.reservation {
        Some(reservation)
            if matches!(
                reservation.state,
                ReservationState::New { .. } | ReservationState::Suspended { .. }
            ) =>
        {
            Effect::Expunge {
                instance: existing.clone(),
                events: vec![changed_event(existing)],
            }
        }
        _ => Effect::Failure {
            instance_id,
            reason: "reservation timeout on instance without a waiting reservation".to_string(),
        },
    }
}

fn change_goal(
    current: Option<&Instance>,
    instance_id: InstanceId,
    goal: Goal,
    now: DateTime<Utc>,
) -> Effect {
    let Some(existing) = current else {
        return Effect::Failure {
            instance_id,
            reason: "cannot change goal of unknown instance".to_string(),
        };
    };
    if existing.state.goal == goal {
        return Effect::Noop {
            instance_id: existing.id.clone(),
        };
    }
    let mut updated = existing.clone();
    updated.state.goal = goal;
    updated.state.since = now;

    if goal == Goal::Decommissioned && updated.all_tasks_terminal() {
        return Effect::Expunge {
            instance: updated.clone(),
            events: vec![changed_event(&updated)],
        };
    }
    let events = vec![changed_event(&updated)];
    Effect::Update {
        instance: updated,
        previous: Some(existing.clone()),
        events,
    }
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

/// How a bus state maps onto a task condition, given reason and message.
fn condition_for_status(status: &BusTaskStatus) -> Condition {
    match status.state {
        BusTaskState::Staging => Condition::Staging,
        BusTaskState::Starting => Condition::Starting,
        BusTaskState::Running => Condition::Running,
        BusTaskState::Killing => Condition::Killing,
        BusTaskState::Finished => Condition::Finished,
        BusTaskState::Failed => Condition::Failed,
        BusTaskState::Killed => Condition::Killed,
        BusTaskState::Error => Condition::Error,
        BusTaskState::Dropped => Condition::Dropped,
        BusTaskState::Gone | BusTaskState::GoneByOperator => Condition::Gone,
        BusTaskState::Unreachable => Condition::Unreachable,
        BusTaskState::Unknown => Condition::Unknown,
        BusTaskState::Lost => {
            let recoverable = status.reason.map(|r| r.is_recoverable()).unwrap_or(false);
            if recoverable {
                Condition::Unreachable
            } else {
                Condition::Gone
            }
        }
    }
}

fn is_unknown_to_agent(status: &BusTaskStatus) -> bool {
    status
        .message
        .as_deref()
        .map(|m| {
            let lowered = m.to_ascii_lowercase();
            UNKNOWN_TO_AGENT.iter().any(|f| lowered.contains(f))
        })
        .unwrap_or(false)
}

/// Whether a status must expunge the instance outright, reservation or not.
fn forces_expunge(status: &BusTaskStatus) -> bool {
    // The agent has no record of the task: nothing to recover, local
    // volumes included.
    (status.state == BusTaskState::Lost || status.state == BusTaskState::Unknown)
        && is_unknown_to_agent(status)
}

fn status_update(current: Option<&Instance>, status: BusTaskStatus, now: DateTime<Utc>) -> Effect {
    let instance_id = status.task_id.instance_id.clone();
    let Some(existing) = current else {
        return Effect::Failure {
            instance_id,
            reason: format!("status update for unknown instance (task {})", status.task_id),
        };
    };
    if !existing.tasks.contains_key(&status.task_id) {
        return Effect::Failure {
            instance_id,
            reason: format!("status update for unknown task {}", status.task_id),
        };
    }

    let mut updated = existing.clone();
    let new_condition = condition_for_status(&status);
    {
        let task = updated
            .tasks
            .get_mut(&status.task_id)
            .expect("task presence checked above");
        if task.status.condition != new_condition {
            task.status.since = status.timestamp;
        }
        task.status.condition = new_condition;
        if new_condition == Condition::Running && task.status.started_at.is_none() {
            task.status.started_at = Some(status.timestamp);
        }
        if status.healthy.is_some() {
            task.status.healthy = status.healthy;
        }
    }

    let was_condition = existing.state.condition;
    let was_healthy = existing.state.healthy;

    let mut resolved = resolve(updated.tasks.values());
    resolved = advance_unreachable(&updated, resolved, was_condition, existing.state.since, now);

    if resolved != was_condition {
        updated.state.since = now;
    }
    updated.state.condition = resolved;
    updated.state.healthy = aggregate_health(updated.tasks.values());

    let mut events = Vec::new();
    if resolved != was_condition {
        events.push(changed_event(&updated));
    }
    if updated.state.healthy != was_healthy {
        events.push(health_event(&updated));
    }

    // An agent that has forgotten the task cannot bring it back; drop the
    // record and any reservation with it.
    if forces_expunge(&status) {
        return Effect::Expunge {
            instance: updated.clone(),
            events: if events.is_empty() {
                vec![changed_event(&updated)]
            } else {
                events
            },
        };
    }

    let permanently_lost = status.state == BusTaskState::Lost
        && !status.reason.map(|r| r.is_recoverable()).unwrap_or(false);
    let gone_by_operator = status.state == BusTaskState::GoneByOperator;

    match &existing.reservation {
        None => {
            if (permanently_lost || resolved == Condition::Gone) && updated.all_tasks_terminal() {
                return Effect::Expunge {
                    instance: updated,
                    events,
                };
            }
            if updated.all_tasks_terminal() && updated.state.goal == Goal::Decommissioned {
                return Effect::Expunge {
                    instance: updated,
                    events,
                };
            }
        }
        Some(reservation) => {
            if gone_by_operator {
                // The operator removed the agent; the reservation is
                // unrecoverable and the record goes with it.
                return Effect::Expunge {
                    instance: updated,
                    events,
                };
            }
            if updated.all_tasks_terminal() {
                if updated.state.goal == Goal::Decommissioned {
                    return Effect::Expunge {
                        instance: updated,
                        events,
                    };
                }
                // Resident instance out of tasks: park the reservation.
                updated.reservation = Some(Reservation {
                    volume_ids: reservation.volume_ids.clone(),
                    state: ReservationState::Suspended { deadline: None },
                });
            }
        }
    }

    if events.is_empty() && updated == *existing {
        return Effect::Noop {
            instance_id: existing.id.clone(),
        };
    }

    Effect::Update {
        instance: updated,
        previous: Some(existing.clone()),
        events,
    }
}

/// Promote `Unreachable` to `UnreachableInactive` once the strategy's
/// inactive-after window has elapsed. The expunge-after escalation is driven
/// by the overdue loop issuing a `ForceExpunge`.
fn advance_unreachable(
    instance: &Instance,
    resolved: Condition,
    was_condition: Condition,
    was_since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Condition {
    if resolved != Condition::Unreachable {
        return resolved;
    }
    let UnreachableStrategy::Enabled { inactive_after, .. } = instance.unreachable_strategy else {
        return resolved;
    };
    // Keep an already-inactive instance inactive.
    if was_condition == Condition::UnreachableInactive {
        return Condition::UnreachableInactive;
    }
    let unreachable_since = if was_condition == Condition::Unreachable {
        was_since
    } else {
        now
    };
    let elapsed = (now - unreachable_since).to_std().unwrap_or_default();
    if elapsed >= inactive_after {
        Condition::UnreachableInactive
    } else {
        Condition::Unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AgentId, BusTaskReason};
    use crate::instance::{InstanceState, TaskStatus};
    use crate::spec::path::PathId;
    use chrono::TimeZone;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn path(s: &str) -> PathId {
        s.parse().unwrap()
    }

    fn agent() -> AgentInfo {
        AgentInfo {
            hostname: "node-1".into(),
            agent_id: Some("agent-1".into()),
            attributes: Vec::new(),
        }
    }

    fn fresh_instance(spec_path: &str, containers: &[&str], now: DateTime<Utc>) -> Instance {
        let id = InstanceId::new(path(spec_path));
        let mut tasks = BTreeMap::new();
        for container in containers {
            let task_id = id.task_id(container);
            tasks.insert(
                task_id.clone(),
                Task {
                    id: task_id,
                    host_ports: Vec::new(),
                    status: TaskStatus {
                        condition: Condition::Staging,
                        staged_at: now,
                        started_at: None,
                        healthy: None,
                        since: now,
                    },
                },
            );
        }
        let condition = resolve(tasks.values());
        Instance {
            id,
            run_spec_version: now,
            agent: Some(agent()),
            state: InstanceState {
                condition,
                since: now,
                goal: Goal::Running,
                healthy: None,
            },
            tasks,
            reservation: None,
            unreachable_strategy: UnreachableStrategy::Disabled,
        }
    }

    fn reserved_instance(spec_path: &str, deadline: Option<DateTime<Utc>>) -> Instance {
        let id = InstanceId::new(path(spec_path));
        Instance {
            id,
            run_spec_version: ts(0),
            agent: Some(agent()),
            state: InstanceState {
                condition: Condition::Reserved,
                since: ts(0),
                goal: Goal::Stopped,
                healthy: None,
            },
            tasks: BTreeMap::new(),
            reservation: Some(Reservation {
                volume_ids: vec!["vol-1".into()],
                state: ReservationState::New { deadline },
            }),
            unreachable_strategy: UnreachableStrategy::Disabled,
        }
    }

    fn status(task_id: &TaskId, state: BusTaskState, at: DateTime<Utc>) -> BusTaskStatus {
        BusTaskStatus {
            task_id: task_id.clone(),
            state,
            reason: None,
            message: None,
            healthy: None,
            agent_id: Some(AgentId("agent-1".into())),
            timestamp: at,
        }
    }

    fn first_task_id(instance: &Instance) -> TaskId {
        instance.tasks.keys().next().unwrap().clone()
    }

    // -- creation ops --

    #[test]
    fn launch_ephemeral_on_absent_creates() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(None, InstanceOp::LaunchEphemeral { instance: instance.clone() });
        match effect {
            Effect::Update { instance: created, previous, events } => {
                assert_eq!(created.state.condition, Condition::Staging);
                assert!(previous.is_none());
                assert_eq!(events.len(), 1);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn launch_ephemeral_on_existing_fails() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&instance),
            InstanceOp::LaunchEphemeral { instance: instance.clone() },
        );
        assert!(effect.is_failure());
    }

    #[test]
    fn reserve_requires_reservation_payload() {
        let instance = fresh_instance("/db", &["main"], ts(0));
        let effect = process(None, InstanceOp::Reserve { instance });
        assert!(effect.is_failure());

        let reserved = reserved_instance("/db", None);
        let effect = process(None, InstanceOp::Reserve { instance: reserved });
        assert!(matches!(effect, Effect::Update { .. }));
    }

    // -- launch on reservation --

    #[test]
    fn launch_on_new_reservation_rearms_to_launched() {
        let reserved = reserved_instance("/db", Some(ts(120)));
        let task_id = reserved.id.task_id("main");
        let mut tasks = BTreeMap::new();
        tasks.insert(
            task_id.clone(),
            Task {
                id: task_id,
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Staging,
                    staged_at: ts(10),
                    started_at: None,
                    healthy: None,
                    since: ts(10),
                },
            },
        );
        let effect = process(
            Some(&reserved),
            InstanceOp::LaunchOnReservation {
                instance_id: reserved.id.clone(),
                run_spec_version: ts(5),
                agent: agent(),
                tasks,
                now: ts(10),
            },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.state.condition, Condition::Staging);
                assert_eq!(instance.state.goal, Goal::Running);
                assert!(matches!(
                    instance.reservation.as_ref().unwrap().state,
                    ReservationState::Launched
                ));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn launch_on_suspended_reservation_is_legal() {
        let mut suspended = reserved_instance("/db", None);
        suspended.reservation = Some(Reservation {
            volume_ids: vec!["vol-1".into()],
            state: ReservationState::Suspended { deadline: None },
        });
        let task_id = suspended.id.task_id("main");
        let mut tasks = BTreeMap::new();
        tasks.insert(
            task_id.clone(),
            Task {
                id: task_id,
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Staging,
                    staged_at: ts(10),
                    started_at: None,
                    healthy: None,
                    since: ts(10),
                },
            },
        );
        let effect = process(
            Some(&suspended),
            InstanceOp::LaunchOnReservation {
                instance_id: suspended.id.clone(),
                run_spec_version: ts(5),
                agent: agent(),
                tasks,
                now: ts(10),
            },
        );
        assert!(matches!(effect, Effect::Update { .. }));
    }

    #[test]
    fn launch_on_missing_reservation_fails() {
        let ephemeral = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&ephemeral),
            InstanceOp::LaunchOnReservation {
                instance_id: ephemeral.id.clone(),
                run_spec_version: ts(1),
                agent: agent(),
                tasks: BTreeMap::new(),
                now: ts(1),
            },
        );
        assert!(effect.is_failure());
    }

    // -- status updates --

    #[test]
    fn running_update_moves_instance_to_running() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let task_id = first_task_id(&instance);
        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate {
                status: status(&task_id, BusTaskState::Running, ts(5)),
                now: ts(5),
            },
        );
        match effect {
            Effect::Update { instance, events, .. } => {
                assert_eq!(instance.state.condition, Condition::Running);
                let task = instance.tasks.values().next().unwrap();
                assert_eq!(task.status.started_at, Some(ts(5)));
                assert!(events
                    .iter()
                    .any(|e| matches!(e, Event::InstanceChanged { condition: Condition::Running, .. })));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn pod_instance_runs_only_when_all_containers_run() {
        let instance = fresh_instance("/pod", &["main", "sidecar"], ts(0));
        let main_id = instance.id.task_id("main");
        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate {
                status: status(&main_id, BusTaskState::Running, ts(5)),
                now: ts(5),
            },
        );
        match effect {
            Effect::Update { instance, .. } => {
                // The sidecar still stages, so the instance is not running.
                assert_eq!(instance.state.condition, Condition::Staging);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn health_report_feeds_aggregate_flag() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let task_id = first_task_id(&instance);
        let mut healthy_status = status(&task_id, BusTaskState::Running, ts(5));
        healthy_status.healthy = Some(true);
        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate {
                status: healthy_status,
                now: ts(5),
            },
        );
        match effect {
            Effect::Update { instance, events, .. } => {
                assert_eq!(instance.state.healthy, Some(true));
                assert!(events
                    .iter()
                    .any(|e| matches!(e, Event::InstanceHealthChanged { healthy: Some(true), .. })));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_task_fails_the_op() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let other = InstanceId::new(path("/web")).task_id("main");
        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate {
                status: status(&other, BusTaskState::Running, ts(5)),
                now: ts(5),
            },
        );
        assert!(effect.is_failure());
    }

    // -- lost-task semantics --

    #[test]
    fn recoverable_lost_maps_to_unreachable() {
        let mut instance = fresh_instance("/web", &["main"], ts(0));
        instance.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after: Duration::from_secs(60),
            expunge_after: Duration::from_secs(3600),
        };
        let task_id = first_task_id(&instance);
        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::AgentDisconnected);

        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate { status: lost, now: ts(10) },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.state.condition, Condition::Unreachable);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn permanent_lost_expunges_ephemeral() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let task_id = first_task_id(&instance);
        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::CommandExecutorFailed);

        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate { status: lost, now: ts(10) },
        );
        assert!(matches!(effect, Effect::Expunge { .. }));
    }

    #[test]
    fn permanent_lost_suspends_reservation_instead_of_expunge() {
        let reserved = reserved_instance("/db", None);
        let task_id = reserved.id.task_id("main");
        let mut with_task = reserved.clone();
        with_task.reservation = Some(Reservation {
            volume_ids: vec!["vol-1".into()],
            state: ReservationState::Launched,
        });
        with_task.tasks.insert(
            task_id.clone(),
            Task {
                id: task_id.clone(),
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Running,
                    staged_at: ts(1),
                    started_at: Some(ts(2)),
                    healthy: None,
                    since: ts(2),
                },
            },
        );
        with_task.state.condition = Condition::Running;
        with_task.state.goal = Goal::Running;

        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::ExecutorTerminated);

        let effect = process(
            Some(&with_task),
            InstanceOp::StatusUpdate { status: lost, now: ts(10) },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert!(matches!(
                    instance.reservation.as_ref().unwrap().state,
                    ReservationState::Suspended { .. }
                ));
                assert_eq!(instance.state.condition, Condition::Gone);
            }
            other => panic!("expected update (suspension), got {other:?}"),
        }
    }

    #[test]
    fn gone_by_operator_abandons_reservation() {
        let reserved = reserved_instance("/db", None);
        let task_id = reserved.id.task_id("main");
        let mut with_task = reserved.clone();
        with_task.tasks.insert(
            task_id.clone(),
            Task {
                id: task_id.clone(),
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Running,
                    staged_at: ts(1),
                    started_at: Some(ts(2)),
                    healthy: None,
                    since: ts(2),
                },
            },
        );

        let effect = process(
            Some(&with_task),
            InstanceOp::StatusUpdate {
                status: status(&task_id, BusTaskState::GoneByOperator, ts(10)),
                now: ts(10),
            },
        );
        assert!(matches!(effect, Effect::Expunge { .. }));
    }

    #[test]
    fn unknown_to_agent_message_always_expunges() {
        let reserved = reserved_instance("/db", None);
        let task_id = reserved.id.task_id("main");
        let mut with_task = reserved.clone();
        with_task.tasks.insert(
            task_id.clone(),
            Task {
                id: task_id.clone(),
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Running,
                    staged_at: ts(1),
                    started_at: Some(ts(2)),
                    healthy: None,
                    since: ts(2),
                },
            },
        );

        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::Reconciliation);
        lost.message = Some("Task is unknown to the agent".to_string());

        let effect = process(
            Some(&with_task),
            InstanceOp::StatusUpdate { status: lost, now: ts(10) },
        );
        assert!(
            matches!(effect, Effect::Expunge { .. }),
            "reserved instance must still expunge when the agent forgot the task"
        );
    }

    // -- unreachable advance --

    #[test]
    fn unreachable_advances_to_inactive_after_window() {
        let mut instance = fresh_instance("/web", &["main"], ts(0));
        instance.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after: Duration::from_secs(60),
            expunge_after: Duration::from_secs(3600),
        };
        let task_id = first_task_id(&instance);

        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::AgentDisconnected);
        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate { status: lost.clone(), now: ts(10) },
        );
        let after_first = match effect {
            Effect::Update { instance, .. } => instance,
            other => panic!("expected update, got {other:?}"),
        };
        assert_eq!(after_first.state.condition, Condition::Unreachable);

        // Reconciliation re-delivers the unreachable status 65 seconds in.
        let effect = process(
            Some(&after_first),
            InstanceOp::StatusUpdate { status: lost, now: ts(75) },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.state.condition, Condition::UnreachableInactive);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn zero_inactive_window_goes_inactive_immediately() {
        let mut instance = fresh_instance("/web", &["main"], ts(0));
        instance.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after: Duration::ZERO,
            expunge_after: Duration::ZERO,
        };
        let task_id = first_task_id(&instance);
        let mut lost = status(&task_id, BusTaskState::Lost, ts(10));
        lost.reason = Some(BusTaskReason::NetworkPartition);

        let effect = process(
            Some(&instance),
            InstanceOp::StatusUpdate { status: lost, now: ts(10) },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.state.condition, Condition::UnreachableInactive);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    // -- reservation timeout / force expunge / goals --

    #[test]
    fn reservation_timeout_expunges_waiting_reservation() {
        let reserved = reserved_instance("/db", Some(ts(120)));
        let effect = process(
            Some(&reserved),
            InstanceOp::ReservationTimeout {
                instance_id: reserved.id.clone(),
                now: ts(121),
            },
        );
        assert!(matches!(effect, Effect::Expunge { .. }));
    }

    #[test]
    fn reservation_timeout_on_ephemeral_fails() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&instance),
            InstanceOp::ReservationTimeout {
                instance_id: instance.id.clone(),
                now: ts(1),
            },
        );
        assert!(effect.is_failure());
    }

    #[test]
    fn force_expunge_always_expunges() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&instance),
            InstanceOp::ForceExpunge { instance_id: instance.id.clone() },
        );
        assert!(matches!(effect, Effect::Expunge { .. }));

        let absent = InstanceId::new(path("/web"));
        let effect = process(None, InstanceOp::ForceExpunge { instance_id: absent });
        assert!(matches!(effect, Effect::Noop { .. }));
    }

    #[test]
    fn change_goal_to_decommissioned_expunges_terminal_instance() {
        let mut instance = fresh_instance("/web", &["main"], ts(0));
        for task in instance.tasks.values_mut() {
            task.status.condition = Condition::Killed;
        }
        instance.state.condition = resolve(instance.tasks.values());

        let effect = process(
            Some(&instance),
            InstanceOp::ChangeGoal {
                instance_id: instance.id.clone(),
                goal: Goal::Decommissioned,
                now: ts(9),
            },
        );
        assert!(matches!(effect, Effect::Expunge { .. }));
    }

    #[test]
    fn change_goal_on_live_instance_updates() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&instance),
            InstanceOp::ChangeGoal {
                instance_id: instance.id.clone(),
                goal: Goal::Decommissioned,
                now: ts(9),
            },
        );
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.state.goal, Goal::Decommissioned);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn change_goal_to_same_goal_is_noop() {
        let instance = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&instance),
            InstanceOp::ChangeGoal {
                instance_id: instance.id.clone(),
                goal: Goal::Running,
                now: ts(9),
            },
        );
        assert!(matches!(effect, Effect::Noop { .. }));
    }

    // -- revert --

    #[test]
    fn revert_restores_previous_snapshot_without_events() {
        let before = fresh_instance("/web", &["main"], ts(0));
        let effect = process(
            Some(&before),
            InstanceOp::Revert { previous: before.clone() },
        );
        match effect {
            Effect::Update { instance, events, .. } => {
                assert_eq!(instance, before);
                assert!(events.is_empty());
            }
            other => panic!("expected update, got {other:?}"),
        }
    }
}
