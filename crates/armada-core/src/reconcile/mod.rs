//! Overdue detection and task reconciliation.
//!
//! Two cooperating loops. The overdue scanner ticks over the tracker
//! snapshot: tasks stuck before Running past the launch-confirm timeout
//! become reconcile candidates, expired reservation deadlines go through
//! the state machine, and unreachable instances past their expunge window
//! are dropped. The reconciliation tracker batches candidates into
//! reconcile requests, counts attempts per instance, and hands instances
//! that stay silent past the attempt limit to the kill service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::driver::SchedulerDriver;
use crate::instance::state_machine::InstanceOp;
use crate::instance::{Condition, Instance, InstanceId};
use crate::kill::{KillReason, KillServiceHandle};
use crate::spec::UnreachableStrategy;
use crate::tracker::{InstanceUpdate, TrackerHandle};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Overdue scan period.
    pub overdue_interval: Duration,
    /// A task must leave Created/Staging/Starting within this window.
    pub task_launch_confirm_timeout: Duration,
    /// Reconcile-request batching period.
    pub reconciliation_interval: Duration,
    /// Reconcile attempts per instance before escalation to a kill.
    pub max_reconciliations: u32,
    /// Bound on buffered candidates; the scanner blocks beyond it.
    pub candidate_buffer: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            overdue_interval: Duration::from_secs(30),
            task_launch_confirm_timeout: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(60),
            max_reconciliations: 3,
            candidate_buffer: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Overdue scanner
// ---------------------------------------------------------------------------

/// Conditions before the first Running confirmation.
fn is_unconfirmed(condition: Condition) -> bool {
    matches!(
        condition,
        Condition::Created | Condition::Staging | Condition::Starting
    )
}

fn unreachable_expunge_due(instance: &Instance, now: DateTime<Utc>) -> bool {
    if !instance.state.condition.is_unreachable() {
        return false;
    }
    let UnreachableStrategy::Enabled { expunge_after, .. } = instance.unreachable_strategy else {
        return false;
    };
    let elapsed = (now - instance.state.since).to_std().unwrap_or_default();
    elapsed >= expunge_after
}

/// One scan pass; factored out for tests.
pub async fn scan_overdue(
    tracker: &TrackerHandle,
    candidates: &mpsc::Sender<InstanceId>,
    config: &ReconcileConfig,
    now: DateTime<Utc>,
) {
    let snapshot = tracker.snapshot();
    let confirm = chrono::Duration::from_std(config.task_launch_confirm_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));

    for instances in snapshot.values() {
        for instance in instances.values() {
            // Reservation deadlines.
            if let Some(reservation) = &instance.reservation {
                if let Some(deadline) = reservation.state.deadline() {
                    if deadline <= now {
                        tracing::info!(instance_id = %instance.id, "reservation timed out");
                        if let Err(e) = tracker
                            .process(InstanceOp::ReservationTimeout {
                                instance_id: instance.id.clone(),
                                now,
                            })
                            .await
                        {
                            tracing::error!(instance_id = %instance.id, error = %e, "reservation timeout op failed");
                        }
                        continue;
                    }
                }
            }

            // Unreachable instances past their expunge window.
            if unreachable_expunge_due(instance, now) {
                tracing::info!(instance_id = %instance.id, "unreachable past expunge window");
                if let Err(e) = tracker
                    .process(InstanceOp::ForceExpunge {
                        instance_id: instance.id.clone(),
                    })
                    .await
                {
                    tracing::error!(instance_id = %instance.id, error = %e, "unreachable expunge failed");
                }
                continue;
            }

            // Unconfirmed launches past the confirm timeout.
            let overdue = instance
                .tasks
                .values()
                .any(|t| is_unconfirmed(t.status.condition) && t.status.staged_at + confirm <= now);
            if overdue {
                // Blocks when the reconciliation tracker is saturated;
                // backpressure instead of an unbounded backlog.
                let _ = candidates.send(instance.id.clone()).await;
            }
        }
    }
}

/// Spawn the periodic overdue scanner.
pub fn spawn_overdue_loop(
    tracker: TrackerHandle,
    candidates: mpsc::Sender<InstanceId>,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.overdue_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    scan_overdue(&tracker, &candidates, &config, clock.now()).await;
                }
            }
        }
        tracing::debug!("overdue loop stopped");
    })
}

// ---------------------------------------------------------------------------
// Reconciliation tracker
// ---------------------------------------------------------------------------

/// Pure attempt-counting core of the reconciliation stage.
#[derive(Debug, Default)]
pub struct ReconciliationLedger {
    entries: HashMap<InstanceId, u32>,
}

impl ReconciliationLedger {
    pub fn insert(&mut self, id: InstanceId) {
        self.entries.entry(id).or_insert(0);
    }

    /// Split into (instances to reconcile this tick, instances past the
    /// limit to escalate). Attempts increment for the reconciled set;
    /// escalated entries are removed.
    pub fn tick(&mut self, max_attempts: u32) -> (Vec<InstanceId>, Vec<InstanceId>) {
        let mut reconcile = Vec::new();
        let mut escalate = Vec::new();
        for (id, attempts) in &mut self.entries {
            if *attempts < max_attempts {
                *attempts += 1;
                reconcile.push(id.clone());
            } else {
                escalate.push(id.clone());
            }
        }
        for id in &escalate {
            self.entries.remove(id);
        }
        reconcile.sort();
        escalate.sort();
        (reconcile, escalate)
    }

    /// A status update arrived for a tracked instance. Staging resets the
    /// attempt count (an image pull can be long); anything else resolves
    /// the entry.
    pub fn on_status(&mut self, id: &InstanceId, condition: Condition) {
        if condition == Condition::Staging {
            if let Some(attempts) = self.entries.get_mut(id) {
                *attempts = 0;
            }
        } else {
            self.entries.remove(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Spawn the reconciliation tracker stage. Returns the candidate sender
/// (bounded by `config.candidate_buffer`) and a demand signal for the
/// revive signaller.
pub fn spawn_reconciliation_tracker(
    tracker: TrackerHandle,
    driver: Arc<dyn SchedulerDriver>,
    kill: KillServiceHandle,
    config: ReconcileConfig,
    cancel: CancellationToken,
) -> (mpsc::Sender<InstanceId>, watch::Receiver<bool>) {
    let (candidates_tx, mut candidates_rx) = mpsc::channel::<InstanceId>(config.candidate_buffer);
    let (demand_tx, demand_rx) = watch::channel(false);
    let mut updates = tracker.updates();

    tokio::spawn(async move {
        let mut ledger = ReconciliationLedger::default();
        let mut tick = tokio::time::interval(config.reconciliation_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                candidate = candidates_rx.recv() => {
                    match candidate {
                        Some(id) => ledger.insert(id),
                        None => break,
                    }
                }
                update = updates.recv() => {
                    match update {
                        Ok(InstanceUpdate::Updated { instance }) => {
                            ledger.on_status(&instance.id, instance.state.condition);
                        }
                        Ok(InstanceUpdate::Expunged { instance }) => {
                            ledger.on_status(&instance.id, instance.state.condition);
                            // Expunged records resolve regardless of state.
                            ledger.entries.remove(&instance.id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "reconciliation lagged behind tracker updates");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    let (reconcile, escalate) = ledger.tick(config.max_reconciliations);

                    if !reconcile.is_empty() {
                        let task_ids: Vec<_> = reconcile
                            .iter()
                            .filter_map(|id| tracker.get(id))
                            .flat_map(|i| i.tasks.keys().cloned().collect::<Vec<_>>())
                            .collect();
                        tracing::info!(instances = reconcile.len(), tasks = task_ids.len(), "requesting reconciliation");
                        if let Err(e) = driver.reconcile_tasks(task_ids).await {
                            tracing::warn!(error = %e, "reconcile request failed");
                        }
                    }

                    for id in escalate {
                        tracing::warn!(
                            instance_id = %id,
                            attempts = config.max_reconciliations,
                            "reconciliation exhausted, killing instance"
                        );
                        if let Some(instance) = tracker.get(&id) {
                            kill.kill(vec![instance], KillReason::OverdueTask).await;
                        }
                    }
                }
            }
            let _ = demand_tx.send(!ledger.is_empty());
        }
        tracing::debug!("reconciliation tracker stopped");
    });

    (candidates_tx, demand_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::instance::{
        AgentInfo, Goal, InstanceState, Reservation, ReservationState, Task, TaskStatus,
    };
    use crate::tracker::InstanceTracker;
    use armada_store::{MemoryStore, Repository, RetryPolicy};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    const ROOT: &str = "/armada/state";

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn tracker_with(clock: &ManualClock) -> TrackerHandle {
        let store = MemoryStore::new();
        InstanceTracker::load(
            Repository::new(Arc::new(store), ROOT),
            EventBus::new(),
            RetryPolicy::default(),
        )
        .await
        .unwrap()
        .spawn(Arc::new(clock.clone()))
    }

    fn instance_with_condition(spec: &str, condition: Condition, staged_at: i64) -> Instance {
        let id = InstanceId::new(spec.parse().unwrap());
        let task_id = id.task_id("main");
        let mut tasks = BTreeMap::new();
        tasks.insert(
            task_id.clone(),
            Task {
                id: task_id,
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition,
                    staged_at: ts(staged_at),
                    started_at: None,
                    healthy: None,
                    since: ts(staged_at),
                },
            },
        );
        Instance {
            id,
            run_spec_version: ts(0),
            agent: Some(AgentInfo {
                hostname: "node-1".into(),
                agent_id: None,
                attributes: Vec::new(),
            }),
            state: InstanceState {
                condition,
                since: ts(staged_at),
                goal: Goal::Running,
                healthy: None,
            },
            tasks,
            reservation: None,
            unreachable_strategy: Default::default(),
        }
    }

    #[tokio::test]
    async fn overdue_staging_task_becomes_candidate() {
        let clock = ManualClock::at(ts(1000));
        let tracker = tracker_with(&clock).await;
        let overdue = instance_with_condition("/web", Condition::Staging, 0);
        let fresh = instance_with_condition("/web", Condition::Staging, 990);
        tracker
            .process(InstanceOp::LaunchEphemeral { instance: overdue.clone() })
            .await
            .unwrap();
        tracker
            .process(InstanceOp::LaunchEphemeral { instance: fresh.clone() })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(1000)).await;

        assert_eq!(rx.try_recv().unwrap(), overdue.id);
        assert!(rx.try_recv().is_err(), "fresh task must not be flagged");
    }

    #[tokio::test]
    async fn running_tasks_are_never_candidates() {
        let clock = ManualClock::at(ts(1000));
        let tracker = tracker_with(&clock).await;
        let running = instance_with_condition("/web", Condition::Running, 0);
        tracker
            .process(InstanceOp::LaunchEphemeral { instance: running })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(1000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_reservation_is_timed_out() {
        let clock = ManualClock::at(ts(0));
        let tracker = tracker_with(&clock).await;
        let id = InstanceId::new("/db".parse().unwrap());
        let reserved = Instance {
            id: id.clone(),
            run_spec_version: ts(0),
            agent: None,
            state: InstanceState {
                condition: Condition::Reserved,
                since: ts(0),
                goal: Goal::Running,
                healthy: None,
            },
            tasks: BTreeMap::new(),
            reservation: Some(Reservation {
                volume_ids: vec!["data#x".into()],
                state: ReservationState::New {
                    deadline: Some(ts(120)),
                },
            }),
            unreachable_strategy: Default::default(),
        };
        tracker
            .process(InstanceOp::Reserve { instance: reserved })
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        // Before the deadline: untouched.
        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(119)).await;
        assert!(tracker.get(&id).is_some());

        // At the deadline: expunged through the state machine.
        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(120)).await;
        assert!(tracker.get(&id).is_none());
    }

    #[tokio::test]
    async fn unreachable_past_expunge_window_is_dropped() {
        let clock = ManualClock::at(ts(0));
        let tracker = tracker_with(&clock).await;
        let mut unreachable = instance_with_condition("/web", Condition::Unreachable, 0);
        unreachable.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after: Duration::from_secs(60),
            expunge_after: Duration::from_secs(3600),
        };
        let id = unreachable.id.clone();
        tracker
            .process(InstanceOp::LaunchEphemeral { instance: unreachable })
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(16);
        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(3599)).await;
        assert!(tracker.get(&id).is_some());

        scan_overdue(&tracker, &tx, &ReconcileConfig::default(), ts(3600)).await;
        assert!(tracker.get(&id).is_none());
    }

    // -- ledger --

    fn iid() -> InstanceId {
        InstanceId::new("/web".parse().unwrap())
    }

    #[test]
    fn ledger_reconciles_until_limit_then_escalates() {
        let mut ledger = ReconciliationLedger::default();
        let id = iid();
        ledger.insert(id.clone());

        for _ in 0..3 {
            let (reconcile, escalate) = ledger.tick(3);
            assert_eq!(reconcile, vec![id.clone()]);
            assert!(escalate.is_empty());
        }
        let (reconcile, escalate) = ledger.tick(3);
        assert!(reconcile.is_empty());
        assert_eq!(escalate, vec![id.clone()]);
        assert!(ledger.is_empty(), "escalated entries leave the ledger");
    }

    #[test]
    fn ledger_status_resolves_entry() {
        let mut ledger = ReconciliationLedger::default();
        let id = iid();
        ledger.insert(id.clone());
        ledger.on_status(&id, Condition::Running);
        assert!(ledger.is_empty());
    }

    #[test]
    fn ledger_staging_resets_attempts() {
        let mut ledger = ReconciliationLedger::default();
        let id = iid();
        ledger.insert(id.clone());
        let _ = ledger.tick(3);
        let _ = ledger.tick(3);

        // A Staging report keeps the entry but starts counting over.
        ledger.on_status(&id, Condition::Staging);
        assert_eq!(ledger.len(), 1);
        for _ in 0..3 {
            let (reconcile, escalate) = ledger.tick(3);
            assert_eq!(reconcile.len(), 1);
            assert!(escalate.is_empty());
        }
    }

    #[test]
    fn ledger_insert_is_idempotent() {
        let mut ledger = ReconciliationLedger::default();
        let id = iid();
        ledger.insert(id.clone());
        let _ = ledger.tick(3);
        ledger.insert(id.clone());
        // Re-inserting must not reset the attempt counter.
        let (reconcile, _) = ledger.tick(2);
        assert_eq!(reconcile.len(), 1);
        let (reconcile, escalate) = ledger.tick(2);
        assert!(reconcile.is_empty());
        assert_eq!(escalate.len(), 1);
    }
}
