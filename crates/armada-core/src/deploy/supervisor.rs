//! Per-action deployment supervisors.
//!
//! Each step action gets one supervisor future: start (0 to N with
//! readiness gating), scale (either direction), stop (decommission and
//! wait), and restart (the task-replace roll driven by the
//! [`ReplacementLedger`]). Supervisor state lives in plain structs; the
//! async shells only observe tracker updates and execute decisions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::deploy::ledger::{Decision, ReplacementLedger};
use crate::deploy::ReadinessResult;
use crate::instance::{Goal, Instance, InstanceId};
use crate::kill::{KillReason, KillServiceHandle};
use crate::launch::queue::LaunchQueueHandle;
use crate::spec::RunSpec;
use crate::tracker::{InstanceUpdate, TrackerHandle};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("deployment step cancelled")]
    Cancelled,

    #[error("tracker unavailable: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error("update stream closed")]
    StreamClosed,
}

/// Shared handles for all supervisors of one deployment.
#[derive(Clone)]
pub struct SupervisorCtx {
    pub tracker: TrackerHandle,
    pub queue: LaunchQueueHandle,
    pub kill: KillServiceHandle,
    pub readiness_tx: broadcast::Sender<ReadinessResult>,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Readiness bookkeeping
// ---------------------------------------------------------------------------

/// Tracks, per instance, which readiness checks have reported success.
struct ReadinessBook {
    spec: Arc<RunSpec>,
    reported: HashMap<InstanceId, HashSet<String>>,
}

impl ReadinessBook {
    fn new(spec: Arc<RunSpec>) -> Self {
        Self {
            spec,
            reported: HashMap::new(),
        }
    }

    fn note(&mut self, result: &ReadinessResult) {
        let id = result.task_id.instance_id.clone();
        let entry = self.reported.entry(id).or_default();
        if result.ready {
            entry.insert(result.name.clone());
        } else {
            entry.remove(&result.name);
        }
    }

    /// Ready means: running, healthy when health checks exist, and every
    /// declared readiness check reported success.
    fn is_ready(&self, instance: &Instance) -> bool {
        if !instance.is_running() {
            return false;
        }
        if self.spec.has_health_checks() && instance.state.healthy != Some(true) {
            return false;
        }
        if instance.state.healthy == Some(false) {
            return false;
        }
        if self.spec.readiness_checks.is_empty() {
            return true;
        }
        let reported = self.reported.get(&instance.id);
        self.spec
            .readiness_checks
            .iter()
            .all(|c| reported.is_some_and(|names| names.contains(&c.name)))
    }
}

/// One wake-up of a supervisor event loop.
enum SupervisorWake {
    Update(InstanceUpdate),
    Readiness(ReadinessResult),
    Cancelled,
}

async fn next_wake(
    updates: &mut broadcast::Receiver<InstanceUpdate>,
    readiness: &mut broadcast::Receiver<ReadinessResult>,
    cancel: &CancellationToken,
) -> Result<SupervisorWake, SupervisorError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SupervisorWake::Cancelled),
            update = updates.recv() => match update {
                Ok(update) => return Ok(SupervisorWake::Update(update)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "supervisor lagged behind tracker updates");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(SupervisorError::StreamClosed),
            },
            result = readiness.recv() => match result {
                Ok(result) => return Ok(SupervisorWake::Readiness(result)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(SupervisorError::StreamClosed),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// Bring a fresh run-spec from its current count up to `scale_to` ready
/// instances.
pub async fn run_start(
    ctx: &SupervisorCtx,
    spec: Arc<RunSpec>,
    scale_to: u32,
) -> Result<(), SupervisorError> {
    let mut updates = ctx.tracker.updates();
    let mut readiness = ctx.readiness_tx.subscribe();
    let mut book = ReadinessBook::new(Arc::clone(&spec));

    let existing = ctx.tracker.spec_instances(&spec.id);
    let alive = existing.iter().filter(|i| i.is_active()).count() as u32;
    let to_launch = scale_to.saturating_sub(alive);
    if to_launch > 0 {
        ctx.queue.add(Arc::clone(&spec), to_launch).await;
    }

    loop {
        if ready_count(ctx, &book, &spec) >= scale_to as usize {
            return Ok(());
        }
        match next_wake(&mut updates, &mut readiness, &ctx.cancel).await? {
            SupervisorWake::Cancelled => return Err(SupervisorError::Cancelled),
            SupervisorWake::Readiness(result) => {
                if result.task_id.instance_id.run_spec_id == spec.id {
                    book.note(&result);
                }
            }
            SupervisorWake::Update(_) => {}
        }
    }
}

fn ready_count(ctx: &SupervisorCtx, book: &ReadinessBook, spec: &RunSpec) -> usize {
    ctx.tracker
        .spec_instances(&spec.id)
        .iter()
        .filter(|i| i.run_spec_version == spec.version && book.is_ready(i))
        .count()
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

/// Decommission every instance of a spec and wait for termination.
pub async fn run_stop(ctx: &SupervisorCtx, spec: Arc<RunSpec>) -> Result<(), SupervisorError> {
    let instances = ctx.tracker.spec_instances(&spec.id);
    ctx.queue.purge(spec.id.clone()).await;

    let mut to_kill = Vec::new();
    for instance in instances {
        ctx.tracker
            .set_goal(instance.id.clone(), Goal::Decommissioned)
            .await?;
        // Setting the goal may already have expunged a terminal record.
        if let Some(live) = ctx.tracker.get(&instance.id) {
            to_kill.push(live);
        }
    }
    if to_kill.is_empty() {
        return Ok(());
    }

    let ids: Vec<InstanceId> = to_kill.iter().map(|i| i.id.clone()).collect();
    let done = ctx.kill.watch(ids).await;
    ctx.kill
        .kill(to_kill, KillReason::DeploymentStopping)
        .await;

    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(SupervisorError::Cancelled),
        _ = done => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Scale
// ---------------------------------------------------------------------------

/// Adjust an unchanged spec to `target` instances.
pub async fn run_scale(
    ctx: &SupervisorCtx,
    spec: Arc<RunSpec>,
    target: u32,
) -> Result<(), SupervisorError> {
    let instances = ctx.tracker.spec_instances(&spec.id);
    let mut alive: Vec<Instance> = instances.into_iter().filter(|i| i.is_active()).collect();

    if (alive.len() as u32) < target {
        return run_start(ctx, spec, target).await;
    }

    // Scale down: kill the youngest instances first, sparing the oldest
    // (ids are time-ordered within a spec).
    alive.sort_by(|a, b| b.id.cmp(&a.id));
    let excess_count = alive.len().saturating_sub(target as usize);
    let excess: Vec<Instance> = alive.into_iter().take(excess_count).collect();
    let mut victims = Vec::new();
    for instance in excess {
        let goal = if instance.has_reservation() {
            Goal::Stopped
        } else {
            Goal::Decommissioned
        };
        ctx.tracker.set_goal(instance.id.clone(), goal).await?;
        if let Some(live) = ctx.tracker.get(&instance.id) {
            victims.push(live);
        }
    }
    if victims.is_empty() {
        return Ok(());
    }
    let ids: Vec<InstanceId> = victims.iter().map(|i| i.id.clone()).collect();
    let done = ctx.kill.watch(ids).await;
    ctx.kill.kill(victims, KillReason::DeploymentScaling).await;
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(SupervisorError::Cancelled),
        _ = done => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Restart (task replace)
// ---------------------------------------------------------------------------

/// Replace all instances of older versions with `spec.version`, honoring
/// the upgrade strategy's capacity bounds.
pub async fn run_restart(ctx: &SupervisorCtx, spec: Arc<RunSpec>) -> Result<(), SupervisorError> {
    let mut updates = ctx.tracker.updates();
    let mut readiness = ctx.readiness_tx.subscribe();
    let mut book = ReadinessBook::new(Arc::clone(&spec));

    let instances = ctx.tracker.spec_instances(&spec.id);
    let old_alive: std::collections::BTreeSet<InstanceId> = instances
        .iter()
        .filter(|i| i.run_spec_version != spec.version && i.is_active())
        .map(|i| i.id.clone())
        .collect();

    let mut ledger = ReplacementLedger::new(
        spec.instances,
        spec.upgrade_strategy,
        spec.is_resident(),
        old_alive,
    );
    // Make sure fresh launches use the new revision.
    ctx.queue.sync(Arc::clone(&spec)).await;

    tracing::info!(
        run_spec_id = %spec.id,
        old = ledger.old_alive(),
        minimum_healthy = ledger.minimum_healthy(),
        capacity = ledger.capacity_ceiling(),
        "starting replacement"
    );

    // Instances of the new version already seen by the ledger.
    let mut seen_new: HashSet<InstanceId> = HashSet::new();
    let mut ready_new: HashSet<InstanceId> = HashSet::new();

    // A resumed step may find new-version instances already placed; count
    // them before computing kills and allowances.
    let pre_existing: Vec<Instance> = instances
        .iter()
        .filter(|i| i.run_spec_version == spec.version && i.is_active())
        .cloned()
        .collect();
    for instance in &pre_existing {
        seen_new.insert(instance.id.clone());
        ledger.on_new_started(instance.id.clone());
    }

    for id in ledger.initial_kills() {
        kill_old(ctx, &spec, &id).await?;
    }
    let launch = ledger.launch_allowance();
    if launch > 0 {
        ctx.queue.add(Arc::clone(&spec), launch).await;
    }
    for instance in &pre_existing {
        note_ready_transition(ctx, &spec, &book, instance, &mut ledger, &mut ready_new).await?;
    }

    while !ledger.is_done() {
        match next_wake(&mut updates, &mut readiness, &ctx.cancel).await? {
            SupervisorWake::Cancelled => return Err(SupervisorError::Cancelled),
            SupervisorWake::Readiness(result) => {
                if result.task_id.instance_id.run_spec_id != spec.id {
                    continue;
                }
                book.note(&result);
                let id = result.task_id.instance_id.clone();
                if let Some(instance) = ctx.tracker.get(&id) {
                    note_ready_transition(
                        ctx, &spec, &book, &instance, &mut ledger, &mut ready_new,
                    )
                    .await?;
                }
            }
            SupervisorWake::Update(update) => {
                let instance = update.instance();
                if instance.run_spec_id() != &spec.id {
                    continue;
                }
                if ledger.is_old(&instance.id) {
                    let gone = match &update {
                        InstanceUpdate::Expunged { .. } => true,
                        InstanceUpdate::Updated { instance } => {
                            instance.state.condition.is_terminal()
                        }
                    };
                    if gone {
                        handle_old_gone(ctx, &spec, &update, &mut ledger).await?;
                    }
                    continue;
                }
                if instance.run_spec_version != spec.version {
                    continue;
                }
                // A new-version instance.
                if seen_new.insert(instance.id.clone()) {
                    ledger.on_new_started(instance.id.clone());
                }
                match &update {
                    InstanceUpdate::Expunged { instance } => {
                        if instance.state.goal == Goal::Running {
                            ledger.on_new_terminal_still_wanted(&instance.id);
                            seen_new.remove(&instance.id);
                            ready_new.remove(&instance.id);
                        } else {
                            tracing::warn!(
                                instance_id = %instance.id,
                                goal = %instance.state.goal,
                                "new instance terminated under foreign goal; another writer is acting on this service"
                            );
                            ledger.on_new_terminal_interference(&instance.id);
                            seen_new.remove(&instance.id);
                            ready_new.remove(&instance.id);
                            let launch = ledger.launch_allowance();
                            if launch > 0 {
                                ctx.queue.add(Arc::clone(&spec), launch).await;
                            }
                        }
                    }
                    InstanceUpdate::Updated { instance } => {
                        if instance.state.condition.is_terminal() {
                            // The queue's failure path will expunge and
                            // requeue; nothing to do yet.
                            continue;
                        }
                        note_ready_transition(
                            ctx, &spec, &book, instance, &mut ledger, &mut ready_new,
                        )
                        .await?;
                    }
                }
            }
        }
    }

    tracing::info!(run_spec_id = %spec.id, ready = ledger.new_ready(), "replacement complete");
    Ok(())
}

async fn note_ready_transition(
    ctx: &SupervisorCtx,
    spec: &Arc<RunSpec>,
    book: &ReadinessBook,
    instance: &Instance,
    ledger: &mut ReplacementLedger,
    ready_new: &mut HashSet<InstanceId>,
) -> Result<(), SupervisorError> {
    if !book.is_ready(instance) || !ready_new.insert(instance.id.clone()) {
        return Ok(());
    }
    for decision in ledger.on_new_ready(instance.id.clone()) {
        execute(ctx, spec, decision).await?;
    }
    Ok(())
}

async fn handle_old_gone(
    ctx: &SupervisorCtx,
    spec: &Arc<RunSpec>,
    update: &InstanceUpdate,
    ledger: &mut ReplacementLedger,
) -> Result<(), SupervisorError> {
    let instance = update.instance();
    // Out-of-band deaths still carry goal Running; decommission the record
    // so the launch queue does not resurrect the old version.
    if let InstanceUpdate::Updated { instance } = update {
        if instance.state.goal == Goal::Running {
            let goal = if instance.has_reservation() {
                Goal::Stopped
            } else {
                Goal::Decommissioned
            };
            let _ = ctx.tracker.set_goal(instance.id.clone(), goal).await;
        }
    }
    for decision in ledger.on_old_gone(&instance.id) {
        execute(ctx, spec, decision).await?;
    }
    Ok(())
}

async fn execute(
    ctx: &SupervisorCtx,
    spec: &Arc<RunSpec>,
    decision: Decision,
) -> Result<(), SupervisorError> {
    match decision {
        Decision::KillOld(id) => kill_old(ctx, spec, &id).await,
        Decision::Launch(count) => {
            ctx.queue.add(Arc::clone(spec), count).await;
            Ok(())
        }
    }
}

async fn kill_old(
    ctx: &SupervisorCtx,
    spec: &Arc<RunSpec>,
    id: &InstanceId,
) -> Result<(), SupervisorError> {
    if ctx.tracker.get(id).is_none() {
        return Ok(());
    }
    let goal = if spec.is_resident() {
        Goal::Stopped
    } else {
        Goal::Decommissioned
    };
    ctx.tracker.set_goal(id.clone(), goal).await?;
    // The goal change may already have expunged a terminal record; the
    // ledger hears about that through the normal update stream.
    if let Some(live) = ctx.tracker.get(id) {
        ctx.kill.kill(vec![live], KillReason::Upgrade).await;
    }
    Ok(())
}
