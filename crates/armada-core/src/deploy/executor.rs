//! The deployment manager: runs plans one step at a time.
//!
//! Each submitted plan gets a runner task. A step spawns one supervisor per
//! action and completes when all of them do; progress (the current step) is
//! persisted before the step runs so a new leader resumes exactly where the
//! old one stopped. Steps are state goals ("have N ready at version v"), so
//! re-running a half-applied step is harmless.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use armada_store::{Repository, StoreError};

use crate::deploy::supervisor::{
    run_restart, run_scale, run_start, run_stop, SupervisorCtx, SupervisorError,
};
use crate::deploy::{DeploymentAction, DeploymentPlan, DeploymentStep};
use crate::events::{Event, EventBus};
use crate::spec::path::PathId;
use crate::spec::RunSpec;

/// A plan together with its execution cursor, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPlan {
    pub plan: DeploymentPlan,
    pub current_step: usize,
}

impl armada_store::Record for StoredPlan {
    const CATEGORY: &'static str = "deployments";

    fn record_id(&self) -> String {
        self.plan.id.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("deployments {conflicting:?} already touch the requested run-specs")]
    Conflict { conflicting: Vec<Uuid> },

    #[error("too many queued root group updates (limit {limit})")]
    TooManyQueuedUpdates { limit: usize },

    #[error("deployment {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary row for the deployment listing surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub id: Uuid,
    pub affected: Vec<PathId>,
    pub current_step: usize,
    pub total_steps: usize,
}

enum ManagerMsg {
    Submit {
        plan: DeploymentPlan,
        force: bool,
        reply: oneshot::Sender<Result<Uuid, DeployError>>,
    },
    Cancel {
        id: Uuid,
        rollback: bool,
        reply: oneshot::Sender<Result<(), DeployError>>,
    },
    List {
        reply: oneshot::Sender<Vec<DeploymentSummary>>,
    },
    /// A runner completed a step.
    Progress {
        id: Uuid,
        step: usize,
    },
    /// A runner finished (successfully or not) and must be deregistered.
    RunnerDone {
        id: Uuid,
    },
}

#[derive(Clone)]
pub struct DeploymentManagerHandle {
    tx: mpsc::Sender<ManagerMsg>,
}

impl DeploymentManagerHandle {
    pub async fn submit(&self, plan: DeploymentPlan, force: bool) -> Result<Uuid, DeployError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerMsg::Submit { plan, force, reply }).await;
        rx.await.unwrap_or(Err(DeployError::TooManyQueuedUpdates { limit: 0 }))
    }

    pub async fn cancel(&self, id: Uuid, rollback: bool) -> Result<(), DeployError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerMsg::Cancel { id, rollback, reply }).await;
        rx.await.unwrap_or(Err(DeployError::NotFound(id)))
    }

    pub async fn list(&self) -> Vec<DeploymentSummary> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerMsg::List { reply }).await;
        rx.await.unwrap_or_default()
    }
}

struct RunningPlan {
    affected: BTreeSet<PathId>,
    original: crate::spec::Group,
    target: crate::spec::Group,
    cancel: CancellationToken,
    current_step: usize,
    total_steps: usize,
}

pub struct DeploymentManager {
    ctx: SupervisorCtx,
    repo: Repository<StoredPlan>,
    bus: EventBus,
    max_running: usize,
    running: HashMap<Uuid, RunningPlan>,
}

impl DeploymentManager {
    pub fn new(
        ctx: SupervisorCtx,
        repo: Repository<StoredPlan>,
        bus: EventBus,
        max_running: usize,
    ) -> Self {
        Self {
            ctx,
            repo,
            bus,
            max_running,
            running: HashMap::new(),
        }
    }

    /// Resume plans left behind by the previous leader. Plans whose target
    /// tree is older than `root_version` are stale and cancelled.
    pub async fn recover(
        &self,
        root_version: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<StoredPlan>, StoreError> {
        let mut resumable = Vec::new();
        for stored in self.repo.all().await? {
            if stored.plan.target.version < root_version {
                tracing::warn!(
                    plan_id = %stored.plan.id,
                    "dropping stale deployment from a previous leader"
                );
                self.repo.delete(&stored.plan.id.to_string()).await?;
                continue;
            }
            resumable.push(stored);
        }
        Ok(resumable)
    }

    pub fn spawn(self, recovered: Vec<StoredPlan>) -> DeploymentManagerHandle {
        let (tx, rx) = mpsc::channel(64);
        let handle = DeploymentManagerHandle { tx: tx.clone() };
        tokio::spawn(self.run(rx, tx, recovered));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ManagerMsg>,
        self_tx: mpsc::Sender<ManagerMsg>,
        recovered: Vec<StoredPlan>,
    ) {
        for stored in recovered {
            tracing::info!(
                plan_id = %stored.plan.id,
                step = stored.current_step,
                "resuming deployment from previous leader"
            );
            self.start_runner(stored, &self_tx);
        }

        while let Some(msg) = rx.recv().await {
            match msg {
                ManagerMsg::Submit { plan, force, reply } => {
                    let _ = reply.send(self.submit(plan, force, &self_tx).await);
                }
                ManagerMsg::Cancel { id, rollback, reply } => {
                    let _ = reply.send(self.cancel(id, rollback, &self_tx).await);
                }
                ManagerMsg::List { reply } => {
                    let list = self
                        .running
                        .iter()
                        .map(|(id, r)| DeploymentSummary {
                            id: *id,
                            affected: r.affected.iter().cloned().collect(),
                            current_step: r.current_step,
                            total_steps: r.total_steps,
                        })
                        .collect();
                    let _ = reply.send(list);
                }
                ManagerMsg::Progress { id, step } => {
                    if let Some(runner) = self.running.get_mut(&id) {
                        runner.current_step = step;
                    }
                }
                ManagerMsg::RunnerDone { id } => {
                    self.running.remove(&id);
                }
            }
        }
        // Tear down runners with the manager.
        for runner in self.running.values() {
            runner.cancel.cancel();
        }
        tracing::debug!("deployment manager stopped");
    }

    async fn submit(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        self_tx: &mpsc::Sender<ManagerMsg>,
    ) -> Result<Uuid, DeployError> {
        if self.running.len() >= self.max_running {
            return Err(DeployError::TooManyQueuedUpdates {
                limit: self.max_running,
            });
        }
        let affected = plan.affected_specs();
        let conflicting: Vec<Uuid> = self
            .running
            .iter()
            .filter(|(_, r)| !r.affected.is_disjoint(&affected))
            .map(|(id, _)| *id)
            .collect();
        if !conflicting.is_empty() {
            if !force {
                return Err(DeployError::Conflict { conflicting });
            }
            // Force replaces in-progress plans touching the same specs.
            for id in conflicting {
                if let Some(runner) = self.running.remove(&id) {
                    runner.cancel.cancel();
                    self.repo.delete(&id.to_string()).await?;
                    self.bus.publish(Event::DeploymentCanceled {
                        plan_id: id,
                        rolled_back: false,
                    });
                }
            }
        }

        let stored = StoredPlan {
            plan,
            current_step: 0,
        };
        self.repo.store(&stored).await?;
        let id = stored.plan.id;
        self.start_runner(stored, self_tx);
        Ok(id)
    }

    async fn cancel(
        &mut self,
        id: Uuid,
        rollback: bool,
        self_tx: &mpsc::Sender<ManagerMsg>,
    ) -> Result<(), DeployError> {
        let Some(runner) = self.running.remove(&id) else {
            return Err(DeployError::NotFound(id));
        };
        runner.cancel.cancel();
        self.repo.delete(&id.to_string()).await?;
        self.bus.publish(Event::DeploymentCanceled {
            plan_id: id,
            rolled_back: rollback,
        });

        if rollback {
            // Best effort: replay the prior tree as a fresh plan. The
            // cancelled target stands in for "current"; steps are state
            // goals, so specs the plan never reached are no-ops.
            let rollback_plan = crate::deploy::plan(
                &runner.target,
                &runner.original,
                Uuid::now_v7(),
                runner.original.version,
            );
            match rollback_plan {
                Ok(plan) if !plan.is_empty() => {
                    let stored = StoredPlan {
                        plan,
                        current_step: 0,
                    };
                    self.repo.store(&stored).await?;
                    self.start_runner(stored, self_tx);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(plan_id = %id, error = %e, "rollback plan failed validation");
                }
            }
        }
        Ok(())
    }

    fn start_runner(&mut self, stored: StoredPlan, self_tx: &mpsc::Sender<ManagerMsg>) {
        let id = stored.plan.id;
        let cancel = self.ctx.cancel.child_token();
        self.running.insert(
            id,
            RunningPlan {
                affected: stored.plan.affected_specs(),
                original: stored.plan.original.clone(),
                target: stored.plan.target.clone(),
                cancel: cancel.clone(),
                current_step: stored.current_step,
                total_steps: stored.plan.steps.len(),
            },
        );
        let mut ctx = self.ctx.clone();
        ctx.cancel = cancel;
        let repo = self.repo.clone();
        let bus = self.bus.clone();
        let done_tx = self_tx.clone();
        tokio::spawn(async move {
            run_plan(ctx, repo, bus, stored, &done_tx).await;
            let _ = done_tx.send(ManagerMsg::RunnerDone { id }).await;
        });
    }
}

/// Execute a plan from its stored cursor to the end.
async fn run_plan(
    ctx: SupervisorCtx,
    repo: Repository<StoredPlan>,
    bus: EventBus,
    mut stored: StoredPlan,
    progress_tx: &mpsc::Sender<ManagerMsg>,
) {
    let plan_id = stored.plan.id;
    bus.publish(Event::DeploymentStarted { plan_id });

    let steps: Vec<DeploymentStep> = stored.plan.steps.clone();
    while stored.current_step < steps.len() {
        let index = stored.current_step;
        if let Err(e) = repo.store(&stored).await {
            tracing::error!(plan_id = %plan_id, error = %e, "failed to persist deployment progress");
            return;
        }

        let step = &steps[index];
        tracing::info!(plan_id = %plan_id, step = index, actions = step.actions.len(), "running deployment step");
        match run_step(&ctx, &stored.plan, step).await {
            Ok(()) => {
                bus.publish(Event::DeploymentStepSuccess {
                    plan_id,
                    step: index,
                });
                stored.current_step += 1;
                let _ = progress_tx
                    .send(ManagerMsg::Progress {
                        id: plan_id,
                        step: stored.current_step,
                    })
                    .await;
            }
            Err((run_spec_id, e)) => {
                if matches!(e, SupervisorError::Cancelled) {
                    tracing::info!(plan_id = %plan_id, step = index, "deployment cancelled");
                    return;
                }
                tracing::error!(
                    plan_id = %plan_id,
                    step = index,
                    run_spec_id = %run_spec_id,
                    error = %e,
                    "deployment step failed"
                );
                bus.publish(Event::DeploymentStepFailure {
                    plan_id,
                    step: index,
                    run_spec_id,
                    reason: e.to_string(),
                });
                if let Err(e) = repo.delete(&plan_id.to_string()).await {
                    tracing::error!(plan_id = %plan_id, error = %e, "failed to delete failed deployment");
                }
                return;
            }
        }
    }

    if let Err(e) = repo.delete(&plan_id.to_string()).await {
        tracing::error!(plan_id = %plan_id, error = %e, "failed to delete finished deployment");
    }
    bus.publish(Event::DeploymentFinished { plan_id });
    tracing::info!(plan_id = %plan_id, "deployment finished");
}

/// Run every action of one step concurrently; first failure fails the step.
async fn run_step(
    ctx: &SupervisorCtx,
    plan: &DeploymentPlan,
    step: &DeploymentStep,
) -> Result<(), (PathId, SupervisorError)> {
    let mut joins = tokio::task::JoinSet::new();
    for action in step.actions.clone() {
        let ctx = ctx.clone();
        let spec = resolve_spec(plan, &action);
        joins.spawn(async move {
            let run_spec_id = action.run_spec_id().clone();
            let result = match (&action, spec) {
                (DeploymentAction::ResolveArtifacts { uris, .. }, _) => {
                    // Artifact fetching is the adapter's concern; the step
                    // records intent and completes.
                    tracing::info!(run_spec_id = %run_spec_id, count = uris.len(), "artifacts scheduled for resolution");
                    Ok(())
                }
                (DeploymentAction::Stop { .. }, Some(spec)) => run_stop(&ctx, spec).await,
                (DeploymentAction::Start { scale_to, .. }, Some(spec)) => {
                    run_start(&ctx, spec, *scale_to).await
                }
                (DeploymentAction::Scale { to, .. }, Some(spec)) => {
                    run_scale(&ctx, spec, *to).await
                }
                (DeploymentAction::Restart { .. }, Some(spec)) => run_restart(&ctx, spec).await,
                (_, None) => {
                    tracing::error!(run_spec_id = %run_spec_id, "action target missing from both trees");
                    Ok(())
                }
            };
            (run_spec_id, result)
        });
    }

    let mut failure: Option<(PathId, SupervisorError)> = None;
    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((run_spec_id, Err(e))) => {
                if failure.is_none() {
                    failure = Some((run_spec_id, e));
                    joins.abort_all();
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                tracing::error!(error = %e, "supervisor task panicked");
                if failure.is_none() {
                    failure = Some((
                        PathId::root(),
                        SupervisorError::StreamClosed,
                    ));
                }
            }
        }
    }
    match failure {
        Some(f) => Err(f),
        None => Ok(()),
    }
}

/// Stop actions target specs that only exist in the original tree; every
/// other action resolves against the target.
fn resolve_spec(plan: &DeploymentPlan, action: &DeploymentAction) -> Option<Arc<RunSpec>> {
    plan.target
        .find_run_spec(action.run_spec_id())
        .or_else(|| plan.original.find_run_spec(action.run_spec_id()))
        .cloned()
        .map(Arc::new)
}
