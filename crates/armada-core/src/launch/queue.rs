//! The launch queue actor.
//!
//! One entry per run-spec with pending launches: a pending count, an
//! exponential backoff deadline driven by consecutive failures, and a small
//! pool of launch tokens throttling the launch rate even when offers are
//! abundant. The actor also watches tracker updates: a confirmed running
//! task resets the backoff and refills tokens; a terminal task under goal
//! Running records the failure, expunges the dead record, and re-queues a
//! replacement with backoff applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use armada_store::Repository;

use crate::clock::Clock;
use crate::instance::state_machine::InstanceOp;
use crate::instance::{Goal, Instance};
use crate::launch::{QueueInfo, TaskFailure};
use crate::spec::path::PathId;
use crate::spec::RunSpec;
use crate::tracker::{InstanceUpdate, TrackerHandle};

/// Default size of the per-spec launch-token pool.
pub const DEFAULT_LAUNCH_TOKENS: u32 = 100;

#[derive(Debug)]
struct QueuedSpec {
    spec: Arc<RunSpec>,
    pending: u32,
    in_progress: u32,
    consecutive_failures: u32,
    backoff_until: Option<DateTime<Utc>>,
    tokens: u32,
    last_failure: Option<TaskFailure>,
}

impl QueuedSpec {
    fn new(spec: Arc<RunSpec>, max_tokens: u32) -> Self {
        Self {
            spec,
            pending: 0,
            in_progress: 0,
            consecutive_failures: 0,
            backoff_until: None,
            tokens: max_tokens,
            last_failure: None,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            run_spec_id: self.spec.id.clone(),
            pending: self.pending,
            in_progress: self.in_progress,
            consecutive_failures: self.consecutive_failures,
            backoff_until: self.backoff_until,
            tokens: self.tokens,
            last_failure: self.last_failure.clone(),
        }
    }

    /// Ready to be offered resources right now.
    fn is_launchable(&self, now: DateTime<Utc>) -> bool {
        self.pending > 0
            && self.tokens > 0
            && self.backoff_until.is_none_or(|until| until <= now)
    }
}

enum QueueMsg {
    Add {
        spec: Arc<RunSpec>,
        count: u32,
        reply: oneshot::Sender<()>,
    },
    Sync {
        spec: Arc<RunSpec>,
        reply: oneshot::Sender<()>,
    },
    Purge {
        run_spec_id: PathId,
        reply: oneshot::Sender<()>,
    },
    /// An offer was consumed for this spec.
    MarkLaunched {
        run_spec_id: PathId,
        reply: oneshot::Sender<()>,
    },
    /// Specs currently eligible for offer matching.
    Launchable {
        reply: oneshot::Sender<Vec<Arc<RunSpec>>>,
    },
    Info {
        run_spec_id: PathId,
        reply: oneshot::Sender<Option<QueueInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<QueueInfo>>,
    },
}

#[derive(Clone)]
pub struct LaunchQueueHandle {
    tx: mpsc::Sender<QueueMsg>,
    demand_rx: watch::Receiver<bool>,
}

impl LaunchQueueHandle {
    /// Queue `count` additional launches of `spec` (also syncs the spec).
    pub async fn add(&self, spec: Arc<RunSpec>, count: u32) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Add { spec, count, reply }).await;
        let _ = rx.await;
    }

    /// Replace the stored spec revision without changing counts.
    pub async fn sync(&self, spec: Arc<RunSpec>) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Sync { spec, reply }).await;
        let _ = rx.await;
    }

    /// Drop all queue state for a run-spec.
    pub async fn purge(&self, run_spec_id: PathId) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Purge { run_spec_id, reply }).await;
        let _ = rx.await;
    }

    pub async fn mark_launched(&self, run_spec_id: PathId) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(QueueMsg::MarkLaunched { run_spec_id, reply })
            .await;
        let _ = rx.await;
    }

    pub async fn launchable(&self) -> Vec<Arc<RunSpec>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Launchable { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn info(&self, run_spec_id: PathId) -> Option<QueueInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::Info { run_spec_id, reply }).await;
        rx.await.ok().flatten()
    }

    pub async fn list(&self) -> Vec<QueueInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(QueueMsg::List { reply }).await;
        rx.await.unwrap_or_default()
    }

    /// True whenever any spec has unfulfilled demand; drives offer revival.
    pub fn demand(&self) -> watch::Receiver<bool> {
        self.demand_rx.clone()
    }
}

pub struct LaunchQueue {
    entries: BTreeMap<PathId, QueuedSpec>,
    tracker: TrackerHandle,
    failures: Repository<TaskFailure>,
    clock: Arc<dyn Clock>,
    max_tokens: u32,
    /// Unreachable instances already replaced, so a re-delivered status
    /// does not queue a second replacement.
    replaced_unreachable: std::collections::HashSet<crate::instance::InstanceId>,
}

impl LaunchQueue {
    pub fn new(
        tracker: TrackerHandle,
        failures: Repository<TaskFailure>,
        clock: Arc<dyn Clock>,
        max_tokens: u32,
    ) -> Self {
        Self {
            entries: BTreeMap::new(),
            tracker,
            failures,
            clock,
            max_tokens,
            replaced_unreachable: Default::default(),
        }
    }

    pub fn spawn(self) -> LaunchQueueHandle {
        let (tx, rx) = mpsc::channel(256);
        let (demand_tx, demand_rx) = watch::channel(false);
        let updates = self.tracker.updates();
        let handle = LaunchQueueHandle { tx, demand_rx };
        tokio::spawn(self.run(rx, updates, demand_tx));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<QueueMsg>,
        mut updates: tokio::sync::broadcast::Receiver<InstanceUpdate>,
        demand_tx: watch::Sender<bool>,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_msg(msg).await;
                }
                update = updates.recv() => {
                    match update {
                        Ok(update) => self.handle_update(update).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "launch queue lagged behind tracker updates");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            let _ = demand_tx.send(self.entries.values().any(|e| e.pending > 0));
        }
        tracing::debug!("launch queue actor stopped");
    }

    async fn handle_msg(&mut self, msg: QueueMsg) {
        match msg {
            QueueMsg::Add { spec, count, reply } => {
                let entry = self
                    .entries
                    .entry(spec.id.clone())
                    .or_insert_with(|| QueuedSpec::new(Arc::clone(&spec), self.max_tokens));
                entry.spec = spec;
                entry.pending += count;
                let _ = reply.send(());
            }
            QueueMsg::Sync { spec, reply } => {
                if let Some(entry) = self.entries.get_mut(&spec.id) {
                    entry.spec = spec;
                }
                let _ = reply.send(());
            }
            QueueMsg::Purge { run_spec_id, reply } => {
                self.entries.remove(&run_spec_id);
                if let Err(e) = self.failures.delete(&run_spec_id.to_string()).await {
                    tracing::warn!(run_spec_id = %run_spec_id, error = %e, "failed to clear task failure record");
                }
                let _ = reply.send(());
            }
            QueueMsg::MarkLaunched { run_spec_id, reply } => {
                if let Some(entry) = self.entries.get_mut(&run_spec_id) {
                    entry.pending = entry.pending.saturating_sub(1);
                    entry.in_progress += 1;
                    entry.tokens = entry.tokens.saturating_sub(1);
                }
                let _ = reply.send(());
            }
            QueueMsg::Launchable { reply } => {
                let now = self.clock.now();
                let specs = self
                    .entries
                    .values()
                    .filter(|e| e.is_launchable(now))
                    .map(|e| Arc::clone(&e.spec))
                    .collect();
                let _ = reply.send(specs);
            }
            QueueMsg::Info { run_spec_id, reply } => {
                let _ = reply.send(self.entries.get(&run_spec_id).map(QueuedSpec::info));
            }
            QueueMsg::List { reply } => {
                let _ = reply.send(self.entries.values().map(QueuedSpec::info).collect());
            }
        }
    }

    async fn handle_update(&mut self, update: InstanceUpdate) {
        match update {
            InstanceUpdate::Updated { instance } => {
                if instance.is_running() {
                    self.on_running(&instance);
                } else if instance.state.condition.is_terminal()
                    && instance.state.goal == Goal::Running
                    && instance.reservation.is_none()
                {
                    self.on_failed(&instance).await;
                } else if instance.state.condition
                    == crate::instance::Condition::UnreachableInactive
                    && instance.state.goal == Goal::Running
                    && self.replaced_unreachable.insert(instance.id.clone())
                {
                    // The original stays tracked until its expunge window;
                    // capacity is restored by a replacement now.
                    if let Some(entry) = self.entries.get_mut(instance.run_spec_id()) {
                        entry.pending += 1;
                        tracing::info!(
                            instance_id = %instance.id,
                            "queued replacement for inactive unreachable instance"
                        );
                    }
                }
            }
            InstanceUpdate::Expunged { instance } => {
                // A replaced unreachable instance reaching its expunge is
                // already covered; only unexpected losses requeue.
                if self.replaced_unreachable.remove(&instance.id) {
                    return;
                }
                // Permanently lost instances arrive as straight expunges;
                // re-queue a replacement for those still meant to run.
                if instance.state.goal == Goal::Running
                    && instance.state.condition.is_terminal()
                    && instance.reservation.is_none()
                {
                    self.requeue_replacement(&instance).await;
                }
            }
        }
    }

    fn on_running(&mut self, instance: &Instance) {
        if let Some(entry) = self.entries.get_mut(instance.run_spec_id()) {
            entry.in_progress = entry.in_progress.saturating_sub(1);
            entry.consecutive_failures = 0;
            entry.backoff_until = None;
            entry.tokens = self.max_tokens;
            entry.last_failure = None;
        }
    }

    /// A terminal record still meant to run: log the failure, expunge the
    /// record, and queue a replacement under backoff.
    async fn on_failed(&mut self, instance: &Instance) {
        self.record_failure(instance).await;
        if let Err(e) = self
            .tracker
            .process(InstanceOp::ForceExpunge {
                instance_id: instance.id.clone(),
            })
            .await
        {
            tracing::error!(instance_id = %instance.id, error = %e, "failed to expunge dead instance");
            return;
        }
        // The expunge round-trips through handle_update; the replacement is
        // queued there so both expunge paths behave the same.
    }

    async fn requeue_replacement(&mut self, instance: &Instance) {
        let Some(entry) = self.entries.get_mut(instance.run_spec_id()) else {
            // Not a spec we manage launches for (e.g. removed); ignore.
            return;
        };
        entry.in_progress = entry.in_progress.saturating_sub(1);
        entry.consecutive_failures += 1;
        let delay = entry.spec.backoff.delay(entry.consecutive_failures);
        entry.backoff_until = Some(
            self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1)),
        );
        entry.pending += 1;
        tracing::info!(
            run_spec_id = %instance.run_spec_id(),
            failures = entry.consecutive_failures,
            backoff_secs = delay.as_secs(),
            "queued replacement for failed instance"
        );
    }

    async fn record_failure(&mut self, instance: &Instance) {
        let Some((task_id, task)) = instance
            .tasks
            .iter()
            .find(|(_, t)| t.status.condition.is_terminal())
        else {
            return;
        };
        let failure = TaskFailure {
            run_spec_id: instance.run_spec_id().clone(),
            task_id: task_id.clone(),
            condition: task.status.condition,
            message: format!("task terminated in {}", task.status.condition),
            host: instance.agent.as_ref().map(|a| a.hostname.clone()),
            run_spec_version: instance.run_spec_version,
            timestamp: self.clock.now(),
        };
        if let Some(entry) = self.entries.get_mut(instance.run_spec_id()) {
            entry.last_failure = Some(failure.clone());
        }
        if let Err(e) = self.failures.store(&failure).await {
            tracing::warn!(run_spec_id = %failure.run_spec_id, error = %e, "failed to persist task failure");
        }
    }

}
