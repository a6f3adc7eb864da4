//! The instance tracker: single writer over all instance state.
//!
//! One actor owns the in-memory index and is the only code that mutates
//! instances while this process leads. Ops run through the pure state
//! machine; every non-noop effect is persisted before its events reach any
//! subscriber. A persistence failure is retried with bounded backoff and, if
//! it sticks, the in-memory record is reloaded from the repository so memory
//! never drifts ahead of the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use armada_store::{retrying, Repository, RetryPolicy, StoreError};

use crate::clock::Clock;
use crate::events::EventBus;
use crate::instance::state_machine::{self, Effect, InstanceOp};
use crate::instance::{Goal, Instance, InstanceId};
use crate::spec::path::PathId;

/// Immutable view of all known instances, grouped by run-spec.
pub type InstancesSnapshot = Arc<BTreeMap<PathId, BTreeMap<InstanceId, Instance>>>;

/// Delta published after each applied effect.
#[derive(Debug, Clone)]
pub enum InstanceUpdate {
    Updated { instance: Instance },
    Expunged { instance: Instance },
}

impl InstanceUpdate {
    pub fn instance(&self) -> &Instance {
        match self {
            Self::Updated { instance } | Self::Expunged { instance } => instance,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("instance op failed persistence after retries: {0}")]
    Persistence(#[from] StoreError),

    #[error("tracker is shut down")]
    ShutDown,
}

enum TrackerMsg {
    Process {
        op: InstanceOp,
        reply: oneshot::Sender<Result<Effect, TrackerError>>,
    },
}

/// Cheap-to-clone handle to the tracker actor.
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerMsg>,
    snapshot_rx: watch::Receiver<InstancesSnapshot>,
    updates_tx: broadcast::Sender<InstanceUpdate>,
    clock: Arc<dyn Clock>,
}

impl TrackerHandle {
    /// Apply one op; the only mutation path.
    pub async fn process(&self, op: InstanceOp) -> Result<Effect, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerMsg::Process { op, reply })
            .await
            .map_err(|_| TrackerError::ShutDown)?;
        rx.await.map_err(|_| TrackerError::ShutDown)?
    }

    /// Convenience wrapper building a `ChangeGoal` op.
    pub async fn set_goal(&self, id: InstanceId, goal: Goal) -> Result<Effect, TrackerError> {
        self.process(InstanceOp::ChangeGoal {
            instance_id: id,
            goal,
            now: self.clock.now(),
        })
        .await
    }

    /// The last published snapshot; consistent, lock-free.
    pub fn snapshot(&self) -> InstancesSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.snapshot()
            .get(&id.run_spec_id)
            .and_then(|m| m.get(id))
            .cloned()
    }

    pub fn spec_instances(&self, run_spec_id: &PathId) -> Vec<Instance> {
        self.snapshot()
            .get(run_spec_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Count of tasks currently in `Running` across a run-spec.
    pub fn tasks_running(&self, run_spec_id: &PathId) -> usize {
        self.spec_instances(run_spec_id)
            .iter()
            .map(|i| i.tasks_running())
            .sum()
    }

    /// Subscribe to per-op deltas. Events are published strictly after the
    /// corresponding durable write.
    pub fn updates(&self) -> broadcast::Receiver<InstanceUpdate> {
        self.updates_tx.subscribe()
    }
}

/// The tracker actor. Construct with [`InstanceTracker::load`], then
/// [`InstanceTracker::spawn`].
pub struct InstanceTracker {
    repo: Repository<Instance>,
    retry: RetryPolicy,
    bus: EventBus,
    index: BTreeMap<PathId, BTreeMap<InstanceId, Instance>>,
}

impl InstanceTracker {
    /// Load every persisted instance; called on leadership acquisition.
    pub async fn load(
        repo: Repository<Instance>,
        bus: EventBus,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let mut index: BTreeMap<PathId, BTreeMap<InstanceId, Instance>> = BTreeMap::new();
        for instance in repo.all().await? {
            index
                .entry(instance.run_spec_id().clone())
                .or_default()
                .insert(instance.id.clone(), instance);
        }
        let total: usize = index.values().map(BTreeMap::len).sum();
        tracing::info!(instances = total, specs = index.len(), "instance tracker loaded");
        Ok(Self {
            repo,
            retry,
            bus,
            index,
        })
    }

    pub fn spawn(self, clock: Arc<dyn Clock>) -> TrackerHandle {
        let (tx, rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(self.index.clone()));
        let (updates_tx, _) = broadcast::channel(1024);
        let handle = TrackerHandle {
            tx,
            snapshot_rx,
            updates_tx: updates_tx.clone(),
            clock,
        };
        tokio::spawn(self.run(rx, snapshot_tx, updates_tx));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<TrackerMsg>,
        snapshot_tx: watch::Sender<InstancesSnapshot>,
        updates_tx: broadcast::Sender<InstanceUpdate>,
    ) {
        while let Some(msg) = rx.recv().await {
            match msg {
                TrackerMsg::Process { op, reply } => {
                    let result = self.apply(op, &updates_tx).await;
                    if result.is_ok() {
                        let _ = snapshot_tx.send(Arc::new(self.index.clone()));
                    }
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!("instance tracker actor stopped");
    }

    fn current(&self, id: &InstanceId) -> Option<&Instance> {
        self.index.get(&id.run_spec_id).and_then(|m| m.get(id))
    }

    async fn apply(
        &mut self,
        op: InstanceOp,
        updates_tx: &broadcast::Sender<InstanceUpdate>,
    ) -> Result<Effect, TrackerError> {
        let instance_id = op.instance_id().clone();
        let effect = state_machine::process(self.current(&instance_id), op);

        match &effect {
            Effect::Update { instance, events, .. } => {
                if let Err(e) = self.persist_store(instance).await {
                    self.reload(&instance_id).await;
                    return Err(e);
                }
                self.index
                    .entry(instance.run_spec_id().clone())
                    .or_default()
                    .insert(instance.id.clone(), instance.clone());
                let _ = updates_tx.send(InstanceUpdate::Updated {
                    instance: instance.clone(),
                });
                self.bus.publish_all(events.iter().cloned());
            }
            Effect::Expunge { instance, events } => {
                if let Err(e) = self.persist_delete(instance).await {
                    self.reload(&instance_id).await;
                    return Err(e);
                }
                self.remove_from_index(&instance.id);
                let _ = updates_tx.send(InstanceUpdate::Expunged {
                    instance: instance.clone(),
                });
                self.bus.publish_all(events.iter().cloned());
            }
            Effect::Noop { .. } => {}
            Effect::Failure { instance_id, reason } => {
                tracing::warn!(instance_id = %instance_id, reason = %reason, "instance op rejected");
            }
        }
        Ok(effect)
    }

    async fn persist_store(&self, instance: &Instance) -> Result<(), TrackerError> {
        let repo = &self.repo;
        retrying(&self.retry, || async move { repo.store(instance).await })
            .await
            .map_err(TrackerError::from)
    }

    async fn persist_delete(&self, instance: &Instance) -> Result<(), TrackerError> {
        let repo = &self.repo;
        let id = instance.id.to_string();
        retrying(&self.retry, || {
            let id = id.clone();
            async move { repo.delete(&id).await }
        })
        .await
        .map_err(TrackerError::from)
    }

    fn remove_from_index(&mut self, id: &InstanceId) {
        let now_empty = match self.index.get_mut(&id.run_spec_id) {
            Some(per_spec) => {
                per_spec.remove(id);
                per_spec.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove(&id.run_spec_id);
        }
    }

    /// After a final persistence failure, rehydrate the record from the
    /// repository so memory matches the durable truth.
    async fn reload(&mut self, id: &InstanceId) {
        match self.repo.get(&id.to_string()).await {
            Ok(Some(instance)) => {
                self.index
                    .entry(instance.run_spec_id().clone())
                    .or_default()
                    .insert(instance.id.clone(), instance);
            }
            Ok(None) => {
                self.remove_from_index(id);
            }
            Err(e) => {
                tracing::error!(instance_id = %id, error = %e, "reload after failed persistence also failed");
            }
        }
    }
}
