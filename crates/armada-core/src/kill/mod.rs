//! The kill service: rate-limited, retrying, batched task kills.
//!
//! A single actor owns a FIFO of pending kills and at most `chunk_size`
//! in-flight kills. Known-lost instances are expunged through the state
//! machine instead of sending a kill the agent can never answer. Kills that
//! stay unanswered are resent on a timer and escalated to a force-expunge
//! after `retry_max` resends. Watchers complete when every requested
//! instance has produced a terminal event.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::time::delay_queue::{DelayQueue, Key};

use crate::driver::SchedulerDriver;
use crate::instance::state_machine::InstanceOp;
use crate::instance::{Condition, Instance, InstanceId, TaskId};
use crate::tracker::{InstanceUpdate, TrackerHandle};

/// Why a kill was requested; logged and attached to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    DeploymentScaling,
    DeploymentStopping,
    Upgrade,
    OverdueTask,
    UnreachableReplacedByNew,
    UnknownTask,
    UserRequest,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeploymentScaling => "deployment_scaling",
            Self::DeploymentStopping => "deployment_stopping",
            Self::Upgrade => "upgrade",
            Self::OverdueTask => "overdue_task",
            Self::UnreachableReplacedByNew => "unreachable_replaced_by_new",
            Self::UnknownTask => "unknown_task",
            Self::UserRequest => "user_request",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct KillConfig {
    /// Kills on the wire at once.
    pub chunk_size: usize,
    /// Resend an unanswered kill after this long.
    pub retry_timeout: Duration,
    /// Resends before escalating to a force-expunge.
    pub retry_max: u32,
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            retry_timeout: Duration::from_secs(10),
            retry_max: 5,
        }
    }
}

enum KillMsg {
    Kill {
        instances: Vec<Instance>,
        reason: KillReason,
    },
    KillUnknown {
        task_id: TaskId,
        reason: KillReason,
    },
    Watch {
        instance_ids: Vec<InstanceId>,
        reply: oneshot::Sender<oneshot::Receiver<()>>,
    },
}

#[derive(Clone)]
pub struct KillServiceHandle {
    tx: mpsc::Sender<KillMsg>,
}

impl KillServiceHandle {
    /// Enqueue kills; completion is observable via [`KillServiceHandle::watch`].
    pub async fn kill(&self, instances: Vec<Instance>, reason: KillReason) {
        let _ = self.tx.send(KillMsg::Kill { instances, reason }).await;
    }

    /// Fire-and-forget variant.
    pub async fn kill_and_forget(&self, instances: Vec<Instance>, reason: KillReason) {
        self.kill(instances, reason).await;
    }

    /// Kill a task the tracker does not know (a stray the bus reported).
    pub async fn kill_unknown(&self, task_id: TaskId, reason: KillReason) {
        let _ = self.tx.send(KillMsg::KillUnknown { task_id, reason }).await;
    }

    /// A signal that fires once every listed instance has terminated (or
    /// immediately for an empty list).
    pub async fn watch(&self, instance_ids: Vec<InstanceId>) -> oneshot::Receiver<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(KillMsg::Watch {
                instance_ids,
                reply,
            })
            .await;
        match rx.await {
            Ok(receiver) => receiver,
            Err(_) => {
                // Actor gone; synthesize an already-fired signal so callers
                // do not hang during shutdown.
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(());
                rx
            }
        }
    }

    /// Kill and wait for every instance to terminate.
    pub async fn kill_and_wait(&self, instances: Vec<Instance>, reason: KillReason) {
        let ids: Vec<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
        let done = self.watch(ids).await;
        self.kill(instances, reason).await;
        let _ = done.await;
    }
}

struct InFlight {
    retries: u32,
    timer: Key,
}

struct Watcher {
    remaining: HashSet<InstanceId>,
    tx: Option<oneshot::Sender<()>>,
}

pub struct KillService {
    driver: Arc<dyn SchedulerDriver>,
    tracker: TrackerHandle,
    config: KillConfig,
}

impl KillService {
    pub fn new(
        driver: Arc<dyn SchedulerDriver>,
        tracker: TrackerHandle,
        config: KillConfig,
    ) -> Self {
        Self {
            driver,
            tracker,
            config,
        }
    }

    pub fn spawn(self) -> KillServiceHandle {
        let (tx, rx) = mpsc::channel(256);
        let updates = self.tracker.updates();
        tokio::spawn(self.run(rx, updates));
        KillServiceHandle { tx }
    }

    async fn run(
        self,
        mut rx: mpsc::Receiver<KillMsg>,
        mut updates: tokio::sync::broadcast::Receiver<InstanceUpdate>,
    ) {
        let mut pending: VecDeque<InstanceId> = VecDeque::new();
        let mut in_flight: HashMap<InstanceId, InFlight> = HashMap::new();
        let mut timers: DelayQueue<InstanceId> = DelayQueue::new();
        let mut watchers: Vec<Watcher> = Vec::new();

        enum Wake {
            Msg(KillMsg),
            Update(InstanceUpdate),
            Timer(InstanceId),
            Stop,
        }

        loop {
            // Resolve the wake reason first; the state handling below needs
            // `timers` back, which the expiry future borrows.
            let wake = {
                let timer_active = !timers.is_empty();
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(msg) => Wake::Msg(msg),
                        None => Wake::Stop,
                    },
                    update = updates.recv() => match update {
                        Ok(update) => Wake::Update(update),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "kill service lagged behind tracker updates");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => Wake::Stop,
                    },
                    expired = futures::future::poll_fn(|cx| timers.poll_expired(cx)), if timer_active => {
                        match expired {
                            Some(expired) => Wake::Timer(expired.into_inner()),
                            None => continue,
                        }
                    }
                }
            };

            match wake {
                Wake::Stop => break,
                Wake::Msg(KillMsg::Kill { instances, reason }) => {
                    for instance in instances {
                        let id = instance.id.clone();
                        if in_flight.contains_key(&id) || pending.contains(&id) {
                            continue;
                        }
                        tracing::info!(instance_id = %id, reason = %reason, "kill enqueued");
                        pending.push_back(id);
                    }
                }
                Wake::Msg(KillMsg::KillUnknown { task_id, reason }) => {
                    tracing::info!(task_id = %task_id, reason = %reason, "killing unknown task");
                    if let Err(e) = self.driver.kill_task(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "kill of unknown task failed");
                    }
                }
                Wake::Msg(KillMsg::Watch { instance_ids, reply }) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    // Only instances that still exist and are not yet
                    // terminal block the signal.
                    let remaining: HashSet<InstanceId> = instance_ids
                        .into_iter()
                        .filter(|id| {
                            self.tracker
                                .get(id)
                                .is_some_and(|i| !i.state.condition.is_terminal())
                        })
                        .collect();
                    if remaining.is_empty() {
                        let _ = done_tx.send(());
                    } else {
                        watchers.push(Watcher {
                            remaining,
                            tx: Some(done_tx),
                        });
                    }
                    let _ = reply.send(done_rx);
                }
                Wake::Update(update) => {
                    let (id, terminal) = match &update {
                        InstanceUpdate::Updated { instance } => {
                            (instance.id.clone(), instance.state.condition.is_terminal())
                        }
                        InstanceUpdate::Expunged { instance } => (instance.id.clone(), true),
                    };
                    if terminal {
                        if let Some(flight) = in_flight.remove(&id) {
                            timers.remove(&flight.timer);
                        }
                        for watcher in &mut watchers {
                            watcher.remaining.remove(&id);
                            if watcher.remaining.is_empty() {
                                if let Some(tx) = watcher.tx.take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                        watchers.retain(|w| w.tx.is_some());
                    }
                }
                Wake::Timer(id) => {
                    if let Some(flight) = in_flight.get_mut(&id) {
                        flight.retries += 1;
                        if flight.retries > self.config.retry_max {
                            tracing::warn!(
                                instance_id = %id,
                                retries = flight.retries - 1,
                                "kill retries exhausted, force-expunging"
                            );
                            in_flight.remove(&id);
                            if let Err(e) = self
                                .tracker
                                .process(InstanceOp::ForceExpunge { instance_id: id.clone() })
                                .await
                            {
                                tracing::error!(instance_id = %id, error = %e, "escalation expunge failed");
                            }
                        } else {
                            tracing::debug!(instance_id = %id, retry = flight.retries, "resending kill");
                            self.send_kills(&id).await;
                            flight.timer = timers.insert(id.clone(), self.config.retry_timeout);
                        }
                    }
                }
            }

            // Top up the in-flight window from the FIFO.
            while in_flight.len() < self.config.chunk_size {
                let Some(id) = pending.pop_front() else { break };
                match self.tracker.get(&id) {
                    None => continue,
                    Some(instance) if instance.state.condition.is_terminal() => continue,
                    Some(instance) if is_known_lost(&instance) => {
                        // The agent cannot answer a kill; expunge directly.
                        tracing::info!(instance_id = %id, "known-lost instance, expunging instead of killing");
                        if let Err(e) = self
                            .tracker
                            .process(InstanceOp::ForceExpunge { instance_id: id.clone() })
                            .await
                        {
                            tracing::error!(instance_id = %id, error = %e, "expunge of lost instance failed");
                        }
                    }
                    Some(_) => {
                        self.send_kills(&id).await;
                        let timer = timers.insert(id.clone(), self.config.retry_timeout);
                        in_flight.insert(id, InFlight { retries: 0, timer });
                    }
                }
            }
        }
        tracing::debug!("kill service actor stopped");
    }

    async fn send_kills(&self, id: &InstanceId) {
        let Some(instance) = self.tracker.get(id) else {
            return;
        };
        for task_id in instance.tasks.keys() {
            if let Err(e) = self.driver.kill_task(task_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "kill send failed; the retry timer covers it");
            }
        }
    }
}

/// Conditions the agent will never answer a kill for.
fn is_known_lost(instance: &Instance) -> bool {
    matches!(
        instance.state.condition,
        Condition::Unreachable | Condition::UnreachableInactive | Condition::Unknown
    )
}
