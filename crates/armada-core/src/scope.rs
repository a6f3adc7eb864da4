//! The leader scope: everything that only exists while this process leads.
//!
//! Constructed on leadership acquisition and dropped (via its cancellation
//! token) on loss. Owns the desired-state tree, the persisted records for
//! run-specs and groups, the framework-id holder, the event-subscriber
//! registry, and the handles of every leader-only actor. The REST adapter
//! talks to this type and nothing else.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use armada_store::{CoordinationStore, Migrator, Repository, RetryPolicy};

use crate::clock::Clock;
use crate::config::Config;
use crate::deploy::executor::{
    DeployError, DeploymentManager, DeploymentManagerHandle, DeploymentSummary, StoredPlan,
};
use crate::deploy::supervisor::SupervisorCtx;
use crate::deploy::{plan as make_plan, DeploymentPlan, ReadinessResult};
use crate::driver::{FrameworkId, Offer, SchedulerDriver, SchedulerEvent};
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::instance::state_machine::InstanceOp;
use crate::instance::{Goal, Instance, InstanceId, TaskId};
use crate::kill::{KillReason, KillService, KillServiceHandle};
use crate::launch::launcher::{OfferProcessor, OfferProcessorConfig, SpecSource};
use crate::launch::queue::{LaunchQueue, LaunchQueueHandle};
use crate::launch::revive::spawn_revive_signaller;
use crate::launch::{QueueInfo, TaskFailure};
use crate::leader::Leadership;
use crate::reconcile::{spawn_overdue_loop, spawn_reconciliation_tracker};
use crate::spec::validation::{validate_group, validate_run_spec};
use crate::spec::{Group, PathId, RunSpec};
use crate::tracker::{InstanceTracker, TrackerHandle};

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// An app run-spec at rest, versions retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppRecord(pub RunSpec);

impl armada_store::Record for AppRecord {
    const CATEGORY: &'static str = "apps";

    fn record_id(&self) -> String {
        self.0.id.to_string()
    }

    fn record_version(&self) -> Option<DateTime<Utc>> {
        Some(self.0.version)
    }
}

/// A pod run-spec at rest, versions retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodRecord(pub RunSpec);

impl armada_store::Record for PodRecord {
    const CATEGORY: &'static str = "pods";

    fn record_id(&self) -> String {
        self.0.id.to_string()
    }

    fn record_version(&self) -> Option<DateTime<Utc>> {
        Some(self.0.version)
    }
}

/// The root group at rest, versions retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootGroupRecord(pub Group);

impl armada_store::Record for RootGroupRecord {
    const CATEGORY: &'static str = "groups";

    fn record_id(&self) -> String {
        "root".to_string()
    }

    fn record_version(&self) -> Option<DateTime<Utc>> {
        Some(self.0.version)
    }
}

/// The framework id handed out by the bus on first registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkIdRecord {
    pub id: String,
}

impl armada_store::Record for FrameworkIdRecord {
    const CATEGORY: &'static str = "framework-id";

    fn record_id(&self) -> String {
        "framework-id".to_string()
    }
}

/// Persisted HTTP-callback event subscribers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventSubscribers {
    pub callback_urls: Vec<String>,
}

impl armada_store::Record for EventSubscribers {
    const CATEGORY: &'static str = "event-subscribers";

    fn record_id(&self) -> String {
        "subscribers".to_string()
    }
}

// ---------------------------------------------------------------------------
// Spec resolution for the offer processor
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct GroupSpecSource {
    root: Arc<RwLock<Group>>,
}

impl SpecSource for GroupSpecSource {
    fn get_spec(&self, id: &PathId) -> Option<Arc<RunSpec>> {
        self.root
            .read()
            .expect("root group lock poisoned")
            .find_run_spec(id)
            .cloned()
            .map(Arc::new)
    }
}

// ---------------------------------------------------------------------------
// Leader scope
// ---------------------------------------------------------------------------

pub struct LeaderScope {
    config: Config,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    tracker: TrackerHandle,
    queue: LaunchQueueHandle,
    kill: KillServiceHandle,
    deployments: DeploymentManagerHandle,
    offer_processor: OfferProcessor,
    readiness_tx: broadcast::Sender<ReadinessResult>,
    root: Arc<RwLock<Group>>,
    apps: Repository<AppRecord>,
    pods: Repository<PodRecord>,
    groups: Repository<RootGroupRecord>,
    framework_ids: Repository<FrameworkIdRecord>,
    subscribers: Repository<EventSubscribers>,
    framework_id: RwLock<Option<FrameworkId>>,
    cancel: CancellationToken,
}

impl LeaderScope {
    /// Build the full leader-side world: migrate storage, load state, and
    /// spawn every leader-only actor. Called once per leadership term.
    pub async fn start(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        driver: Arc<dyn SchedulerDriver>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
    ) -> Result<Self, CoreError> {
        config.validate().map_err(|e| CoreError::Fatal(e.to_string()))?;
        let root_path = config.coordination.chroot.clone();
        let cancel = CancellationToken::new();

        // Storage format first; refusing to run on a future version.
        Migrator::new(Arc::clone(&store), &root_path)
            .migrate()
            .await?;

        let apps: Repository<AppRecord> = Repository::new(Arc::clone(&store), &root_path);
        let pods: Repository<PodRecord> = Repository::new(Arc::clone(&store), &root_path);
        let groups: Repository<RootGroupRecord> = Repository::new(Arc::clone(&store), &root_path);
        let framework_ids: Repository<FrameworkIdRecord> =
            Repository::new(Arc::clone(&store), &root_path);
        let subscribers: Repository<EventSubscribers> =
            Repository::new(Arc::clone(&store), &root_path);

        let root_group = match groups.get("/root").await? {
            Some(record) => record.0,
            None => Group::empty_root(clock.now()),
        };
        let root = Arc::new(RwLock::new(root_group.clone()));

        let tracker = InstanceTracker::load(
            Repository::new(Arc::clone(&store), &root_path),
            bus.clone(),
            RetryPolicy::default(),
        )
        .await?
        .spawn(Arc::clone(&clock));

        let queue = LaunchQueue::new(
            tracker.clone(),
            Repository::new(Arc::clone(&store), &root_path),
            Arc::clone(&clock),
            config.launch_tokens,
        )
        .spawn();

        let kill = KillService::new(Arc::clone(&driver), tracker.clone(), config.kill_config())
            .spawn();

        let (readiness_tx, _) = broadcast::channel(256);
        let supervisor_ctx = SupervisorCtx {
            tracker: tracker.clone(),
            queue: queue.clone(),
            kill: kill.clone(),
            readiness_tx: readiness_tx.clone(),
            cancel: cancel.child_token(),
        };
        let manager = DeploymentManager::new(
            supervisor_ctx,
            Repository::<StoredPlan>::new(Arc::clone(&store), &root_path),
            bus.clone(),
            config.max_queued_root_group_updates,
        );
        let recovered = manager.recover(root_group.version).await?;
        let deployments = manager.spawn(recovered);

        let offer_processor = OfferProcessor::new(
            queue.clone(),
            tracker.clone(),
            Arc::clone(&driver),
            Arc::new(GroupSpecSource { root: Arc::clone(&root) }),
            Arc::clone(&clock),
            OfferProcessorConfig {
                match_config: config.match_config(),
                decline_wait: config.decline_wait(),
                reservation_wait: config.reservation_wait(),
            },
        );

        let (candidates_tx, reconcile_demand) = spawn_reconciliation_tracker(
            tracker.clone(),
            Arc::clone(&driver),
            kill.clone(),
            config.reconcile_config(),
            cancel.child_token(),
        );
        let _overdue = spawn_overdue_loop(
            tracker.clone(),
            candidates_tx,
            Arc::clone(&clock),
            config.reconcile_config(),
            cancel.child_token(),
        );
        let _revive = spawn_revive_signaller(
            Arc::clone(&driver),
            config.revive_config(),
            queue.demand(),
            reconcile_demand,
            cancel.child_token(),
        );

        let scope = Self {
            config,
            clock,
            bus,
            tracker,
            queue,
            kill,
            deployments,
            offer_processor,
            readiness_tx,
            root,
            apps,
            pods,
            groups,
            framework_ids,
            subscribers,
            framework_id: RwLock::new(None),
            cancel,
        };
        scope.reconcile_desired_counts().await;
        Ok(scope)
    }

    /// After failover, queue launches for specs whose active instance count
    /// fell below the declared target while no deployment owns them.
    async fn reconcile_desired_counts(&self) {
        let root = self.root_group();
        let owned: std::collections::BTreeSet<PathId> = self
            .deployments
            .list()
            .await
            .into_iter()
            .flat_map(|d| d.affected)
            .collect();
        for spec in root.transitive_run_specs() {
            if owned.contains(&spec.id) {
                continue;
            }
            let active = self
                .tracker
                .spec_instances(&spec.id)
                .iter()
                .filter(|i| i.is_active())
                .count() as u32;
            if active < spec.instances {
                let missing = spec.instances - active;
                tracing::info!(run_spec_id = %spec.id, missing, "queueing launches to reach declared count");
                self.queue.add(Arc::new(spec.clone()), missing).await;
            }
        }
    }

    /// Tear down every leader-only task. The tracker and queue actors stop
    /// when their handles drop.
    pub fn shut_down(&self) {
        self.cancel.cancel();
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn tracker(&self) -> &TrackerHandle {
        &self.tracker
    }

    pub fn kill_service(&self) -> &KillServiceHandle {
        &self.kill
    }

    /// Forward a readiness probe result into the deployment supervisors.
    pub fn report_readiness(&self, result: ReadinessResult) {
        let _ = self.readiness_tx.send(result);
    }

    pub fn root_group(&self) -> Group {
        self.root.read().expect("root group lock poisoned").clone()
    }

    // -- scheduler callbacks ------------------------------------------------

    /// Entry point for every inbound bus callback.
    pub async fn handle_scheduler_event(&self, event: SchedulerEvent) -> Result<(), CoreError> {
        match event {
            SchedulerEvent::Registered { framework_id, master } => {
                tracing::info!(master = %master, framework_id = %framework_id.0, "registered with offer bus");
                self.register_framework(framework_id).await
            }
            SchedulerEvent::Reregistered { master } => {
                tracing::info!(master = %master, "re-registered with offer bus");
                Ok(())
            }
            SchedulerEvent::Disconnected => {
                tracing::warn!("disconnected from offer bus");
                Ok(())
            }
            SchedulerEvent::Offers(offers) => {
                self.process_offers(offers).await;
                Ok(())
            }
            SchedulerEvent::OfferRescinded(offer_id) => {
                tracing::debug!(offer_id = ?offer_id, "offer rescinded");
                Ok(())
            }
            SchedulerEvent::StatusUpdate(status) => self.handle_status(status).await,
            SchedulerEvent::AgentLost(agent_id) => {
                tracing::warn!(agent_id = ?agent_id, "agent lost; statuses will follow");
                Ok(())
            }
            SchedulerEvent::ExecutorLost { agent_id, executor_id } => {
                tracing::warn!(agent_id = ?agent_id, executor_id = %executor_id, "executor lost");
                Ok(())
            }
            SchedulerEvent::FrameworkMessage { agent_id, .. } => {
                tracing::debug!(agent_id = ?agent_id, "framework message ignored");
                Ok(())
            }
            SchedulerEvent::Error(message) => {
                Err(CoreError::Fatal(format!("offer bus error: {message}")))
            }
        }
    }

    async fn process_offers(&self, offers: Vec<Offer>) {
        self.offer_processor.process_offers(offers).await;
    }

    async fn handle_status(
        &self,
        status: crate::driver::BusTaskStatus,
    ) -> Result<(), CoreError> {
        let known = self
            .tracker
            .get(&status.task_id.instance_id)
            .is_some_and(|i| i.tasks.contains_key(&status.task_id));
        if !known {
            // A stray task (e.g. returned after its instance was expunged):
            // terminal reports are dropped, live ones get a kill.
            if status_is_live(&status) {
                tracing::info!(task_id = %status.task_id, "killing stray task unknown to the tracker");
                self.kill
                    .kill_unknown(status.task_id.clone(), KillReason::UnknownTask)
                    .await;
            } else {
                self.bus.publish(Event::UnknownTaskTerminated {
                    task_id: status.task_id,
                });
            }
            return Ok(());
        }
        let now = self.clock.now();
        self.tracker
            .process(InstanceOp::StatusUpdate { status, now })
            .await?;
        Ok(())
    }

    async fn register_framework(&self, framework_id: FrameworkId) -> Result<(), CoreError> {
        if let Some(stored) = self.framework_ids.get("framework-id").await? {
            if stored.id != framework_id.0 {
                return Err(CoreError::Fatal(format!(
                    "framework id mismatch: stored {}, bus assigned {}",
                    stored.id, framework_id.0
                )));
            }
        } else {
            self.framework_ids
                .store(&FrameworkIdRecord {
                    id: framework_id.0.clone(),
                })
                .await?;
        }
        *self.framework_id.write().expect("framework id lock poisoned") = Some(framework_id);
        Ok(())
    }

    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.framework_id
            .read()
            .expect("framework id lock poisoned")
            .clone()
    }

    // -- desired-state writes ----------------------------------------------

    /// Create or replace a run-spec; returns the deployment driving the
    /// change.
    pub async fn upsert_run_spec(
        &self,
        mut spec: RunSpec,
        force: bool,
    ) -> Result<Uuid, CoreError> {
        let version = self.clock.now();
        spec.version = version;
        validate_run_spec(&spec)?;

        let original = self.root_group();
        let mut target = original.clone();
        target.put_run_spec(spec.clone(), version);
        target.enforce_roles(self.config.group_role_behavior);
        validate_group(&target)?;

        self.apply_target(original, target, version, force).await
    }

    /// Remove a run-spec; the plan stops its instances first.
    pub async fn remove_run_spec(&self, id: &PathId, force: bool) -> Result<Uuid, CoreError> {
        let version = self.clock.now();
        let original = self.root_group();
        let mut target = original.clone();
        if target.remove_run_spec(id, version).is_none() {
            return Err(CoreError::NotFound(id.to_string()));
        }
        self.apply_target(original, target, version, force).await
    }

    /// Replace a whole subtree (group-atomic update).
    pub async fn update_group(&self, group: Group, force: bool) -> Result<Uuid, CoreError> {
        let version = self.clock.now();
        let original = self.root_group();
        let mut target = original.clone();
        target.put_group(group, version);
        target.enforce_roles(self.config.group_role_behavior);
        validate_group(&target)?;
        self.apply_target(original, target, version, force).await
    }

    async fn apply_target(
        &self,
        original: Group,
        mut target: Group,
        version: DateTime<Utc>,
        force: bool,
    ) -> Result<Uuid, CoreError> {
        target.version = version;
        let plan = make_plan(&original, &target, Uuid::now_v7(), version)?;

        // Persist specs and tree before execution so a failover resumes
        // against the new desired state.
        for spec in target.transitive_run_specs() {
            if original.find_run_spec(&spec.id) == Some(spec) {
                continue;
            }
            match spec.kind {
                crate::spec::RunSpecKind::App => {
                    self.apps.store(&AppRecord(spec.clone())).await?;
                }
                crate::spec::RunSpecKind::Pod => {
                    self.pods.store(&PodRecord(spec.clone())).await?;
                }
            }
        }
        self.groups.store(&RootGroupRecord(target.clone())).await?;
        {
            let mut root = self.root.write().expect("root group lock poisoned");
            *root = target.clone();
        }
        self.bus.publish(Event::GroupChanged {
            group_id: target.id.clone(),
            version,
        });

        if plan.is_empty() {
            return Ok(plan.id);
        }
        let id = self
            .deployments
            .submit(plan, force)
            .await
            .map_err(CoreError::from)?;
        Ok(id)
    }

    // -- deployments --------------------------------------------------------

    pub async fn list_deployments(&self) -> Vec<DeploymentSummary> {
        self.deployments.list().await
    }

    pub async fn cancel_deployment(&self, id: Uuid, rollback: bool) -> Result<(), CoreError> {
        self.deployments
            .cancel(id, rollback)
            .await
            .map_err(CoreError::from)
    }

    /// Submit an externally built plan (tests and the group adapter).
    pub async fn submit_plan(&self, plan: DeploymentPlan, force: bool) -> Result<Uuid, DeployError> {
        self.deployments.submit(plan, force).await
    }

    // -- instance-level kills ----------------------------------------------

    /// Kill instances. `scale` folds the removal into the declared counts
    /// (producing a scale deployment); `wipe` additionally decommissions
    /// resident instances, releasing their reservations.
    pub async fn kill_instances(
        &self,
        ids: Vec<InstanceId>,
        scale: bool,
        wipe: bool,
    ) -> Result<Option<Uuid>, CoreError> {
        let mut instances: Vec<Instance> = Vec::new();
        for id in &ids {
            match self.tracker.get(id) {
                Some(instance) => instances.push(instance),
                None => return Err(CoreError::NotFound(id.to_string())),
            }
        }

        if scale {
            // Shrink the declared counts; the scale supervisors do the
            // killing with proper goal handling.
            let version = self.clock.now();
            let original = self.root_group();
            let mut target = original.clone();
            let mut by_spec: BTreeMap<PathId, u32> = BTreeMap::new();
            for instance in &instances {
                *by_spec.entry(instance.run_spec_id().clone()).or_insert(0) += 1;
            }
            for (spec_id, remove) in by_spec {
                let Some(spec) = original.find_run_spec(&spec_id) else {
                    continue;
                };
                let mut updated = spec.clone();
                updated.instances = spec.instances.saturating_sub(remove);
                target.put_run_spec(updated, version);
            }
            let id = self.apply_target(original, target, version, false).await?;
            return Ok(Some(id));
        }

        if wipe {
            // Decommission first so the expunge path releases reservations.
            for instance in &instances {
                self.tracker
                    .set_goal(instance.id.clone(), Goal::Decommissioned)
                    .await?;
            }
        }
        self.kill.kill(instances, KillReason::UserRequest).await;
        Ok(None)
    }

    /// Kill a single task by id (optionally with scale-down).
    pub async fn kill_task(&self, task_id: &TaskId, scale: bool) -> Result<Option<Uuid>, CoreError> {
        self.kill_instances(vec![task_id.instance_id.clone()], scale, false)
            .await
    }

    // -- queue surface ------------------------------------------------------

    pub async fn queue_info(&self) -> Vec<QueueInfo> {
        self.queue.list().await
    }

    pub async fn last_task_failure(&self, id: &PathId) -> Option<TaskFailure> {
        self.queue.info(id.clone()).await.and_then(|i| i.last_failure)
    }

    // -- event subscribers --------------------------------------------------

    pub async fn subscribe_callback(&self, url: String) -> Result<(), CoreError> {
        let mut current = self
            .subscribers
            .get("subscribers")
            .await?
            .unwrap_or_default();
        if !current.callback_urls.contains(&url) {
            current.callback_urls.push(url.clone());
            self.subscribers.store(&current).await?;
        }
        self.bus.publish(Event::EventSubscriberAdded { callback_url: url });
        Ok(())
    }

    pub async fn unsubscribe_callback(&self, url: &str) -> Result<(), CoreError> {
        let mut current = self
            .subscribers
            .get("subscribers")
            .await?
            .unwrap_or_default();
        current.callback_urls.retain(|u| u != url);
        self.subscribers.store(&current).await?;
        self.bus.publish(Event::EventSubscriberRemoved {
            callback_url: url.to_string(),
        });
        Ok(())
    }

    pub async fn callback_subscribers(&self) -> Result<Vec<String>, CoreError> {
        Ok(self
            .subscribers
            .get("subscribers")
            .await?
            .unwrap_or_default()
            .callback_urls)
    }
}

/// Whether a status reports a task that is still alive somewhere.
fn status_is_live(status: &crate::driver::BusTaskStatus) -> bool {
    use crate::driver::BusTaskState as S;
    matches!(
        status.state,
        S::Staging | S::Starting | S::Running | S::Killing | S::Unreachable
    )
}

/// Guard used by the non-leader path: reject writes with the current
/// leader's address when known.
pub fn require_leader(
    leadership: Leadership,
    leader_info: Option<String>,
) -> Result<(), CoreError> {
    if leadership == Leadership::Leading {
        Ok(())
    } else {
        Err(CoreError::NotLeader { leader: leader_info })
    }
}
