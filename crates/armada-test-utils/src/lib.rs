//! Shared fixtures for armada integration tests.
//!
//! Builders for run-specs and offers, a recording driver double, status
//! helpers, and [`TestCluster`]: a whole leader scope over the in-memory
//! store with a hand-driven clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use armada_core::clock::{Clock, ManualClock};
use armada_core::config::Config;
use armada_core::driver::{
    AgentId, Attribute, AttributeValue, BusTaskReason, BusTaskState, BusTaskStatus, DriverError,
    Offer, OfferId, OfferOperation, OfferedResource, SchedulerDriver,
};
use armada_core::events::EventBus;
use armada_core::instance::TaskId;
use armada_core::scope::LeaderScope;
use armada_core::spec::{
    BackoffPolicy, ContainerSpec, Endpoint, HealthCheck, Protocol, Resources, RunSpec,
    RunSpecKind, UnreachableStrategy, UpgradeStrategy, VolumeSpec, UNRESERVED_ROLE,
};
use armada_store::MemoryStore;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Install a test subscriber honoring `RUST_LOG`; safe to call from every
/// test, only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Run-spec builder
// ---------------------------------------------------------------------------

pub struct RunSpecBuilder {
    spec: RunSpec,
}

pub fn app(id: &str) -> RunSpecBuilder {
    RunSpecBuilder {
        spec: RunSpec {
            id: id.parse().expect("invalid path in test"),
            kind: RunSpecKind::App,
            version: ts(0),
            instances: 1,
            role: UNRESERVED_ROLE.to_string(),
            containers: vec![ContainerSpec {
                name: "main".to_string(),
                resources: Resources::new(0.1, 32.0),
                image: None,
                command: Some("sleep 3600".to_string()),
                args: Vec::new(),
                endpoints: Vec::new(),
                health_check: None,
                volume_mounts: Vec::new(),
            }],
            volumes: Vec::new(),
            networks: Vec::new(),
            constraints: Vec::new(),
            upgrade_strategy: UpgradeStrategy::default(),
            backoff: BackoffPolicy::default(),
            readiness_checks: Vec::new(),
            dependencies: Vec::new(),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            accepted_resource_roles: None,
            require_ports: false,
            unreachable_strategy: UnreachableStrategy::Disabled,
            artifact_uris: Vec::new(),
        },
    }
}

impl RunSpecBuilder {
    pub fn instances(mut self, count: u32) -> Self {
        self.spec.instances = count;
        self
    }

    pub fn resources(mut self, cpus: f64, mem_mb: f64) -> Self {
        self.spec.containers[0].resources = Resources::new(cpus, mem_mb);
        self
    }

    pub fn version(mut self, at: DateTime<Utc>) -> Self {
        self.spec.version = at;
        self
    }

    /// Add `count` dynamically allocated host ports.
    pub fn dynamic_ports(mut self, count: usize) -> Self {
        for i in 0..count {
            self.spec.containers[0].endpoints.push(Endpoint {
                name: format!("port-{i}"),
                container_port: None,
                host_port: Some(0),
                protocol: Protocol::Tcp,
            });
        }
        self
    }

    pub fn upgrade(mut self, min_healthy: f64, max_over: f64) -> Self {
        self.spec.upgrade_strategy = UpgradeStrategy {
            minimum_health_capacity: min_healthy,
            maximum_over_capacity: max_over,
        };
        self
    }

    pub fn backoff(mut self, base: Duration, factor: f64, max: Duration) -> Self {
        self.spec.backoff = BackoffPolicy { base, factor, max };
        self
    }

    pub fn health_check(mut self) -> Self {
        self.spec.containers[0].endpoints.push(Endpoint {
            name: "health".to_string(),
            container_port: Some(8080),
            host_port: Some(0),
            protocol: Protocol::Tcp,
        });
        self.spec.containers[0].health_check = Some(HealthCheck::default());
        self
    }

    pub fn unreachable(mut self, inactive_after: Duration, expunge_after: Duration) -> Self {
        self.spec.unreachable_strategy = UnreachableStrategy::Enabled {
            inactive_after,
            expunge_after,
        };
        self
    }

    pub fn persistent_volume(mut self, name: &str, size_mb: u64) -> Self {
        self.spec.volumes.push(VolumeSpec::PersistentLocal {
            name: name.to_string(),
            size_mb,
        });
        self.spec.containers[0].resources.disk_mb += size_mb as f64;
        self
    }

    pub fn role(mut self, role: &str) -> Self {
        self.spec.role = role.to_string();
        self
    }

    pub fn depends_on(mut self, path: &str) -> Self {
        self.spec.dependencies.push(path.parse().expect("invalid path"));
        self
    }

    pub fn build(self) -> RunSpec {
        self.spec
    }
}

// ---------------------------------------------------------------------------
// Offer builder
// ---------------------------------------------------------------------------

pub struct OfferBuilder {
    offer: Offer,
}

pub fn offer(id: &str, hostname: &str) -> OfferBuilder {
    OfferBuilder {
        offer: Offer {
            id: OfferId(id.to_string()),
            agent_id: AgentId(format!("agent-{hostname}")),
            hostname: hostname.to_string(),
            resources: Vec::new(),
            attributes: Vec::new(),
        },
    }
}

impl OfferBuilder {
    pub fn cpus(mut self, amount: f64) -> Self {
        self.offer
            .resources
            .push(OfferedResource::scalar("cpus", UNRESERVED_ROLE, amount));
        self
    }

    pub fn mem(mut self, amount: f64) -> Self {
        self.offer
            .resources
            .push(OfferedResource::scalar("mem", UNRESERVED_ROLE, amount));
        self
    }

    pub fn disk(mut self, amount: f64) -> Self {
        self.offer
            .resources
            .push(OfferedResource::scalar("disk", UNRESERVED_ROLE, amount));
        self
    }

    pub fn ports(mut self, lo: u64, hi: u64) -> Self {
        self.offer
            .resources
            .push(OfferedResource::ports(UNRESERVED_ROLE, vec![(lo, hi)]));
        self
    }

    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.offer.attributes.push(Attribute {
            name: name.to_string(),
            value: AttributeValue::Text(value.to_string()),
        });
        self
    }

    pub fn resource(mut self, resource: OfferedResource) -> Self {
        self.offer.resources.push(resource);
        self
    }

    pub fn build(self) -> Offer {
        self.offer
    }
}

/// A comfortably large offer most tests can launch from.
pub fn big_offer(id: &str, hostname: &str) -> Offer {
    offer(id, hostname)
        .cpus(32.0)
        .mem(65536.0)
        .disk(65536.0)
        .ports(31000, 32000)
        .build()
}

// ---------------------------------------------------------------------------
// Status helpers
// ---------------------------------------------------------------------------

pub fn task_status(task_id: &TaskId, state: BusTaskState, at: DateTime<Utc>) -> BusTaskStatus {
    BusTaskStatus {
        task_id: task_id.clone(),
        state,
        reason: None,
        message: None,
        healthy: None,
        agent_id: None,
        timestamp: at,
    }
}

pub fn running_status(task_id: &TaskId, at: DateTime<Utc>) -> BusTaskStatus {
    task_status(task_id, BusTaskState::Running, at)
}

pub fn healthy_running_status(task_id: &TaskId, at: DateTime<Utc>) -> BusTaskStatus {
    let mut status = running_status(task_id, at);
    status.healthy = Some(true);
    status
}

pub fn lost_status(
    task_id: &TaskId,
    reason: BusTaskReason,
    at: DateTime<Utc>,
) -> BusTaskStatus {
    let mut status = task_status(task_id, BusTaskState::Lost, at);
    status.reason = Some(reason);
    status
}

// ---------------------------------------------------------------------------
// Recording driver
// ---------------------------------------------------------------------------

/// A [`SchedulerDriver`] double that records every outbound call.
#[derive(Default)]
pub struct RecordingDriver {
    pub accepts: Mutex<Vec<(OfferId, Vec<OfferOperation>)>>,
    pub declines: Mutex<Vec<OfferId>>,
    pub kills: Mutex<Vec<TaskId>>,
    pub reconciles: Mutex<Vec<Vec<TaskId>>>,
    pub revives: Mutex<u32>,
    pub suppresses: Mutex<u32>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Task ids of every Launch operation accepted so far.
    pub fn launched_task_ids(&self) -> Vec<TaskId> {
        self.accepts
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, ops)| ops.iter())
            .filter_map(|op| match op {
                OfferOperation::Launch { tasks } => {
                    Some(tasks.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn launch_op_count(&self) -> usize {
        self.accepts
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, ops)| ops.iter())
            .filter(|op| matches!(op, OfferOperation::Launch { .. }))
            .count()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.lock().unwrap().len()
    }
}

#[async_trait]
impl SchedulerDriver for RecordingDriver {
    async fn accept_offer(
        &self,
        offer_id: &OfferId,
        operations: Vec<OfferOperation>,
    ) -> Result<(), DriverError> {
        self.accepts
            .lock()
            .unwrap()
            .push((offer_id.clone(), operations));
        Ok(())
    }

    async fn decline_offer(
        &self,
        offer_id: &OfferId,
        _refuse: Duration,
    ) -> Result<(), DriverError> {
        self.declines.lock().unwrap().push(offer_id.clone());
        Ok(())
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError> {
        self.kills.lock().unwrap().push(task_id.clone());
        Ok(())
    }

    async fn reconcile_tasks(&self, task_ids: Vec<TaskId>) -> Result<(), DriverError> {
        self.reconciles.lock().unwrap().push(task_ids);
        Ok(())
    }

    async fn revive_offers(&self) -> Result<(), DriverError> {
        *self.revives.lock().unwrap() += 1;
        Ok(())
    }

    async fn suppress_offers(&self) -> Result<(), DriverError> {
        *self.suppresses.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cluster harness
// ---------------------------------------------------------------------------

/// A complete leader scope over the in-memory store, ready for scenarios.
pub struct TestCluster {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub bus: EventBus,
    pub driver: Arc<RecordingDriver>,
    pub scope: LeaderScope,
}

/// Config tuned for tests: no suppress thrash, short waits.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.min_revive_offers_interval_secs = 0;
    config.reservation_wait_secs = 120;
    config
}

impl TestCluster {
    pub async fn start() -> Self {
        init_test_logging();
        Self::start_with(test_config(), MemoryStore::new(), ManualClock::at(ts(0))).await
    }

    /// Start over an existing store and clock; used to simulate failover by
    /// building a second cluster on the same store.
    pub async fn start_with(config: Config, store: MemoryStore, clock: ManualClock) -> Self {
        let bus = EventBus::new();
        let driver = RecordingDriver::new();
        let scope = LeaderScope::start(
            config,
            Arc::new(store.clone()),
            driver.clone(),
            Arc::new(clock.clone()),
            bus.clone(),
        )
        .await
        .expect("leader scope start");
        Self {
            store,
            clock,
            bus,
            driver,
            scope,
        }
    }

    /// Push one offer through the scheduler-event entry point.
    pub async fn send_offer(&self, offer: Offer) {
        self.scope
            .handle_scheduler_event(armada_core::driver::SchedulerEvent::Offers(vec![offer]))
            .await
            .expect("offer handling");
    }

    /// Deliver a status update from the bus.
    pub async fn send_status(&self, status: BusTaskStatus) {
        self.scope
            .handle_scheduler_event(armada_core::driver::SchedulerEvent::StatusUpdate(status))
            .await
            .expect("status handling");
    }

    /// Report every task launched on the wire so far as Running (and
    /// healthy, so deployments with health checks progress).
    pub async fn confirm_all_running(&self) {
        let at = self.clock.now();
        for task_id in self.driver.launched_task_ids() {
            if self
                .scope
                .tracker()
                .get(&task_id.instance_id)
                .is_some_and(|i| i.tasks.contains_key(&task_id))
            {
                self.send_status(healthy_running_status(&task_id, at)).await;
            }
        }
    }

    /// Let the actors drain their inboxes.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
