//! The offer processor: multiplexes incoming offers across everything that
//! wants resources.
//!
//! Demand comes from two places: instances holding a reservation that needs
//! (re)launching, and the launch queue's pending counts. The first demand
//! that matches consumes the offer; everything else falls through and the
//! offer is declined with a short filter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::driver::{
    LocalVolume, Offer, OfferOperation, OfferedResource, ReservationLabels, SchedulerDriver,
    TaskLaunch,
};
use crate::instance::state_machine::InstanceOp;
use crate::instance::{
    tasks_for_launch, AgentInfo, Condition, Goal, Instance, InstanceId, InstanceState, Reservation,
    ReservationState, Task, TaskId, TaskStatus,
};
use crate::launch::queue::LaunchQueueHandle;
use crate::matcher::{match_offer, LaunchKind, MatchConfig, ResourceMatch};
use crate::spec::path::PathId;
use crate::spec::{RunSpec, VolumeSpec};
use crate::tracker::TrackerHandle;

/// Resolves the current revision of a run-spec; backed by the deployed
/// group tree.
pub trait SpecSource: Send + Sync {
    fn get_spec(&self, id: &PathId) -> Option<Arc<RunSpec>>;
}

impl SpecSource for BTreeMap<PathId, Arc<RunSpec>> {
    fn get_spec(&self, id: &PathId) -> Option<Arc<RunSpec>> {
        self.get(id).cloned()
    }
}

/// What happened to one offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Consumed to launch a fresh instance.
    Launched { run_spec_id: PathId },
    /// Consumed to reserve resources and create volumes.
    Reserved { instance_id: InstanceId },
    /// Consumed to relaunch onto an existing reservation.
    LaunchedOnReservation { instance_id: InstanceId },
    /// Consumed to release reservations whose instance no longer exists.
    UnreservedStale,
    Declined,
}

#[derive(Debug, Clone)]
pub struct OfferProcessorConfig {
    pub match_config: MatchConfig,
    /// Filter attached to declines; keeps refused agents quiet briefly.
    pub decline_wait: Duration,
    /// Deadline granted to a fresh reservation before the overdue loop
    /// times it out.
    pub reservation_wait: Duration,
}

impl Default for OfferProcessorConfig {
    fn default() -> Self {
        Self {
            match_config: MatchConfig::default(),
            decline_wait: Duration::from_secs(5),
            reservation_wait: Duration::from_secs(120),
        }
    }
}

pub struct OfferProcessor {
    queue: LaunchQueueHandle,
    tracker: TrackerHandle,
    driver: Arc<dyn SchedulerDriver>,
    specs: Arc<dyn SpecSource>,
    clock: Arc<dyn Clock>,
    config: OfferProcessorConfig,
}

impl OfferProcessor {
    pub fn new(
        queue: LaunchQueueHandle,
        tracker: TrackerHandle,
        driver: Arc<dyn SchedulerDriver>,
        specs: Arc<dyn SpecSource>,
        clock: Arc<dyn Clock>,
        config: OfferProcessorConfig,
    ) -> Self {
        Self {
            queue,
            tracker,
            driver,
            specs,
            clock,
            config,
        }
    }

    pub async fn process_offers(&self, offers: Vec<Offer>) -> Vec<OfferOutcome> {
        let mut outcomes = Vec::with_capacity(offers.len());
        for offer in offers {
            outcomes.extend(self.process_offer(offer).await);
        }
        outcomes
    }

    /// Present one offer to all demand. One offer can carry several
    /// launches: matching repeats against the not-yet-consumed remainder
    /// and every resulting operation goes out in a single accept.
    pub async fn process_offer(&self, offer: Offer) -> Vec<OfferOutcome> {
        // Reservations whose instance was expunged must be given back, or
        // the resources stay locked to this framework forever.
        if let Some(outcome) = self.unreserve_stale(&offer).await {
            return vec![outcome];
        }

        let mut remaining = offer.clone();
        let mut operations: Vec<OfferOperation> = Vec::new();
        let mut outcomes: Vec<OfferOutcome> = Vec::new();

        loop {
            // Reservations waiting for a launch get first claim: their
            // resources are already earmarked in the offer.
            let consumed = if let Some((ops, consumed, outcome)) =
                self.try_reservations(&remaining).await
            {
                operations.extend(ops);
                outcomes.push(outcome);
                consumed
            } else if let Some((ops, consumed, outcome)) = self.try_queue(&remaining).await {
                operations.extend(ops);
                outcomes.push(outcome);
                consumed
            } else {
                break;
            };
            subtract_consumed(&mut remaining, &consumed);
        }

        if operations.is_empty() {
            if let Err(e) = self
                .driver
                .decline_offer(&offer.id, self.config.decline_wait)
                .await
            {
                tracing::warn!(offer_id = ?offer.id, error = %e, "declining offer failed");
            }
            return vec![OfferOutcome::Declined];
        }

        if let Err(e) = self.driver.accept_offer(&offer.id, operations).await {
            tracing::error!(
                offer_id = ?offer.id,
                error = %e,
                "accept failed after launches were recorded; reconciliation will settle them"
            );
        }
        outcomes
    }

    async fn try_queue(
        &self,
        offer: &Offer,
    ) -> Option<(Vec<OfferOperation>, Vec<OfferedResource>, OfferOutcome)> {
        for spec in self.queue.launchable().await {
            let running = self.tracker.spec_instances(&spec.id);
            let Some(matched) = match_offer(
                &spec,
                offer,
                &running,
                None,
                &self.config.match_config,
                &mut rand::rng(),
            ) else {
                continue;
            };
            let result = match matched.kind {
                LaunchKind::Ephemeral => self.launch_ephemeral(&spec, offer, &matched).await,
                LaunchKind::ReserveAndCreate => self.reserve(&spec, offer, &matched).await,
                LaunchKind::OnReservation => unreachable!("no reservation passed to matcher"),
            };
            if let Some((ops, outcome)) = result {
                return Some((ops, matched.consumed, outcome));
            }
        }
        None
    }

    async fn unreserve_stale(&self, offer: &Offer) -> Option<OfferOutcome> {
        let stale: Vec<OfferedResource> = offer
            .resources
            .iter()
            .filter(|r| {
                r.reservation
                    .as_ref()
                    .and_then(|labels| labels.instance_id.as_ref())
                    .and_then(|owner| owner.parse::<InstanceId>().ok())
                    .is_some_and(|id| self.tracker.get(&id).is_none())
            })
            .cloned()
            .collect();
        if stale.is_empty() {
            return None;
        }

        let volumes: Vec<LocalVolume> = stale
            .iter()
            .filter_map(|r| {
                r.persistence_id.as_ref().map(|id| LocalVolume {
                    id: id.clone(),
                    container_path: String::new(),
                    size_mb: 0,
                    role: r.role.clone(),
                })
            })
            .collect();
        let mut operations = Vec::new();
        if !volumes.is_empty() {
            operations.push(OfferOperation::DestroyVolumes { volumes });
        }
        operations.push(OfferOperation::Unreserve { resources: stale });
        tracing::info!(offer_id = ?offer.id, "releasing reservations of expunged instances");
        if let Err(e) = self.driver.accept_offer(&offer.id, operations).await {
            tracing::warn!(offer_id = ?offer.id, error = %e, "unreserve of stale reservation failed");
        }
        Some(OfferOutcome::UnreservedStale)
    }

    async fn try_reservations(
        &self,
        offer: &Offer,
    ) -> Option<(Vec<OfferOperation>, Vec<OfferedResource>, OfferOutcome)> {
        let snapshot = self.tracker.snapshot();
        for (spec_id, instances) in snapshot.iter() {
            for instance in instances.values() {
                if !wants_relaunch_on_reservation(instance) {
                    continue;
                }
                let Some(spec) = self.specs.get_spec(spec_id) else {
                    continue;
                };
                let running = self.tracker.spec_instances(spec_id);
                let Some(matched) = match_offer(
                    &spec,
                    offer,
                    &running,
                    Some(&instance.id),
                    &self.config.match_config,
                    &mut rand::rng(),
                ) else {
                    continue;
                };
                if let Some((ops, outcome)) = self
                    .launch_on_reservation(&spec, instance, offer, &matched)
                    .await
                {
                    return Some((ops, matched.consumed, outcome));
                }
            }
        }
        None
    }

    async fn launch_ephemeral(
        &self,
        spec: &RunSpec,
        offer: &Offer,
        matched: &ResourceMatch,
    ) -> Option<(Vec<OfferOperation>, OfferOutcome)> {
        let now = self.clock.now();
        let instance_id = InstanceId::new(spec.id.clone());
        let tasks = tasks_for_launch(spec, &instance_id, &matched.host_ports, now);
        let instance = Instance {
            id: instance_id.clone(),
            run_spec_version: spec.version,
            agent: Some(agent_info(offer)),
            state: InstanceState {
                condition: Condition::Staging,
                since: now,
                goal: Goal::Running,
                healthy: None,
            },
            tasks: tasks.clone(),
            reservation: None,
            unreachable_strategy: spec.unreachable_strategy,
        };

        let effect = self
            .tracker
            .process(InstanceOp::LaunchEphemeral { instance })
            .await;
        if let Err(e) = effect {
            tracing::error!(run_spec_id = %spec.id, error = %e, "launch aborted: tracker op failed");
            return None;
        }

        let operations = vec![OfferOperation::Launch {
            tasks: task_launches(offer, matched, tasks.keys()),
        }];
        self.queue.mark_launched(spec.id.clone()).await;
        tracing::info!(run_spec_id = %spec.id, instance_id = %instance_id, "launching instance");
        Some((
            operations,
            OfferOutcome::Launched {
                run_spec_id: spec.id.clone(),
            },
        ))
    }

    async fn reserve(
        &self,
        spec: &RunSpec,
        offer: &Offer,
        matched: &ResourceMatch,
    ) -> Option<(Vec<OfferOperation>, OfferOutcome)> {
        let now = self.clock.now();
        let instance_id = InstanceId::new(spec.id.clone());
        let deadline = now
            + chrono::Duration::from_std(self.config.reservation_wait)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let volumes = local_volumes(spec, &instance_id);
        let instance = Instance {
            id: instance_id.clone(),
            run_spec_version: spec.version,
            agent: Some(agent_info(offer)),
            state: InstanceState {
                condition: Condition::Reserved,
                since: now,
                goal: Goal::Running,
                healthy: None,
            },
            tasks: reserved_placeholder_tasks(spec, &instance_id, now),
            reservation: Some(Reservation {
                volume_ids: volumes.iter().map(|v| v.id.clone()).collect(),
                state: ReservationState::New {
                    deadline: Some(deadline),
                },
            }),
            unreachable_strategy: spec.unreachable_strategy,
        };

        if let Err(e) = self.tracker.process(InstanceOp::Reserve { instance }).await {
            tracing::error!(run_spec_id = %spec.id, error = %e, "reserve aborted: tracker op failed");
            return None;
        }

        let reserved: Vec<OfferedResource> = matched
            .consumed
            .iter()
            .map(|r| OfferedResource {
                role: spec.role.clone(),
                reservation: Some(ReservationLabels {
                    instance_id: Some(instance_id.to_string()),
                }),
                ..r.clone()
            })
            .collect();
        let mut operations = vec![OfferOperation::Reserve { resources: reserved }];
        if !volumes.is_empty() {
            operations.push(OfferOperation::CreateVolumes { volumes });
        }
        self.queue.mark_launched(spec.id.clone()).await;
        tracing::info!(run_spec_id = %spec.id, instance_id = %instance_id, "reserving resources");
        Some((operations, OfferOutcome::Reserved { instance_id }))
    }

    async fn launch_on_reservation(
        &self,
        spec: &RunSpec,
        existing: &Instance,
        offer: &Offer,
        matched: &ResourceMatch,
    ) -> Option<(Vec<OfferOperation>, OfferOutcome)> {
        let now = self.clock.now();
        let tasks = tasks_for_launch(spec, &existing.id, &matched.host_ports, now);
        let effect = self
            .tracker
            .process(InstanceOp::LaunchOnReservation {
                instance_id: existing.id.clone(),
                run_spec_version: spec.version,
                agent: agent_info(offer),
                tasks: tasks.clone(),
                now,
            })
            .await;
        if let Err(e) = effect {
            tracing::error!(instance_id = %existing.id, error = %e, "relaunch aborted: tracker op failed");
            return None;
        }

        let operations = vec![OfferOperation::Launch {
            tasks: task_launches(offer, matched, tasks.keys()),
        }];
        tracing::info!(instance_id = %existing.id, "launching on reservation");
        Some((
            operations,
            OfferOutcome::LaunchedOnReservation {
                instance_id: existing.id.clone(),
            },
        ))
    }
}

/// Remove consumed slices from the remaining offer so the next match sees
/// only what is left.
fn subtract_consumed(offer: &mut Offer, consumed: &[OfferedResource]) {
    for used in consumed {
        for resource in offer.resources.iter_mut() {
            if resource.name != used.name
                || resource.role != used.role
                || resource.reservation != used.reservation
            {
                continue;
            }
            match (&mut resource.value, &used.value) {
                (
                    crate::driver::ResourceValue::Scalar(have),
                    crate::driver::ResourceValue::Scalar(take),
                ) => {
                    *have = (*have - take).max(0.0);
                }
                (
                    crate::driver::ResourceValue::Ranges(have),
                    crate::driver::ResourceValue::Ranges(take),
                ) => {
                    *have = subtract_ranges(have, take);
                }
                _ => {}
            }
            break;
        }
    }
    offer.resources.retain(|r| match &r.value {
        crate::driver::ResourceValue::Scalar(v) => *v > 0.0,
        crate::driver::ResourceValue::Ranges(ranges) => !ranges.is_empty(),
        crate::driver::ResourceValue::Set(items) => !items.is_empty(),
    });
}

fn subtract_ranges(have: &[(u64, u64)], take: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = have.to_vec();
    for &(t_lo, t_hi) in take {
        let mut next = Vec::with_capacity(out.len() + 1);
        for (lo, hi) in out {
            if t_hi < lo || t_lo > hi {
                next.push((lo, hi));
                continue;
            }
            if lo < t_lo {
                next.push((lo, t_lo - 1));
            }
            if t_hi < hi {
                next.push((t_hi + 1, hi));
            }
        }
        out = next;
    }
    out
}

/// A reservation with no live task and the intent to run wants an offer.
fn wants_relaunch_on_reservation(instance: &Instance) -> bool {
    if instance.state.goal != Goal::Running {
        return false;
    }
    match &instance.reservation {
        Some(reservation) => matches!(
            reservation.state,
            ReservationState::New { .. } | ReservationState::Suspended { .. }
        ),
        None => false,
    }
}

fn agent_info(offer: &Offer) -> AgentInfo {
    AgentInfo {
        hostname: offer.hostname.clone(),
        agent_id: Some(offer.agent_id.0.clone()),
        attributes: offer.attributes.clone(),
    }
}

fn task_launches<'a, I>(offer: &Offer, matched: &ResourceMatch, task_ids: I) -> Vec<TaskLaunch>
where
    I: IntoIterator<Item = &'a TaskId>,
{
    task_ids
        .into_iter()
        .map(|task_id| TaskLaunch {
            task_id: task_id.clone(),
            agent_id: offer.agent_id.clone(),
            resources: matched.consumed.clone(),
            host_ports: matched.host_ports.clone(),
        })
        .collect()
}

fn local_volumes(spec: &RunSpec, instance_id: &InstanceId) -> Vec<LocalVolume> {
    spec.volumes
        .iter()
        .filter_map(|v| match v {
            VolumeSpec::PersistentLocal { name, size_mb } => Some(LocalVolume {
                id: format!("{name}#{instance_id}"),
                container_path: name.clone(),
                size_mb: *size_mb,
                role: spec.role.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Placeholder tasks keeping a reserved instance's condition derivable from
/// its task map.
fn reserved_placeholder_tasks(
    spec: &RunSpec,
    instance_id: &InstanceId,
    now: DateTime<Utc>,
) -> BTreeMap<TaskId, Task> {
    let mut tasks = BTreeMap::new();
    for container in &spec.containers {
        let id = instance_id.task_id(&container.name);
        tasks.insert(
            id.clone(),
            Task {
                id,
                host_ports: Vec::new(),
                status: TaskStatus {
                    condition: Condition::Reserved,
                    staged_at: now,
                    started_at: None,
                    healthy: None,
                    since: now,
                },
            },
        );
    }
    tasks
}
