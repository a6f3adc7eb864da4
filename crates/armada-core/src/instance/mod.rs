//! Instances and tasks: the scheduled incarnations of a run-spec.
//!
//! An instance holds one task per app, or one per container for pods. The
//! instance condition is always a pure function of its task conditions
//! ([`condition::resolve`]); mutations happen only through the state machine
//! in [`state_machine`].

pub mod condition;
pub mod state_machine;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::driver::Attribute;
use crate::spec::path::PathId;
use crate::spec::{RunSpec, UnreachableStrategy};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one scheduled incarnation of a run-spec.
///
/// Rendered as `<path-safe-id>.instance-<uuid>`; the uuid is time-ordered
/// (v7) so instance ids sort by creation time within a run-spec.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId {
    pub run_spec_id: PathId,
    pub uuid: Uuid,
}

impl InstanceId {
    /// Mint a fresh time-ordered id for `run_spec_id`.
    pub fn new(run_spec_id: PathId) -> Self {
        Self {
            run_spec_id,
            uuid: Uuid::now_v7(),
        }
    }

    /// The task id for `container` within this instance.
    pub fn task_id(&self, container: &str) -> TaskId {
        TaskId {
            instance_id: self.clone(),
            container: container.to_string(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.instance-{}", self.run_spec_id.safe_id(), self.uuid)
    }
}

/// Error parsing an [`InstanceId`] or [`TaskId`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid id: {0:?}")]
pub struct IdParseError(pub String);

impl FromStr for InstanceId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let marker = ".instance-";
        let at = s.rfind(marker).ok_or_else(|| IdParseError(s.to_string()))?;
        let run_spec_id = PathId::from_safe_id(&s[..at]).map_err(|_| IdParseError(s.to_string()))?;
        let uuid = Uuid::parse_str(&s[at + marker.len()..])
            .map_err(|_| IdParseError(s.to_string()))?;
        Ok(Self { run_spec_id, uuid })
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// Identifier of the offer-bus-visible unit: instance id plus the container
/// discriminator. Rendered `<instance-id>.<container>`; container names
/// contain no `.`, so the rendering parses back unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub instance_id: InstanceId,
    pub container: String,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.instance_id, self.container)
    }
}

impl FromStr for TaskId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let at = s.rfind('.').ok_or_else(|| IdParseError(s.to_string()))?;
        let container = s[at + 1..].to_string();
        if container.is_empty() || container.contains('.') {
            return Err(IdParseError(s.to_string()));
        }
        let instance_id: InstanceId = s[..at].parse()?;
        Ok(Self {
            instance_id,
            container,
        })
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Conditions and goals
// ---------------------------------------------------------------------------

/// Observed state of an instance or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Scheduled,
    Provisioned,
    Reserved,
    Created,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Failed,
    Finished,
    Error,
    Gone,
    Dropped,
    Unreachable,
    UnreachableInactive,
    Unknown,
}

impl Condition {
    /// Conditions from which a task never comes back.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::Failed
                | Self::Finished
                | Self::Killed
                | Self::Gone
                | Self::Dropped
                | Self::Unknown
        )
    }

    pub fn is_unreachable(self) -> bool {
        matches!(self, Self::Unreachable | Self::UnreachableInactive)
    }

    /// Conditions that occupy capacity on an agent.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Provisioned
                | Self::Created
                | Self::Staging
                | Self::Starting
                | Self::Running
                | Self::Killing
                | Self::Unreachable
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Provisioned => "provisioned",
            Self::Reserved => "reserved",
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Killing => "killing",
            Self::Killed => "killed",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Gone => "gone",
            Self::Dropped => "dropped",
            Self::Unreachable => "unreachable",
            Self::UnreachableInactive => "unreachable_inactive",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Operator intent for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Keep it running; relaunch on failure.
    Running,
    /// Terminate but keep the record (and any reservation).
    Stopped,
    /// Terminate and expunge, releasing reservations.
    Decommissioned,
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Decommissioned => "decommissioned",
        })
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// A task's tracked status, updated from bus status updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub condition: Condition,
    pub staged_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last health report, if any task-level health source reported.
    pub healthy: Option<bool>,
    /// When the current condition was entered.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub host_ports: Vec<u16>,
    pub status: TaskStatus,
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    /// Reserved, never launched. The timeout bounds how long we wait for
    /// the launch to happen.
    New { deadline: Option<DateTime<Utc>> },
    /// A task is (or was last known) running on the reservation.
    Launched,
    /// The last task terminated; resources stay reserved until relaunch or
    /// timeout.
    Suspended { deadline: Option<DateTime<Utc>> },
}

impl ReservationState {
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::New { deadline } | Self::Suspended { deadline } => *deadline,
            Self::Launched => None,
        }
    }
}

/// A persistent claim on agent-local resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Ids of the local volumes created under this reservation.
    pub volume_ids: Vec<String>,
    pub state: ReservationState,
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Placement information filled in once the instance is matched to an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub agent_id: Option<String>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    /// When the current condition was entered.
    pub since: DateTime<Utc>,
    pub goal: Goal,
    /// `None` when no task reports health.
    pub healthy: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub run_spec_version: DateTime<Utc>,
    pub agent: Option<AgentInfo>,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
    pub reservation: Option<Reservation>,
    pub unreachable_strategy: UnreachableStrategy,
}

impl Instance {
    pub fn run_spec_id(&self) -> &PathId {
        &self.id.run_spec_id
    }

    pub fn has_reservation(&self) -> bool {
        self.reservation.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.state.condition == Condition::Running
    }

    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    pub fn tasks_running(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.condition == Condition::Running)
            .count()
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.condition.is_terminal())
    }

    /// Whether this instance (goal and tasks considered) should count as a
    /// launch the scheduler still owes the spec.
    pub fn is_scheduled(&self) -> bool {
        self.state.condition == Condition::Scheduled
    }

    /// Healthy iff running and the health flag is not negative. Specs
    /// without health checks report `healthy = None` and count as healthy.
    pub fn is_considered_healthy(&self) -> bool {
        self.is_running() && self.state.healthy != Some(false)
    }
}

/// Build the task skeletons for launching `spec` on an agent.
///
/// One task per container, in container order, each in `Staging` condition
/// with its slice of the allocated host ports.
pub fn tasks_for_launch(
    spec: &RunSpec,
    instance_id: &InstanceId,
    host_ports: &[u16],
    now: DateTime<Utc>,
) -> BTreeMap<TaskId, Task> {
    let mut tasks = BTreeMap::new();
    let mut remaining = host_ports;
    for container in &spec.containers {
        let demand = container
            .endpoints
            .iter()
            .filter(|e| e.host_port.is_some())
            .count();
        let (mine, rest) = remaining.split_at(demand.min(remaining.len()));
        remaining = rest;
        let id = instance_id.task_id(&container.name);
        tasks.insert(
            id.clone(),
            Task {
                id,
                host_ports: mine.to_vec(),
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
    tasks
}

impl armada_store::Record for Instance {
    const CATEGORY: &'static str = "instances";

    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathId {
        s.parse().unwrap()
    }

    #[test]
    fn instance_id_roundtrip() {
        let id = InstanceId::new(path("/prod/web.v2/frontend"));
        let rendered = id.to_string();
        let parsed: InstanceId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn instance_ids_sort_by_creation_within_spec() {
        let a = InstanceId::new(path("/app"));
        let b = InstanceId::new(path("/app"));
        assert!(a.uuid < b.uuid, "v7 uuids are time-ordered");
    }

    #[test]
    fn task_id_roundtrip() {
        let instance = InstanceId::new(path("/prod/web"));
        let task = instance.task_id("main");
        let parsed: TaskId = task.to_string().parse().unwrap();
        assert_eq!(parsed, task);
        assert_eq!(parsed.instance_id, instance);
        assert_eq!(parsed.container, "main");
    }

    #[test]
    fn id_parse_rejects_garbage() {
        assert!("not-an-id".parse::<InstanceId>().is_err());
        assert!("app.instance-nope".parse::<InstanceId>().is_err());
    }

    #[test]
    fn condition_classification() {
        assert!(Condition::Failed.is_terminal());
        assert!(Condition::Gone.is_terminal());
        assert!(!Condition::Unreachable.is_terminal());
        assert!(Condition::Unreachable.is_unreachable());
        assert!(Condition::UnreachableInactive.is_unreachable());
        assert!(Condition::Running.is_active());
        assert!(!Condition::Scheduled.is_active());
        assert!(!Condition::Reserved.is_active());
    }

    #[test]
    fn serde_ids_as_strings() {
        let id = InstanceId::new(path("/a/b"));
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"a_b.instance-"));
        let back: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn reservation_deadline_accessor() {
        let now = Utc::now();
        assert_eq!(
            ReservationState::New { deadline: Some(now) }.deadline(),
            Some(now)
        );
        assert_eq!(ReservationState::Launched.deadline(), None);
        assert_eq!(
            ReservationState::Suspended { deadline: None }.deadline(),
            None
        );
    }
}
