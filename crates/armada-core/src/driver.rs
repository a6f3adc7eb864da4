//! The offer-bus driver boundary.
//!
//! Inbound callbacks arrive as [`SchedulerEvent`] values; outbound calls go
//! through the [`SchedulerDriver`] trait. The wire encoding lives in an
//! adapter; the core only sees these record types.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::TaskId;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkId(pub String);

// ---------------------------------------------------------------------------
// Offers
// ---------------------------------------------------------------------------

/// A typed agent attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Scalar(f64),
    Ranges(Vec<(u64, u64)>),
    Set(BTreeSet<String>),
}

impl AttributeValue {
    /// The textual projection constraints are evaluated against.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Scalar(v) => {
                if v.fract() == 0.0 {
                    format!("{}", *v as i64)
                } else {
                    format!("{v}")
                }
            }
            Self::Ranges(ranges) => ranges
                .iter()
                .map(|(lo, hi)| format!("[{lo}-{hi}]"))
                .collect::<Vec<_>>()
                .join(","),
            Self::Set(items) => format!("{{{}}}", items.iter().cloned().collect::<Vec<_>>().join(",")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<(u64, u64)>),
    Set(BTreeSet<String>),
}

/// Ties a reserved resource back to the instance that reserved it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLabels {
    pub instance_id: Option<String>,
}

/// One resource inside an offer, keeping the role it is offered under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedResource {
    pub name: String,
    pub role: String,
    pub value: ResourceValue,
    /// Present on dynamically reserved resources.
    pub reservation: Option<ReservationLabels>,
    /// Present on disk resources backing a persistent local volume.
    pub persistence_id: Option<String>,
}

impl OfferedResource {
    pub fn scalar(name: &str, role: &str, amount: f64) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            value: ResourceValue::Scalar(amount),
            reservation: None,
            persistence_id: None,
        }
    }

    pub fn ports(role: &str, ranges: Vec<(u64, u64)>) -> Self {
        Self {
            name: "ports".to_string(),
            role: role.to_string(),
            value: ResourceValue::Ranges(ranges),
            reservation: None,
            persistence_id: None,
        }
    }

    pub fn is_unreserved(&self) -> bool {
        self.role == crate::spec::UNRESERVED_ROLE
    }
}

/// A resource advertisement from the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Vec<OfferedResource>,
    pub attributes: Vec<Attribute>,
}

impl Offer {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

/// Task states reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusTaskState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Error,
    Lost,
    Gone,
    GoneByOperator,
    Dropped,
    Unreachable,
    Unknown,
}

/// Reasons qualifying a lost/failed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusTaskReason {
    AgentDisconnected,
    AgentRemoved,
    AgentRestarted,
    NetworkPartition,
    CommandExecutorFailed,
    ExecutorTerminated,
    KilledDuringLaunch,
    GarbageCollected,
    Reconciliation,
}

impl BusTaskReason {
    /// Whether a lost task with this reason may still come back.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::AgentDisconnected
                | Self::AgentRestarted
                | Self::NetworkPartition
                | Self::Reconciliation
        )
    }
}

/// A status update from the bus for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusTaskStatus {
    pub task_id: TaskId,
    pub state: BusTaskState,
    pub reason: Option<BusTaskReason>,
    pub message: Option<String>,
    /// Health as reported by a bus-level health check, when one ran.
    pub healthy: Option<bool>,
    pub agent_id: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outbound operations
// ---------------------------------------------------------------------------

/// A local volume to create on reserved disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub id: String,
    pub container_path: String,
    pub size_mb: u64,
    pub role: String,
}

/// Everything needed to start one task on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLaunch {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub resources: Vec<OfferedResource>,
    pub host_ports: Vec<u16>,
}

/// Operations applied to an accepted offer, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OfferOperation {
    Reserve { resources: Vec<OfferedResource> },
    Unreserve { resources: Vec<OfferedResource> },
    CreateVolumes { volumes: Vec<LocalVolume> },
    DestroyVolumes { volumes: Vec<LocalVolume> },
    Launch { tasks: Vec<TaskLaunch> },
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver is not connected to the bus")]
    Disconnected,

    #[error("driver call failed: {0}")]
    Io(String),
}

/// Outbound calls to the bus. A single sender task owns the connection; the
/// trait object is shared behind an `Arc`.
#[async_trait]
pub trait SchedulerDriver: Send + Sync {
    /// Consume an offer with the given operations (reserve, create volumes,
    /// launch). An empty operation list is equivalent to a decline.
    async fn accept_offer(
        &self,
        offer_id: &OfferId,
        operations: Vec<OfferOperation>,
    ) -> Result<(), DriverError>;

    /// Return an offer unused; the bus withholds offers for this agent for
    /// `refuse` before re-offering.
    async fn decline_offer(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError>;

    async fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError>;

    /// Ask the bus to re-send the authoritative status of `task_ids`; empty
    /// means all tasks of the framework (implicit reconciliation).
    async fn reconcile_tasks(&self, task_ids: Vec<TaskId>) -> Result<(), DriverError>;

    async fn revive_offers(&self) -> Result<(), DriverError>;

    async fn suppress_offers(&self) -> Result<(), DriverError>;
}

// ---------------------------------------------------------------------------
// Inbound callbacks
// ---------------------------------------------------------------------------

/// Callbacks delivered by the bus adapter, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Registered {
        framework_id: FrameworkId,
        master: String,
    },
    Reregistered {
        master: String,
    },
    Disconnected,
    Offers(Vec<Offer>),
    OfferRescinded(OfferId),
    StatusUpdate(BusTaskStatus),
    AgentLost(AgentId),
    ExecutorLost {
        agent_id: AgentId,
        executor_id: String,
    },
    FrameworkMessage {
        agent_id: AgentId,
        executor_id: String,
        data: Vec<u8>,
    },
    Error(String),
}
