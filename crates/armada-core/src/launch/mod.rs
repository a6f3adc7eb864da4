//! Launch scheduling: the per-spec queue, the offer processor, and the
//! revive/suppress signaller.

pub mod launcher;
pub mod queue;
pub mod revive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{Condition, TaskId};
use crate::spec::path::PathId;

/// The most recent task failure of a run-spec, kept for operators and for
/// the queue-info surface. One record per run-spec, overwritten on each
/// failure, cleared on a successful launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub run_spec_id: PathId,
    pub task_id: TaskId,
    pub condition: Condition,
    pub message: String,
    pub host: Option<String>,
    pub run_spec_version: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl armada_store::Record for TaskFailure {
    const CATEGORY: &'static str = "task-failures";

    fn record_id(&self) -> String {
        self.run_spec_id.to_string()
    }
}

/// Snapshot of one run-spec's launch queue state, for the queue surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub run_spec_id: PathId,
    pub pending: u32,
    pub in_progress: u32,
    pub consecutive_failures: u32,
    /// Launches are withheld until this instant passes.
    pub backoff_until: Option<DateTime<Utc>>,
    pub tokens: u32,
    pub last_failure: Option<TaskFailure>,
}
