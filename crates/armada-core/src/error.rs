//! The orchestrator error taxonomy.
//!
//! Everything surfaced to the API adapter is one of these variants; the
//! adapter maps them onto status codes and structured bodies. Transient
//! store failures are retried close to where they happen, so by the time
//! an error reaches this type it is a final answer.

use armada_store::{MigrationError, StoreError};

use crate::deploy::executor::DeployError;
use crate::spec::validation::ValidationError;
use crate::tracker::TrackerError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Input rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A versioned write lost to a concurrent writer, or a conflicting
    /// deployment is in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine op was not legal from the current state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Transient infrastructure failure that exhausted its retries.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The process must not continue (storage from the future, duplicated
    /// leadership, unrecoverable persistence).
    #[error("fatal: {0}")]
    Fatal(String),

    /// This process is not the leader; writes go to `leader` if known.
    #[error("not the current leader")]
    NotLeader { leader: Option<String> },
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => CoreError::NotFound(path),
            StoreError::Conflict { .. } | StoreError::AlreadyExists(_) => {
                CoreError::Conflict(e.to_string())
            }
            StoreError::Unavailable(_) => CoreError::Transient(e.to_string()),
            StoreError::SessionExpired => CoreError::Fatal(e.to_string()),
            StoreError::Codec(_) => CoreError::Fatal(e.to_string()),
        }
    }
}

impl From<TrackerError> for CoreError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::Persistence(inner) => CoreError::from(inner),
            TrackerError::ShutDown => CoreError::Transient("instance tracker shut down".into()),
        }
    }
}

impl From<DeployError> for CoreError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Conflict { .. } | DeployError::TooManyQueuedUpdates { .. } => {
                CoreError::Conflict(e.to_string())
            }
            DeployError::NotFound(id) => CoreError::NotFound(format!("deployment {id}")),
            DeployError::Store(inner) => CoreError::from(inner),
        }
    }
}

impl From<MigrationError> for CoreError {
    fn from(e: MigrationError) -> Self {
        match e {
            MigrationError::FromTheFuture { .. } => CoreError::Fatal(e.to_string()),
            MigrationError::StepFailed { .. } => CoreError::Fatal(e.to_string()),
            MigrationError::Store(inner) => CoreError::from(inner),
        }
    }
}

impl From<crate::deploy::PlanError> for CoreError {
    fn from(e: crate::deploy::PlanError) -> Self {
        CoreError::Validation(ValidationError::from_plan(e))
    }
}

impl ValidationError {
    /// Plan validation failures surface in the validation bucket.
    fn from_plan(e: crate::deploy::PlanError) -> ValidationError {
        match e {
            crate::deploy::PlanError::DependencyCycle(paths) => {
                ValidationError::DependencyCycle { paths }
            }
            crate::deploy::PlanError::OverlappingActions { run_spec_id, .. } => {
                ValidationError::OverlappingPlanActions { id: run_spec_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_taxonomy() {
        assert!(matches!(
            CoreError::from(StoreError::NotFound("/x".into())),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(StoreError::Conflict {
                path: "/x".into(),
                expected: 1,
                actual: 2
            }),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from(StoreError::Unavailable("down".into())),
            CoreError::Transient(_)
        ));
        assert!(matches!(
            CoreError::from(StoreError::SessionExpired),
            CoreError::Fatal(_)
        ));
    }

    #[test]
    fn migration_from_the_future_is_fatal() {
        let e = MigrationError::FromTheFuture {
            stored: 9,
            current: 2,
        };
        assert!(matches!(CoreError::from(e), CoreError::Fatal(_)));
    }

    #[test]
    fn plan_cycle_is_a_validation_error() {
        let e = crate::deploy::PlanError::DependencyCycle(vec!["/a".parse().unwrap()]);
        assert!(matches!(CoreError::from(e), CoreError::Validation(_)));
    }
}
