//! Run-spec and group validation.
//!
//! All input is rejected here before any mutation; the rest of the engine
//! assumes canonical records. Errors carry the offending path so the API
//! adapter can report a structured reason.

use std::collections::BTreeSet;

use regex::Regex;

use crate::spec::path::PathId;
use crate::spec::{Constraint, ConstraintOperator, Group, RunSpec, RunSpecKind, VolumeSpec};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{id}: an app must declare exactly one container, got {count}")]
    AppContainerCount { id: PathId, count: usize },

    #[error("{id}: a pod must declare at least one container")]
    PodWithoutContainers { id: PathId },

    #[error("{id}: container name {name:?} is duplicated")]
    DuplicateContainer { id: PathId, name: String },

    #[error("{id}: container name {name:?} is invalid (lowercase alphanumerics and '-' only)")]
    InvalidContainerName { id: PathId, name: String },

    #[error("{id}: volume name {name:?} is duplicated")]
    DuplicateVolume { id: PathId, name: String },

    #[error("{id}: volume mount references undeclared volume {volume:?}")]
    UnknownVolume { id: PathId, volume: String },

    #[error("{id}: health check port index {index} does not address a declared endpoint (count {count})")]
    HealthPortIndexOutOfRange { id: PathId, index: usize, count: usize },

    #[error("{id}: readiness check port index {index} does not address a declared endpoint (count {count})")]
    ReadinessPortIndexOutOfRange { id: PathId, index: usize, count: usize },

    #[error("{id}: an external volume allows at most one instance, got {instances}")]
    ExternalVolumeInstances { id: PathId, instances: u32 },

    #[error("{id}: minimum health capacity {value} must be within [0, 1]")]
    HealthCapacityOutOfRange { id: PathId, value: f64 },

    #[error("{id}: maximum over-capacity {value} must be >= 0")]
    OverCapacityNegative { id: PathId, value: f64 },

    #[error("{id}: backoff factor {value} must be >= 1")]
    BackoffFactorTooSmall { id: PathId, value: f64 },

    #[error("{id}: constraint on {field:?}: {operator} requires a value")]
    ConstraintValueMissing {
        id: PathId,
        field: String,
        operator: ConstraintOperator,
    },

    #[error("{id}: constraint on {field:?}: invalid pattern {pattern:?}")]
    ConstraintBadPattern {
        id: PathId,
        field: String,
        pattern: String,
    },

    #[error("{id}: constraint on {field:?}: MAX_PER value {value:?} is not a positive integer")]
    ConstraintBadMaxPer {
        id: PathId,
        field: String,
        value: String,
    },

    #[error("{id}: role must not be empty")]
    EmptyRole { id: PathId },

    #[error("group {id}: member {member} is not below the group")]
    MemberOutsideGroup { id: PathId, member: PathId },

    #[error("{id}: requirePorts demands explicit host ports on every endpoint")]
    RequirePortsWithoutPorts { id: PathId },

    #[error("dependency cycle among {paths:?}")]
    DependencyCycle { paths: Vec<PathId> },

    #[error("a deployment step would touch {id} twice")]
    OverlappingPlanActions { id: PathId },
}

fn container_name_ok(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Validate one constraint declaration.
fn validate_constraint(id: &PathId, c: &Constraint) -> Result<(), ValidationError> {
    match c.operator {
        ConstraintOperator::Unique => Ok(()),
        ConstraintOperator::GroupBy => {
            // Value is optional: with none, cardinality is inferred.
            Ok(())
        }
        ConstraintOperator::Cluster | ConstraintOperator::Is => {
            if c.value.is_none() {
                return Err(ValidationError::ConstraintValueMissing {
                    id: id.clone(),
                    field: c.field.clone(),
                    operator: c.operator,
                });
            }
            Ok(())
        }
        ConstraintOperator::Like | ConstraintOperator::Unlike => {
            let pattern = c.value.as_ref().ok_or_else(|| {
                ValidationError::ConstraintValueMissing {
                    id: id.clone(),
                    field: c.field.clone(),
                    operator: c.operator,
                }
            })?;
            Regex::new(pattern).map_err(|_| ValidationError::ConstraintBadPattern {
                id: id.clone(),
                field: c.field.clone(),
                pattern: pattern.clone(),
            })?;
            Ok(())
        }
        ConstraintOperator::MaxPer => {
            let value = c.value.as_ref().ok_or_else(|| {
                ValidationError::ConstraintValueMissing {
                    id: id.clone(),
                    field: c.field.clone(),
                    operator: c.operator,
                }
            })?;
            match value.parse::<u32>() {
                Ok(n) if n > 0 => Ok(()),
                _ => Err(ValidationError::ConstraintBadMaxPer {
                    id: id.clone(),
                    field: c.field.clone(),
                    value: value.clone(),
                }),
            }
        }
    }
}

/// Validate a single run-spec against every structural invariant.
pub fn validate_run_spec(spec: &RunSpec) -> Result<(), ValidationError> {
    let id = &spec.id;

    match spec.kind {
        RunSpecKind::App if spec.containers.len() != 1 => {
            return Err(ValidationError::AppContainerCount {
                id: id.clone(),
                count: spec.containers.len(),
            });
        }
        RunSpecKind::Pod if spec.containers.is_empty() => {
            return Err(ValidationError::PodWithoutContainers { id: id.clone() });
        }
        _ => {}
    }

    if spec.role.is_empty() {
        return Err(ValidationError::EmptyRole { id: id.clone() });
    }

    let mut container_names = BTreeSet::new();
    for c in &spec.containers {
        if !container_name_ok(&c.name) {
            return Err(ValidationError::InvalidContainerName {
                id: id.clone(),
                name: c.name.clone(),
            });
        }
        if !container_names.insert(c.name.clone()) {
            return Err(ValidationError::DuplicateContainer {
                id: id.clone(),
                name: c.name.clone(),
            });
        }
    }

    let mut volume_names = BTreeSet::new();
    for v in &spec.volumes {
        if !volume_names.insert(v.name().to_string()) {
            return Err(ValidationError::DuplicateVolume {
                id: id.clone(),
                name: v.name().to_string(),
            });
        }
    }
    for c in &spec.containers {
        for m in &c.volume_mounts {
            if !volume_names.contains(&m.volume) {
                return Err(ValidationError::UnknownVolume {
                    id: id.clone(),
                    volume: m.volume.clone(),
                });
            }
        }
    }

    // Single-writer volume: external volumes cap the instance count at one.
    if spec
        .volumes
        .iter()
        .any(|v| matches!(v, VolumeSpec::PersistentExternal { .. }))
        && spec.instances > 1
    {
        return Err(ValidationError::ExternalVolumeInstances {
            id: id.clone(),
            instances: spec.instances,
        });
    }

    let endpoint_count = spec.endpoints().len();
    for c in &spec.containers {
        if let Some(hc) = &c.health_check {
            if let Some(index) = hc.port_index {
                if index >= endpoint_count {
                    return Err(ValidationError::HealthPortIndexOutOfRange {
                        id: id.clone(),
                        index,
                        count: endpoint_count,
                    });
                }
            }
        }
    }
    for rc in &spec.readiness_checks {
        if rc.port_index >= endpoint_count {
            return Err(ValidationError::ReadinessPortIndexOutOfRange {
                id: id.clone(),
                index: rc.port_index,
                count: endpoint_count,
            });
        }
    }

    let strategy = &spec.upgrade_strategy;
    if !(0.0..=1.0).contains(&strategy.minimum_health_capacity) {
        return Err(ValidationError::HealthCapacityOutOfRange {
            id: id.clone(),
            value: strategy.minimum_health_capacity,
        });
    }
    if strategy.maximum_over_capacity < 0.0 {
        return Err(ValidationError::OverCapacityNegative {
            id: id.clone(),
            value: strategy.maximum_over_capacity,
        });
    }

    if spec.backoff.factor < 1.0 {
        return Err(ValidationError::BackoffFactorTooSmall {
            id: id.clone(),
            value: spec.backoff.factor,
        });
    }

    if spec.require_ports && spec.port_demands().iter().any(Option::is_none) {
        return Err(ValidationError::RequirePortsWithoutPorts { id: id.clone() });
    }

    for c in &spec.constraints {
        validate_constraint(id, c)?;
    }

    Ok(())
}

/// Validate a whole group tree: membership placement plus each run-spec.
pub fn validate_group(group: &Group) -> Result<(), ValidationError> {
    for (id, spec) in &group.run_specs {
        if !id.is_child_of(&group.id) {
            return Err(ValidationError::MemberOutsideGroup {
                id: group.id.clone(),
                member: id.clone(),
            });
        }
        validate_run_spec(spec)?;
    }
    for (id, child) in &group.groups {
        if !id.is_child_of(&group.id) {
            return Err(ValidationError::MemberOutsideGroup {
                id: group.id.clone(),
                member: id.clone(),
            });
        }
        validate_group(child)?;
    }
    Ok(())
}
