//! Deployments: diffing group trees into ordered plans and executing them.
//!
//! A plan is a list of steps; actions inside one step touch disjoint
//! run-specs and may run concurrently, steps run strictly in order. The
//! planner orders steps by the dependency edges of the affected specs;
//! cycles fail validation before anything mutates.

pub mod executor;
pub mod ledger;
pub mod supervisor;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::TaskId;
use crate::spec::path::PathId;
use crate::spec::{Group, RunSpec};

// ---------------------------------------------------------------------------
// Plan model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Fetch new artifact URIs before anything launches.
    ResolveArtifacts { run_spec_id: PathId, uris: Vec<String> },
    /// Decommission every instance and drop the spec.
    Stop { run_spec_id: PathId },
    /// Bring a new spec from zero to its declared count.
    Start { run_spec_id: PathId, scale_to: u32 },
    /// Adjust an unchanged spec to a new instance count.
    Scale { run_spec_id: PathId, to: u32 },
    /// Replace instances of an old version with the new one.
    Restart { run_spec_id: PathId },
}

impl DeploymentAction {
    pub fn run_spec_id(&self) -> &PathId {
        match self {
            Self::ResolveArtifacts { run_spec_id, .. }
            | Self::Stop { run_spec_id }
            | Self::Start { run_spec_id, .. }
            | Self::Scale { run_spec_id, .. }
            | Self::Restart { run_spec_id } => run_spec_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: Uuid,
    pub original: Group,
    pub target: Group,
    pub steps: Vec<DeploymentStep>,
    pub version: DateTime<Utc>,
}

impl DeploymentPlan {
    /// Every run-spec any step touches; used for the one-plan-per-spec rule.
    pub fn affected_specs(&self) -> BTreeSet<PathId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .map(|a| a.run_spec_id().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A readiness probe result forwarded by the adapter running the checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub task_id: TaskId,
    pub name: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle among {0:?}")]
    DependencyCycle(Vec<PathId>),

    #[error("step {step} contains two actions for {run_spec_id}")]
    OverlappingActions { step: usize, run_spec_id: PathId },
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Diff {
    added: Vec<PathId>,
    removed: Vec<PathId>,
    scaled: Vec<(PathId, u32)>,
    restarted: Vec<PathId>,
}

fn diff(original: &Group, target: &Group) -> Diff {
    let before = original.transitive_by_id();
    let after = target.transitive_by_id();
    let mut out = Diff::default();

    for (id, spec) in &after {
        match before.get(id) {
            None => out.added.push(id.clone()),
            Some(old) => {
                if old.version != spec.version {
                    out.restarted.push(id.clone());
                } else if old.instances != spec.instances {
                    out.scaled.push((id.clone(), spec.instances));
                }
            }
        }
    }
    for id in before.keys() {
        if !after.contains_key(id) {
            out.removed.push(id.clone());
        }
    }
    out
}

/// Dependency level per spec: 0 for specs with no (affected) dependencies,
/// 1 + max(level of dependencies) otherwise. Errors on a cycle.
fn dependency_levels(
    specs: &BTreeSet<PathId>,
    edges: &[(PathId, PathId)],
) -> Result<BTreeMap<PathId, usize>, PlanError> {
    let relevant: Vec<&(PathId, PathId)> = edges
        .iter()
        .filter(|(a, b)| specs.contains(a) && specs.contains(b))
        .collect();

    let mut in_degree: BTreeMap<&PathId, usize> = specs.iter().map(|s| (s, 0)).collect();
    for (dependent, _) in &relevant {
        *in_degree.get_mut(dependent).expect("filtered to specs") += 1;
    }

    let mut levels: BTreeMap<PathId, usize> = BTreeMap::new();
    let mut queue: VecDeque<&PathId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(s, _)| *s)
        .collect();
    for s in &queue {
        levels.insert((*s).clone(), 0);
    }

    while let Some(done) = queue.pop_front() {
        let done_level = levels[done];
        for (dependent, dependency) in &relevant {
            if dependency == done {
                let entry = levels.entry(dependent.clone()).or_insert(0);
                *entry = (*entry).max(done_level + 1);
                let d = in_degree.get_mut(dependent).expect("filtered to specs");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if levels.len() < specs.len() {
        let cycled: Vec<PathId> = specs
            .iter()
            .filter(|s| !levels.contains_key(*s))
            .cloned()
            .collect();
        return Err(PlanError::DependencyCycle(cycled));
    }
    Ok(levels)
}

/// Group ids into steps by dependency level. `ascending` runs dependencies
/// first (starts); descending runs dependents first (stops).
fn leveled_steps<F>(
    ids: &[PathId],
    levels: &BTreeMap<PathId, usize>,
    ascending: bool,
    mut action: F,
) -> Vec<DeploymentStep>
where
    F: FnMut(&PathId) -> DeploymentAction,
{
    let mut by_level: BTreeMap<usize, Vec<&PathId>> = BTreeMap::new();
    for id in ids {
        by_level
            .entry(levels.get(id).copied().unwrap_or(0))
            .or_default()
            .push(id);
    }
    let mut ordered: Vec<(usize, Vec<&PathId>)> = by_level.into_iter().collect();
    if !ascending {
        ordered.reverse();
    }
    ordered
        .into_iter()
        .map(|(_, ids)| DeploymentStep {
            actions: ids.into_iter().map(&mut action).collect(),
        })
        .collect()
}

/// Compile a plan from `original` to `target`.
pub fn plan(
    original: &Group,
    target: &Group,
    id: Uuid,
    version: DateTime<Utc>,
) -> Result<DeploymentPlan, PlanError> {
    let changes = diff(original, target);
    let after = target.transitive_by_id();

    let mut affected: BTreeSet<PathId> = BTreeSet::new();
    affected.extend(changes.added.iter().cloned());
    affected.extend(changes.removed.iter().cloned());
    affected.extend(changes.scaled.iter().map(|(id, _)| id.clone()));
    affected.extend(changes.restarted.iter().cloned());

    // Dependency edges from both trees so removed specs stay ordered.
    let mut edges = target.dependency_edges();
    edges.extend(original.dependency_edges());
    edges.sort();
    edges.dedup();

    // Transitive dependents of changed specs are affected too: a restart of
    // a dependency re-gates its dependents' ordering.
    let mut grew = true;
    while grew {
        grew = false;
        for (dependent, dependency) in &edges {
            if affected.contains(dependency) && !affected.contains(dependent) {
                affected.insert(dependent.clone());
                grew = true;
            }
        }
    }

    let levels = dependency_levels(&affected, &edges)?;
    let mut steps: Vec<DeploymentStep> = Vec::new();

    // 1. Resolve new artifacts, all in parallel.
    let artifact_actions: Vec<DeploymentAction> = changes
        .added
        .iter()
        .chain(changes.restarted.iter())
        .filter_map(|id| {
            let spec = after.get(id)?;
            if spec.artifact_uris.is_empty() {
                None
            } else {
                Some(DeploymentAction::ResolveArtifacts {
                    run_spec_id: id.clone(),
                    uris: spec.artifact_uris.clone(),
                })
            }
        })
        .collect();
    if !artifact_actions.is_empty() {
        steps.push(DeploymentStep { actions: artifact_actions });
    }

    // 2. Stop removed specs, dependents before dependencies.
    steps.extend(leveled_steps(&changes.removed, &levels, false, |id| {
        DeploymentAction::Stop { run_spec_id: id.clone() }
    }));

    // 3. Start added specs, dependencies first.
    steps.extend(leveled_steps(&changes.added, &levels, true, |id| {
        DeploymentAction::Start {
            run_spec_id: id.clone(),
            scale_to: after.get(id).map(|s| s.instances).unwrap_or(0),
        }
    }));

    // 4. Scale count-only changes.
    let scaled_ids: Vec<PathId> = changes.scaled.iter().map(|(id, _)| id.clone()).collect();
    let scale_to: BTreeMap<&PathId, u32> =
        changes.scaled.iter().map(|(id, to)| (id, *to)).collect();
    steps.extend(leveled_steps(&scaled_ids, &levels, true, |id| {
        DeploymentAction::Scale {
            run_spec_id: id.clone(),
            to: scale_to.get(id).copied().unwrap_or(0),
        }
    }));

    // 5. Restart version changes, dependencies first.
    steps.extend(leveled_steps(&changes.restarted, &levels, true, |id| {
        DeploymentAction::Restart { run_spec_id: id.clone() }
    }));

    let plan = DeploymentPlan {
        id,
        original: original.clone(),
        target: target.clone(),
        steps,
        version,
    };
    validate(&plan)?;
    Ok(plan)
}

/// No two actions in one step may touch the same run-spec.
fn validate(plan: &DeploymentPlan) -> Result<(), PlanError> {
    for (index, step) in plan.steps.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for action in &step.actions {
            if !seen.insert(action.run_spec_id().clone()) {
                return Err(PlanError::OverlappingActions {
                    step: index,
                    run_spec_id: action.run_spec_id().clone(),
                });
            }
        }
    }
    Ok(())
}

/// Look up a run-spec revision in the plan's target tree.
pub fn target_spec<'a>(plan: &'a DeploymentPlan, id: &PathId) -> Option<&'a RunSpec> {
    plan.target.find_run_spec(id)
}
