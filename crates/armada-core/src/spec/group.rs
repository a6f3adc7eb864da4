//! The group tree: desired state as a hierarchy of run-specs.
//!
//! Groups mirror the path hierarchy of their members. The root group is the
//! whole desired state; deployments are diffs between two root groups.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::path::PathId;
use crate::spec::RunSpec;

/// Whether top-level groups enforce their role onto members by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRoleBehavior {
    Off,
    Top,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: PathId,
    /// Immediate member run-specs, keyed by their full path.
    pub run_specs: BTreeMap<PathId, RunSpec>,
    /// Immediate child groups, keyed by their full path.
    pub groups: BTreeMap<PathId, Group>,
    /// Other group/run-spec paths every member transitively depends on.
    pub dependencies: Vec<PathId>,
    pub version: DateTime<Utc>,
    /// Force the group's role onto immediate members. `None` defers to the
    /// process-wide [`GroupRoleBehavior`].
    pub enforce_role: Option<bool>,
}

impl Group {
    pub fn empty(id: PathId, version: DateTime<Utc>) -> Self {
        Self {
            id,
            run_specs: BTreeMap::new(),
            groups: BTreeMap::new(),
            dependencies: Vec::new(),
            version,
            enforce_role: None,
        }
    }

    pub fn empty_root(version: DateTime<Utc>) -> Self {
        Self::empty(PathId::root(), version)
    }

    /// Every run-spec in this subtree.
    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut out: Vec<&RunSpec> = self.run_specs.values().collect();
        for child in self.groups.values() {
            out.extend(child.transitive_run_specs());
        }
        out
    }

    /// Every run-spec in this subtree, keyed by path.
    pub fn transitive_by_id(&self) -> BTreeMap<PathId, &RunSpec> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect()
    }

    pub fn find_run_spec(&self, id: &PathId) -> Option<&RunSpec> {
        if let Some(spec) = self.run_specs.get(id) {
            return Some(spec);
        }
        self.groups.values().find_map(|g| g.find_run_spec(id))
    }

    pub fn find_group(&self, id: &PathId) -> Option<&Group> {
        if &self.id == id {
            return Some(self);
        }
        self.groups
            .values()
            .find(|g| id.starts_with(&g.id))
            .and_then(|g| g.find_group(id))
    }

    /// Insert or replace a run-spec, creating intermediate groups along its
    /// path. Updates the version of every group on the path.
    pub fn put_run_spec(&mut self, spec: RunSpec, version: DateTime<Utc>) {
        self.version = version;
        let parent = spec.id.parent();
        if parent == self.id {
            self.run_specs.insert(spec.id.clone(), spec);
            return;
        }
        // Descend one level toward the spec's parent.
        let next_id = PathId::from_segments(
            spec.id.segments()[..self.id.segments().len() + 1]
                .iter()
                .cloned(),
        );
        let child = self
            .groups
            .entry(next_id.clone())
            .or_insert_with(|| Group::empty(next_id, version));
        child.put_run_spec(spec, version);
    }

    /// Remove a run-spec; empty intermediate groups are left in place (a
    /// group is an addressable object of its own).
    pub fn remove_run_spec(&mut self, id: &PathId, version: DateTime<Utc>) -> Option<RunSpec> {
        if let Some(spec) = self.run_specs.remove(id) {
            self.version = version;
            return Some(spec);
        }
        for child in self.groups.values_mut() {
            if id.starts_with(&child.id) {
                let removed = child.remove_run_spec(id, version);
                if removed.is_some() {
                    self.version = version;
                }
                return removed;
            }
        }
        None
    }

    /// Replace the subtree at `group.id`, creating intermediates as needed.
    pub fn put_group(&mut self, group: Group, version: DateTime<Utc>) {
        if group.id == self.id {
            *self = group;
            self.version = version;
            return;
        }
        self.version = version;
        if group.id.is_child_of(&self.id) {
            self.groups.insert(group.id.clone(), group);
            return;
        }
        let next_id = PathId::from_segments(
            group.id.segments()[..self.id.segments().len() + 1]
                .iter()
                .cloned(),
        );
        let child = self
            .groups
            .entry(next_id.clone())
            .or_insert_with(|| Group::empty(next_id, version));
        child.put_group(group, version);
    }

    /// Dependency edges at run-spec granularity: `(dependent, dependency)`.
    ///
    /// A run-spec dependency pointing at a group expands to every member of
    /// that group; group-level dependencies apply to every member of the
    /// declaring group.
    pub fn dependency_edges(&self) -> Vec<(PathId, PathId)> {
        let root = self;
        let all = root.transitive_by_id();
        let mut edges = Vec::new();

        let mut expand = |dependent: &PathId, target: &PathId, edges: &mut Vec<(PathId, PathId)>| {
            if all.contains_key(target) {
                edges.push((dependent.clone(), target.clone()));
            } else {
                // A group path: depend on each of its members.
                for (id, _) in all.iter().filter(|(id, _)| id.starts_with(target)) {
                    if id != dependent {
                        edges.push((dependent.clone(), id.clone()));
                    }
                }
            }
        };

        let mut stack = vec![root];
        while let Some(group) = stack.pop() {
            for spec in group.run_specs.values() {
                for dep in &spec.dependencies {
                    expand(&spec.id, dep, &mut edges);
                }
            }
            for dep in &group.dependencies {
                for spec in group.transitive_run_specs() {
                    expand(&spec.id, dep, &mut edges);
                }
            }
            stack.extend(group.groups.values());
        }
        edges.sort();
        edges.dedup();
        edges
    }

    /// Apply role enforcement: each top-level group whose effective
    /// enforce-role flag is on rewrites its immediate members' role to the
    /// group's name.
    pub fn enforce_roles(&mut self, behavior: GroupRoleBehavior) {
        for group in self.groups.values_mut() {
            let enforced = group
                .enforce_role
                .unwrap_or(behavior == GroupRoleBehavior::Top);
            if !enforced {
                continue;
            }
            let role = match group.id.name() {
                Some(name) => name.to_string(),
                None => continue,
            };
            for spec in group.run_specs.values_mut() {
                spec.role = role.clone();
            }
        }
    }
}
