//! Offer-to-spec resource matching.
//!
//! Given an offer and a run-spec, decide whether the offer can satisfy the
//! spec's scalars, ports, and placement constraints, and if so which exact
//! resource slices to consume. Roles are retained on every consumed slice so
//! the launcher can reserve, unreserve, and account correctly.

pub mod constraints;
pub mod ports;

use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::driver::{Offer, OfferedResource, ResourceValue};
use crate::instance::{Instance, InstanceId};
use crate::matcher::ports::{consumed_ranges, select_ports, PortWithRole, PortsResource};
use crate::spec::{RunSpec, UNRESERVED_ROLE};

/// Process-wide fallback when a spec declares no `accepted_resource_roles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptedRolesDefault {
    /// Both the spec's role and unreserved resources.
    Any,
    /// Unreserved resources only.
    Unreserved,
    /// The spec's role only.
    Reserved,
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub default_behavior: AcceptedRolesDefault,
    /// Process-wide accepted-role set; mutually exclusive with a
    /// non-default `default_behavior` (config validation enforces that).
    pub default_accepted_roles: Option<BTreeSet<String>>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            default_behavior: AcceptedRolesDefault::Any,
            default_accepted_roles: None,
        }
    }
}

/// Which launch workflow the consumed resources call for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// Plain launch of a non-resident instance.
    Ephemeral,
    /// Reserve resources and create volumes first, then launch.
    ReserveAndCreate,
    /// Launch onto the instance's existing reservation.
    OnReservation,
}

/// A successful match: the exact slices to consume and the chosen ports.
#[derive(Debug, Clone)]
pub struct ResourceMatch {
    pub kind: LaunchKind,
    /// Consumed resource slices, roles preserved.
    pub consumed: Vec<OfferedResource>,
    /// Chosen host ports in demand order.
    pub host_ports: Vec<u16>,
}

/// Acceptable roles for `spec` under `config`.
fn acceptable_roles(spec: &RunSpec, config: &MatchConfig) -> BTreeSet<String> {
    if let Some(roles) = &spec.accepted_resource_roles {
        return roles.clone();
    }
    if let Some(roles) = &config.default_accepted_roles {
        return roles.clone();
    }
    match config.default_behavior {
        AcceptedRolesDefault::Any => {
            let mut roles = BTreeSet::new();
            roles.insert(UNRESERVED_ROLE.to_string());
            roles.insert(spec.role.clone());
            roles
        }
        AcceptedRolesDefault::Unreserved => [UNRESERVED_ROLE.to_string()].into(),
        AcceptedRolesDefault::Reserved => [spec.role.clone()].into(),
    }
}

/// Whether a resource slice may serve this match at all.
///
/// Slices reserved for a specific instance are only usable by that instance;
/// everything else filters on the acceptable role set.
fn usable(
    resource: &OfferedResource,
    roles: &BTreeSet<String>,
    reserved_for: Option<&InstanceId>,
) -> bool {
    if let Some(labels) = &resource.reservation {
        if let Some(owner) = &labels.instance_id {
            return reserved_for.is_some_and(|id| id.to_string() == *owner);
        }
    }
    roles.contains(&resource.role)
}

/// Greedily satisfy one scalar demand, preferring instance-labeled slices,
/// then role-reserved, then unreserved.
fn take_scalar(
    name: &str,
    mut demand: f64,
    offer: &Offer,
    roles: &BTreeSet<String>,
    reserved_for: Option<&InstanceId>,
) -> Option<Vec<OfferedResource>> {
    let mut candidates: Vec<&OfferedResource> = offer
        .resources
        .iter()
        .filter(|r| r.name == name && usable(r, roles, reserved_for))
        .filter(|r| matches!(r.value, ResourceValue::Scalar(_)))
        .collect();
    candidates.sort_by_key(|r| {
        if r.reservation.is_some() {
            0
        } else if r.role != UNRESERVED_ROLE {
            1
        } else {
            2
        }
    });

    let mut consumed = Vec::new();
    const EPSILON: f64 = 1e-9;
    for resource in candidates {
        if demand <= EPSILON {
            break;
        }
        let ResourceValue::Scalar(available) = resource.value else {
            continue;
        };
        if available <= 0.0 {
            continue;
        }
        let take = available.min(demand);
        demand -= take;
        consumed.push(OfferedResource {
            value: ResourceValue::Scalar(take),
            ..resource.clone()
        });
    }
    if demand > EPSILON { None } else { Some(consumed) }
}

fn ports_resources(
    offer: &Offer,
    roles: &BTreeSet<String>,
    reserved_for: Option<&InstanceId>,
) -> Vec<PortsResource> {
    offer
        .resources
        .iter()
        .filter(|r| r.name == "ports" && usable(r, roles, reserved_for))
        .filter_map(|r| match &r.value {
            ResourceValue::Ranges(ranges) => Some(PortsResource {
                role: r.role.clone(),
                ranges: ranges.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Attempt to satisfy `spec` from `offer`.
///
/// `running` are the spec's current instances (for constraint evaluation);
/// `reserved_for` is set when relaunching onto an existing reservation, in
/// which case the reservation's labeled slices are preferred and consumed.
pub fn match_offer<R: Rng + ?Sized>(
    spec: &RunSpec,
    offer: &Offer,
    running: &[Instance],
    reserved_for: Option<&InstanceId>,
    config: &MatchConfig,
    rng: &mut R,
) -> Option<ResourceMatch> {
    if !constraints::meets_all(&spec.constraints, offer, running) {
        return None;
    }

    let roles = acceptable_roles(spec, config);

    let mut consumed = Vec::new();
    for (name, demand) in spec.total_resources().scalar_demands() {
        let slices = take_scalar(&name, demand, offer, &roles, reserved_for)?;
        consumed.extend(slices);
    }

    let demands = spec.port_demands();
    let chosen: Vec<PortWithRole> =
        select_ports(&demands, &ports_resources(offer, &roles, reserved_for), rng)?;
    for (role, ranges) in consumed_ranges(&chosen) {
        consumed.push(OfferedResource {
            name: "ports".to_string(),
            role,
            value: ResourceValue::Ranges(ranges),
            reservation: None,
            persistence_id: None,
        });
    }

    let kind = if reserved_for.is_some() {
        LaunchKind::OnReservation
    } else if spec.is_resident() {
        LaunchKind::ReserveAndCreate
    } else {
        LaunchKind::Ephemeral
    };

    Some(ResourceMatch {
        kind,
        consumed,
        host_ports: chosen.into_iter().map(|p| p.port).collect(),
    })
}
