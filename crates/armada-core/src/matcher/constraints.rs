//! Placement constraint evaluation.
//!
//! An offer meets a constraint set iff it meets each constraint
//! individually, judged against the already-running instances of the same
//! run-spec. `hostname` is a reserved field; every other field addresses an
//! agent attribute by name.

use std::collections::BTreeMap;

use regex::Regex;

use crate::driver::Offer;
use crate::instance::Instance;
use crate::spec::{Constraint, ConstraintOperator, HOSTNAME_FIELD};

/// The offer's value for a constraint field, textual projection.
fn offer_field(offer: &Offer, field: &str) -> Option<String> {
    if field == HOSTNAME_FIELD {
        return Some(offer.hostname.clone());
    }
    offer.attribute(field).map(|v| v.as_text())
}

/// A running instance's value for a constraint field.
fn instance_field(instance: &Instance, field: &str) -> Option<String> {
    let agent = instance.agent.as_ref()?;
    if field == HOSTNAME_FIELD {
        return Some(agent.hostname.clone());
    }
    agent
        .attributes
        .iter()
        .find(|a| a.name == field)
        .map(|a| a.value.as_text())
}

/// Count running instances per distinct field value.
fn value_counts(running: &[Instance], field: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for instance in running {
        if let Some(value) = instance_field(instance, field) {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts
}

fn anchored(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).ok()
}

/// Evaluate one constraint.
pub fn meets(constraint: &Constraint, offer: &Offer, running: &[Instance]) -> bool {
    let field = constraint.field.as_str();
    let offer_value = offer_field(offer, field);

    match constraint.operator {
        ConstraintOperator::Unique => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            running
                .iter()
                .all(|i| instance_field(i, field).as_deref() != Some(offer_value.as_str()))
        }
        ConstraintOperator::Cluster => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            match &constraint.value {
                Some(wanted) => offer_value == *wanted,
                // Without a pinned value, cluster onto wherever the first
                // instance landed; an empty running set accepts anything.
                None => running
                    .iter()
                    .filter_map(|i| instance_field(i, field))
                    .all(|v| v == offer_value),
            }
        }
        ConstraintOperator::Is => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            constraint.value.as_deref() == Some(offer_value.as_str())
        }
        ConstraintOperator::Like => {
            let (Some(offer_value), Some(pattern)) = (offer_value, &constraint.value) else {
                return false;
            };
            anchored(pattern).is_some_and(|re| re.is_match(&offer_value))
        }
        ConstraintOperator::Unlike => {
            // An absent field cannot match the pattern, so it passes.
            let Some(offer_value) = offer_value else {
                return true;
            };
            let Some(pattern) = &constraint.value else {
                return false;
            };
            anchored(pattern).is_some_and(|re| !re.is_match(&offer_value))
        }
        ConstraintOperator::GroupBy => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            let counts = value_counts(running, field);
            let offer_count = counts.get(&offer_value).copied().unwrap_or(0);
            let declared: Option<usize> =
                constraint.value.as_ref().and_then(|v| v.parse().ok());
            // With no declared cardinality, infer it from the values seen.
            let cardinality = declared.unwrap_or(counts.len().max(1));
            if counts.len() < cardinality && !counts.contains_key(&offer_value) {
                // An unseen group always has the smallest count.
                return true;
            }
            let min = if counts.len() < cardinality {
                0
            } else {
                counts.values().copied().min().unwrap_or(0)
            };
            offer_count <= min
        }
        ConstraintOperator::MaxPer => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            let max = match constraint.value.as_ref().and_then(|v| v.parse::<u32>().ok()) {
                Some(m) => m,
                None => return false,
            };
            let counts = value_counts(running, field);
            counts.get(&offer_value).copied().unwrap_or(0) < max as usize
        }
    }
}

/// Evaluate the full constraint set.
pub fn meets_all(constraints: &[Constraint], offer: &Offer, running: &[Instance]) -> bool {
    constraints.iter().all(|c| meets(c, offer, running))
}
