//! Host-port selection from offered port ranges.
//!
//! Explicit demands must be present in the offered ranges and are allocated
//! verbatim, in order. Dynamic demands draw pseudo-random free ports so
//! co-located instances of one spec do not pile onto the lowest range.

use rand::Rng;
use rand::seq::SliceRandom;

/// One `ports` resource slice from an offer, keeping its role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortsResource {
    pub role: String,
    pub ranges: Vec<(u64, u64)>,
}

/// A chosen host port and the role of the range it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortWithRole {
    pub port: u16,
    pub role: String,
}

/// Expansion guard: offers can carry ranges spanning tens of thousands of
/// ports; beyond this the candidate list is truncated (still far more than
/// any spec demands).
const MAX_CANDIDATES: usize = 16_384;

fn candidates(available: &[PortsResource]) -> Vec<PortWithRole> {
    let mut out = Vec::new();
    'outer: for resource in available {
        for &(lo, hi) in &resource.ranges {
            for port in lo..=hi.min(u16::MAX as u64) {
                out.push(PortWithRole {
                    port: port as u16,
                    role: resource.role.clone(),
                });
                if out.len() >= MAX_CANDIDATES {
                    break 'outer;
                }
            }
        }
    }
    out
}

/// Pick ports satisfying `demands` (`Some(p)` explicit, `None` dynamic).
///
/// Returns the chosen ports in demand order, or `None` when any demand is
/// unsatisfiable. Each port is used at most once.
pub fn select_ports<R: Rng + ?Sized>(
    demands: &[Option<u16>],
    available: &[PortsResource],
    rng: &mut R,
) -> Option<Vec<PortWithRole>> {
    if demands.is_empty() {
        return Some(Vec::new());
    }
    let mut pool = candidates(available);
    let mut chosen: Vec<Option<PortWithRole>> = vec![None; demands.len()];

    // Explicit ports first, so dynamic picks cannot steal them.
    for (slot, demand) in demands.iter().enumerate() {
        if let Some(port) = demand {
            let at = pool.iter().position(|c| c.port == *port)?;
            chosen[slot] = Some(pool.swap_remove(at));
        }
    }

    // Dynamic ports from the remaining pool, shuffled.
    pool.shuffle(rng);
    for (slot, demand) in demands.iter().enumerate() {
        if demand.is_none() {
            chosen[slot] = Some(pool.pop()?);
        }
    }

    chosen.into_iter().collect()
}

/// Group chosen ports back into per-role ranges for the consumed-resource
/// list handed to the bus.
pub fn consumed_ranges(ports: &[PortWithRole]) -> Vec<(String, Vec<(u64, u64)>)> {
    let mut by_role: std::collections::BTreeMap<String, Vec<u64>> = Default::default();
    for p in ports {
        by_role.entry(p.role.clone()).or_default().push(p.port as u64);
    }
    by_role
        .into_iter()
        .map(|(role, mut ports)| {
            ports.sort_unstable();
            let mut ranges: Vec<(u64, u64)> = Vec::new();
            for port in ports {
                match ranges.last_mut() {
                    Some((_, hi)) if *hi + 1 == port => *hi = port,
                    _ => ranges.push((port, port)),
                }
            }
            (role, ranges)
        })
        .collect()
}
