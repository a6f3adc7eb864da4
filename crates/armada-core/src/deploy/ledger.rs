//! Rolling-restart bookkeeping.
//!
//! The ledger is the pure heart of the restart supervisor: it tracks old
//! and new instances of one run-spec through a version replacement and
//! answers, after every observed change, what to do next. The async shell
//! around it only executes decisions.
//!
//! Capacity bounds, for target count `N`, minimum healthy fraction
//! `minHealthy`, and over-capacity fraction `maxOver`:
//!   `H = ceil(N * minHealthy)`   -- floor of healthy capacity
//!   `C = floor(N * (1 + maxOver))` -- ceiling of total capacity

use std::collections::BTreeSet;

use crate::instance::InstanceId;
use crate::spec::UpgradeStrategy;

/// What the supervisor must do after a ledger transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Decommission and kill this old instance.
    KillOld(InstanceId),
    /// Ask the launch queue for this many new instances.
    Launch(u32),
}

#[derive(Debug)]
pub struct ReplacementLedger {
    target: u32,
    /// Minimum instances that must stay up.
    h: u32,
    /// Capacity ceiling, including the single borrowed slot for
    /// no-headroom non-resident replacements.
    c: u32,
    resident: bool,
    old_alive: BTreeSet<InstanceId>,
    new_started: BTreeSet<InstanceId>,
    new_ready: BTreeSet<InstanceId>,
    /// Launches requested but not yet visible as instances.
    launches_requested: u32,
}

impl ReplacementLedger {
    pub fn new(
        target: u32,
        strategy: UpgradeStrategy,
        resident: bool,
        old_alive: BTreeSet<InstanceId>,
    ) -> Self {
        let h = (f64::from(target) * strategy.minimum_health_capacity).ceil() as u32;
        let mut c = (f64::from(target) * (1.0 + strategy.maximum_over_capacity)).floor() as u32;
        // No headroom at all: non-resident specs may borrow one slot; a
        // resident spec must not over-reserve volumes, so it kills into
        // room instead (see `initial_kills`).
        if h == c && old_alive.len() as u32 >= c && !resident {
            c += 1;
        }
        Self {
            target,
            h,
            c,
            resident,
            old_alive,
            new_started: BTreeSet::new(),
            new_ready: BTreeSet::new(),
            launches_requested: 0,
        }
    }

    pub fn minimum_healthy(&self) -> u32 {
        self.h
    }

    pub fn capacity_ceiling(&self) -> u32 {
        self.c
    }

    pub fn old_alive(&self) -> usize {
        self.old_alive.len()
    }

    pub fn new_ready(&self) -> usize {
        self.new_ready.len()
    }

    fn new_total(&self) -> u32 {
        self.new_started.len() as u32 + self.new_ready.len() as u32 + self.launches_requested
    }

    /// Old instances to kill immediately at step start.
    ///
    /// Normally `max(0, runningOld - H)`. A resident spec with no headroom
    /// kills one extra to make room without exceeding its reservations.
    pub fn initial_kills(&self) -> Vec<InstanceId> {
        let old = self.old_alive.len() as u32;
        let mut count = old.saturating_sub(self.h);
        if self.resident && self.h == self.c && old >= self.c {
            count = old.saturating_sub(self.h) + 1;
        }
        self.pick_old(count as usize)
    }

    /// New instances to launch now, bounded by the capacity ceiling and by
    /// the remaining target.
    pub fn launch_allowance(&mut self) -> u32 {
        let occupied = self.old_alive.len() as u32 + self.new_total();
        let left_capacity = self.c.saturating_sub(occupied);
        let still_needed = self.target.saturating_sub(self.new_total());
        let launch = left_capacity.min(still_needed);
        self.launches_requested += launch;
        launch
    }

    /// A launched instance of the new version became visible.
    pub fn on_new_started(&mut self, id: InstanceId) {
        self.launches_requested = self.launches_requested.saturating_sub(1);
        self.new_started.insert(id);
    }

    /// A new instance reached readiness: one old instance may go.
    pub fn on_new_ready(&mut self, id: InstanceId) -> Vec<Decision> {
        if let Some(moved) = self.new_started.take(&id) {
            self.new_ready.insert(moved);
        } else {
            self.new_ready.insert(id);
        }
        let mut decisions: Vec<Decision> = self
            .pick_old(1)
            .into_iter()
            .map(Decision::KillOld)
            .collect();
        let launch = self.launch_allowance();
        if launch > 0 {
            decisions.push(Decision::Launch(launch));
        }
        decisions
    }

    /// A new instance died while still meant to run. The launch queue
    /// re-queues it on its own, so the slot stays accounted as an
    /// outstanding launch rather than reopening the allowance.
    pub fn on_new_terminal_still_wanted(&mut self, id: &InstanceId) {
        if self.new_started.remove(id) || self.new_ready.remove(id) {
            self.launches_requested += 1;
        }
    }

    /// A new instance died with a goal other than Running: some other
    /// writer is acting on the service; do not count it at all.
    pub fn on_new_terminal_interference(&mut self, id: &InstanceId) {
        self.new_started.remove(id);
        self.new_ready.remove(id);
    }

    /// An old instance went away (killed by us or died out of band).
    /// Returns launches that became possible with the freed capacity.
    pub fn on_old_gone(&mut self, id: &InstanceId) -> Vec<Decision> {
        if !self.old_alive.remove(id) {
            return Vec::new();
        }
        let launch = self.launch_allowance();
        if launch > 0 {
            vec![Decision::Launch(launch)]
        } else {
            Vec::new()
        }
    }

    pub fn is_old(&self, id: &InstanceId) -> bool {
        self.old_alive.contains(id)
    }

    /// Replacement complete: full new capacity ready and no old survivors.
    pub fn is_done(&self) -> bool {
        self.new_ready.len() as u32 >= self.target && self.old_alive.is_empty()
    }

    fn pick_old(&self, count: usize) -> Vec<InstanceId> {
        // Oldest first: instance ids are time-ordered within a spec.
        self.old_alive.iter().take(count).cloned().collect()
    }
}
