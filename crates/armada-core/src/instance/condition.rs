//! Instance condition resolution from the task map.
//!
//! Two ordered lists drive the computation. Agreement states apply only when
//! every task shares them; any-match states apply as soon as one task has
//! them, first listed wins. Anything else resolves to `Unknown`.

use crate::instance::{Condition, Task};

/// States the instance takes only if all tasks agree on them.
const AGREEMENT: [Condition; 5] = [
    Condition::Created,
    Condition::Reserved,
    Condition::Running,
    Condition::Finished,
    Condition::Killed,
];

/// States the instance takes as soon as any task has them; earlier entries
/// win over later ones.
const ANY_MATCH: [Condition; 9] = [
    Condition::Error,
    Condition::Failed,
    Condition::Gone,
    Condition::Dropped,
    Condition::Unreachable,
    Condition::Killing,
    Condition::Starting,
    Condition::Staging,
    Condition::Unknown,
];

/// Resolve the instance condition from its tasks' conditions.
pub fn resolve<'a, I>(tasks: I) -> Condition
where
    I: IntoIterator<Item = &'a Task>,
{
    let conditions: Vec<Condition> = tasks.into_iter().map(|t| t.status.condition).collect();
    if conditions.is_empty() {
        return Condition::Unknown;
    }
    for state in AGREEMENT {
        if conditions.iter().all(|c| *c == state) {
            return state;
        }
    }
    for state in ANY_MATCH {
        if conditions.iter().any(|c| *c == state) {
            return state;
        }
    }
    Condition::Unknown
}

/// Aggregate the health flag: `None` when no task reports, `Some(true)` iff
/// every reporting task is healthy.
pub fn aggregate_health<'a, I>(tasks: I) -> Option<bool>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut seen_report = false;
    for task in tasks {
        match task.status.healthy {
            Some(false) => return Some(false),
            Some(true) => seen_report = true,
            None => {}
        }
    }
    if seen_report { Some(true) } else { None }
}
