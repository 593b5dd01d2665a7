//! The mutation stages: the deterministic walk and the bandit-driven
//! havoc stage, plus the constant tables and redundancy predicates they
//! share.

pub mod deterministic;
pub mod havoc;
pub mod predicates;
pub mod tables;

use crate::executor::RunCounters;

/// Queued paths plus crashes: what the deterministic stages count as
/// "finds" when attributing discoveries to a stage.
#[inline]
pub(crate) fn total_finds(counters: &RunCounters) -> usize {
    counters.queued_paths + counters.crashes
}
