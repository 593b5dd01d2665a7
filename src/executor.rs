//! The contract with the process that actually runs the instrumented
//! target. The core never forks or waits itself; it hands a buffer to an
//! [`Executor`] and reads the resulting trace through this interface.
//!
//! The executor is also where queueing and hit-bit accounting happen: a
//! run that produces new coverage is expected to enqueue the input and to
//! update the global [`HitBits`] before the call returns.

use std::fmt;

use crate::coverage::{EdgeId, HitBits};

/// Outcome classification of a single run of the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecStatus {
    Ok,
    Crash,
    Timeout,
}

/// Fatal executor-side failures. Crashes and timeouts of the target are
/// *not* errors; they come back as [`ExecStatus`].
#[derive(Debug)]
pub enum ExecError {
    Launch(std::io::Error),
    InvalidState(&'static str),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Launch(e) => write!(f, "failed to launch target: {}", e),
            ExecError::InvalidState(msg) => write!(f, "executor invariant broken: {}", msg),
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Launch(e)
    }
}

/// Counters the executor accumulates across runs.
#[derive(Clone, Copy, Default, Debug)]
pub struct RunCounters {
    /// Inputs enqueued because they produced new coverage.
    pub queued_paths: usize,
    pub crashes: usize,
    pub timeouts: usize,
    pub total_execs: usize,
}

pub trait Executor {
    /// Run the target once. On return the trace of this run is readable
    /// through [`trace_contains`](Executor::trace_contains) and
    /// [`exec_cksum`](Executor::exec_cksum) until the next call.
    fn run(&mut self, input: &[u8]) -> Result<ExecStatus, ExecError>;

    /// Whether the most recent run touched `edge`.
    fn trace_contains(&self, edge: EdgeId) -> bool;

    /// Hash of the most recent trace.
    fn exec_cksum(&self) -> u64;

    /// Compressed footprint of the most recent trace.
    fn footprint(&self) -> bit_vec::BitVec;

    fn counters(&self) -> RunCounters;

    fn hit_bits(&self) -> &HitBits;

    /// Start a diagnostic bracket whose queue and bitmap effects may later
    /// be discarded. Rollback is best-effort: side effects that already
    /// escaped the executor (written artifacts, crash reports) are not
    /// recalled, so crash counts can be under-reported after a discard.
    fn begin_shadow(&mut self) {}

    /// Close the bracket opened by [`begin_shadow`](Executor::begin_shadow),
    /// discarding its effects when `discard` is true.
    fn end_shadow(&mut self, _discard: bool) {}
}
