//! Rarefuzz is the per-seed mutation core of a coverage-guided fuzzer.
//!
//! Given one input from a queue of previously-seen inputs and an
//! instrumented target behind the [`Executor`] boundary, it applies a
//! disciplined sequence of mutation stages — deterministic bit flips,
//! arithmetic and dictionary substitutions, then a stacked random "havoc"
//! stage — and decides *which* havoc operators and stacking sizes to use
//! with multi-armed bandits that learn from per-execution rewards.
//!
//! Its distinguishing move is rare-branch targeting: for each seed it
//! picks one rarely-hit coverage edge, probes every byte of the input to
//! learn which positions can be overwritten, deleted, or inserted into
//! without losing that edge, and then confines mutation to those
//! positions.
//!
//! The crate is a library with no main loop of its own. The outer fuzzer
//! owns scheduling, process management and persistence; it calls
//! [`FuzzState::fuzz_one`] once per chosen seed:
//!
//! ```no_run
//! use rarefuzz::{Config, FuzzState};
//! # use rarefuzz::{Corpus, Executor};
//! # fn demo<E: Executor, C: Corpus>(exec: &mut E, corpus: &mut C) {
//! let mut state = FuzzState::new(Config::default(), 0xdecafbad);
//! let status = state.fuzz_one(exec, corpus, 0).unwrap();
//! # let _ = status;
//! # }
//! ```

pub mod bandit;
mod config;
mod coverage;
mod executor;
mod fuzz_one;
mod mask;
pub mod mutations;
mod queue;
mod rare;
mod rng;
mod stats;
mod trim;
mod world;

pub use config::Config;
pub use coverage::{highest_order_bit, CoverageMap, EdgeId, HitBits};
pub use executor::{ExecError, ExecStatus, Executor, RunCounters};
pub use fuzz_one::{FuzzError, FuzzOneStatus, FuzzState};
pub use mask::{BranchMask, DELETE, INSERT, OVERWRITE};
pub use queue::{Corpus, Extra, ExtrasStore, QueueEntry, VecCorpus};
pub use rare::{RareBranchSelector, RareTarget};
pub use rng::Rng;
pub use stats::{CSVField, FuzzerEvent, FuzzerStats, StageId, StageStats, ToCSV};
pub use trim::{trim_preserving_edge, TrimResult};
pub use world::{StopSignal, World};
