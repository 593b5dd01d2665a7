//! The per-seed driver: skip gate, calibration, trimming, rare-branch
//! target selection, the deterministic walk, havoc, and splice retries,
//! in that order. One call fuzzes one queue entry and returns whether it
//! ran to completion or bailed.

use std::fmt;

use crate::bandit::BanditGrid;
use crate::config::Config;
use crate::coverage::EdgeId;
use crate::executor::{ExecError, ExecStatus, Executor};
use crate::mask::BranchMask;
use crate::mutations::deterministic::{probe_branch_mask, DetStages};
use crate::mutations::havoc::{HavocStage, HavocState};
use crate::queue::{Corpus, ExtrasStore};
use crate::rare::RareBranchSelector;
use crate::rng::Rng;
use crate::stats::{FuzzerEvent, FuzzerStats, StageId};
use crate::trim::trim_preserving_edge;
use crate::world::World;

/// The driver's only two answers: the seed was fuzzed to completion, or
/// it was skipped or aborted along the way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuzzOneStatus {
    Fuzzed,
    Skipped,
}

/// Fatal failures only. Everything recoverable maps to
/// [`FuzzOneStatus::Skipped`].
#[derive(Debug)]
pub enum FuzzError {
    Exec(ExecError),
}

impl fmt::Display for FuzzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuzzError::Exec(e) => write!(f, "{}", e),
        }
    }
}

impl From<ExecError> for FuzzError {
    fn from(e: ExecError) -> Self {
        FuzzError::Exec(e)
    }
}

/// Process-lifetime state of the mutation core: configuration, RNG,
/// bandit grid, rare-branch bookkeeping, dictionaries and statistics.
/// Owned by the outer fuzzer and reused across every seed.
pub struct FuzzState {
    pub cfg: Config,
    pub rng: Rng,
    pub world: World,
    pub stats: FuzzerStats,
    pub extras: ExtrasStore,
    pub grid: BanditGrid,
    pub rare: RareBranchSelector,
}

impl FuzzState {
    pub fn new(cfg: Config, seed: u64) -> Self {
        let extras = ExtrasStore::new(
            cfg.max_auto_extras,
            cfg.min_auto_extra,
            cfg.max_auto_extra,
            cfg.max_dict_file,
        );
        let grid = BanditGrid::new(&cfg);
        let rare = RareBranchSelector::new(cfg.max_rare_branches);
        Self {
            cfg,
            rng: Rng::new(seed),
            world: World::default(),
            stats: FuzzerStats::default(),
            extras,
            grid,
            rare,
        }
    }

    /// Fuzz a single queue entry. In shadow mode the whole pipeline first
    /// runs untargeted inside a discard bracket, so the contribution of
    /// targeting can be measured; the rollback is best-effort (see
    /// [`Executor::begin_shadow`]).
    pub fn fuzz_one<E: Executor, C: Corpus>(
        &mut self,
        exec: &mut E,
        corpus: &mut C,
        idx: usize,
    ) -> Result<FuzzOneStatus, FuzzError> {
        if self.cfg.shadow_mode && self.cfg.rare_targeting {
            let saved = corpus.entry(idx).clone();
            exec.begin_shadow();
            let shadow_result = self.fuzz_one_inner(exec, corpus, idx, false);
            exec.end_shadow(true);
            *corpus.entry_mut(idx) = saved;
            shadow_result?;
        }
        self.fuzz_one_inner(exec, corpus, idx, self.cfg.rare_targeting)
    }

    fn skip(&mut self) -> Result<FuzzOneStatus, FuzzError> {
        self.stats.seeds_skipped += 1;
        self.world
            .report_event(FuzzerEvent::SeedSkipped, Some(&self.stats));
        Ok(FuzzOneStatus::Skipped)
    }

    fn blacklist(&mut self, edge: EdgeId) {
        self.rare.blacklist_edge(edge);
        self.stats.blacklist_size = self.rare.blacklist_len();
        self.world
            .report_event(FuzzerEvent::EdgeBlacklisted(edge), Some(&self.stats));
    }

    fn fuzz_one_inner<E: Executor, C: Corpus>(
        &mut self,
        exec: &mut E,
        corpus: &mut C,
        idx: usize,
        targeted: bool,
    ) -> Result<FuzzOneStatus, FuzzError> {
        // probabilistic skip gate, before any execution
        {
            let entry = corpus.entry(idx);
            if corpus.pending_favored() > 0 {
                if (entry.was_fuzzed || !entry.favored)
                    && self.rng.u32_below(100) < self.cfg.skip_to_new_prob
                {
                    return self.skip();
                }
            } else if !entry.favored && corpus.count() > 10 {
                if corpus.cycle() > 1 && !entry.was_fuzzed {
                    if self.rng.u32_below(100) < self.cfg.skip_nfav_new_prob {
                        return self.skip();
                    }
                } else if self.rng.u32_below(100) < self.cfg.skip_nfav_old_prob {
                    return self.skip();
                }
            }
        }

        if self.world.stop_requested() {
            return self.skip();
        }

        // calibration: one baseline run to refresh checksum and footprint
        let mut buf = corpus.entry(idx).data.clone();
        let status = exec.run(&buf)?;
        self.stats.record_exec(StageId::Calibrate);
        if status != ExecStatus::Ok {
            return self.skip();
        }
        let mut base_cksum = exec.exec_cksum();
        {
            let entry = corpus.entry_mut(idx);
            entry.exec_cksum = base_cksum;
            entry.footprint = exec.footprint();
        }

        // pick the rare edge to attack
        let target = if targeted {
            match self.rare.choose_target(exec.hit_bits(), corpus.entry_mut(idx)) {
                Some(t) => Some(t),
                None => return self.skip(),
            }
        } else {
            None
        };
        let cur_target: Option<EdgeId> = target.as_ref().map(|t| t.edge);
        let target_exhausted = target.as_ref().map_or(false, |t| t.all_fuzzed);
        let exp = self.rare.rare_branch_exp();
        if exp < self.stats.rare_branch_exp {
            self.world
                .report_event(FuzzerEvent::RareExponentTightened(exp), Some(&self.stats));
        }
        self.stats.rare_branch_exp = exp;

        // branch-preserving trim, once per seed
        if let Some(edge) = cur_target {
            if !corpus.entry(idx).trim_done {
                let res = trim_preserving_edge(
                    exec,
                    &self.world,
                    &self.cfg,
                    &mut self.stats,
                    &mut buf,
                    edge,
                )?;
                if res.stopped {
                    return self.skip();
                }
                let entry = corpus.entry_mut(idx);
                entry.trim_done = true;
                if res.trimmed {
                    entry.data = buf.clone();
                    // the shorter input is the new baseline
                    exec.run(&buf)?;
                    self.stats.record_exec(StageId::Calibrate);
                    base_cksum = exec.exec_cksum();
                    let entry = corpus.entry_mut(idx);
                    entry.exec_cksum = base_cksum;
                    entry.footprint = exec.footprint();
                }
            }
        }

        // deterministic stages build the masks; when they are skipped the
        // standalone sweeps still must classify every byte
        let mut mask = BranchMask::permissive(buf.len());
        let skip_det =
            self.cfg.skip_deterministic || corpus.entry(idx).passed_det || target_exhausted;

        if !skip_det && !buf.is_empty() {
            let det = DetStages::new(
                exec,
                &self.world,
                &self.cfg,
                &self.rng,
                &mut self.stats,
                &mut self.extras,
                &mut buf,
                &mut mask,
                cur_target,
                base_cksum,
            );
            let outcome = det.run()?;
            if outcome.target_dropped {
                if let Some(edge) = cur_target {
                    self.blacklist(edge);
                }
            }
            if outcome.stopped {
                return self.skip();
            }
            corpus.entry_mut(idx).passed_det = true;
        } else if let Some(edge) = cur_target {
            let probe = probe_branch_mask(
                exec,
                &self.world,
                &self.rng,
                &mut self.stats,
                &mut buf,
                edge,
            )?;
            if probe.stopped {
                return self.skip();
            }
            match probe.mask {
                Some(m) => mask = m,
                None => {
                    // nothing preserved the edge; fall back to untargeted
                    self.blacklist(edge);
                    mask = BranchMask::permissive(buf.len());
                }
            }
        }

        // havoc, with the bucket pair conditioned on the input length
        let perf_score = corpus.entry(idx).perf_score;
        let mut state = HavocState::new(buf, mask);
        {
            let mut stage = HavocStage {
                exec,
                world: &self.world,
                cfg: &self.cfg,
                rng: &self.rng,
                stats: &mut self.stats,
                extras: &self.extras,
                corpus: &*corpus,
                cur_idx: idx,
                grid: &mut self.grid,
            };
            let outcome = stage.run(&mut state, perf_score, StageId::Havoc)?;
            if outcome.stopped {
                return self.skip();
            }
        }

        // splice retries: new base from another entry, default mask,
        // havoc again
        let mut splice_cycle = 0;
        while splice_cycle < self.cfg.splice_cycles && corpus.count() > 1 {
            splice_cycle += 1;
            if self.world.stop_requested() {
                return self.skip();
            }
            let Some((donor_idx, split_at)) = self.pick_splice(corpus, idx) else {
                continue;
            };
            let cur = &corpus.entry(idx).data;
            let donor = &corpus.entry(donor_idx).data;
            let mut spliced = Vec::with_capacity(donor.len());
            spliced.extend_from_slice(&cur[..split_at]);
            spliced.extend_from_slice(&donor[split_at..]);

            let mask = BranchMask::permissive(spliced.len());
            let mut state = HavocState::new(spliced, mask);
            let mut stage = HavocStage {
                exec,
                world: &self.world,
                cfg: &self.cfg,
                rng: &self.rng,
                stats: &mut self.stats,
                extras: &self.extras,
                corpus: &*corpus,
                cur_idx: idx,
                grid: &mut self.grid,
            };
            let outcome = stage.run(&mut state, perf_score, StageId::Splice)?;
            if outcome.stopped {
                return self.skip();
            }
        }

        corpus.entry_mut(idx).was_fuzzed = true;
        self.stats.seeds_fuzzed += 1;
        self.world
            .report_event(FuzzerEvent::SeedDone, Some(&self.stats));
        Ok(FuzzOneStatus::Fuzzed)
    }

    /// Find a splice donor: another entry of length >= 4 that differs from
    /// the current input over a range of at least two bytes. Returns the
    /// donor index and the split position.
    fn pick_splice<C: Corpus>(&self, corpus: &C, idx: usize) -> Option<(usize, usize)> {
        let cur = &corpus.entry(idx).data;
        for _ in 0..16 {
            let donor_idx = self.rng.below(corpus.count());
            if donor_idx == idx {
                continue;
            }
            let donor = &corpus.entry(donor_idx).data;
            if donor.len() < 4 {
                continue;
            }
            let (first, last) = locate_diffs(cur, donor);
            let (Some(first), Some(last)) = (first, last) else {
                continue;
            };
            if last < 2 || first == last {
                continue;
            }
            let split_at = first + self.rng.below(last - first);
            return Some((donor_idx, split_at));
        }
        None
    }
}

/// First and last positions where the two buffers differ, over their
/// common prefix length.
fn locate_diffs(a: &[u8], b: &[u8]) -> (Option<usize>, Option<usize>) {
    let mut first = None;
    let mut last = None;
    for i in 0..a.len().min(b.len()) {
        if a[i] != b[i] {
            if first.is_none() {
                first = Some(i);
            }
            last = Some(i);
        }
    }
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::CountingExecutor;
    use crate::queue::{QueueEntry, VecCorpus};

    const MAP: usize = 256;
    const RARE_EDGE: usize = 77;

    /// Edge 0 always fires; a handful of length-derived edges give every
    /// input family its own trace; the rare edge needs a `#` byte.
    fn target_executor() -> CountingExecutor {
        CountingExecutor::new(MAP, |input, map| {
            map.record(0);
            map.record(1 + input.len() % 50);
            if input.contains(&b'#') {
                map.record(RARE_EDGE);
            }
            ExecStatus::Ok
        })
    }

    fn small_config() -> Config {
        Config {
            map_size: MAP,
            havoc_min: 8,
            havoc_cycles: 8,
            splice_cycles: 2,
            skip_to_new_prob: 99,
            ..Config::default()
        }
    }

    fn corpus_with(entries: Vec<&[u8]>) -> VecCorpus {
        VecCorpus::new(
            entries
                .into_iter()
                .map(|data| QueueEntry::new(data.to_vec(), MAP))
                .collect(),
        )
    }

    #[test]
    fn fuzzes_a_seed_to_completion_in_targeted_mode() {
        let mut exec = target_executor();
        let mut corpus = corpus_with(vec![b"aa#aaa", b"bbbbbb"]);
        // drive the common edges into a higher tier, then let the marker
        // edge appear once so it is the lone rare edge
        for _ in 0..300 {
            exec.run(b"aaaaaa").unwrap();
        }
        exec.run(b"aa#aaa").unwrap();

        let mut state = FuzzState::new(small_config(), 7);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        let entry = corpus.entry(0);
        assert!(entry.was_fuzzed);
        assert!(entry.passed_det);
        assert!(entry.trim_done);
        assert!(entry.branch_fuzzed(RARE_EDGE));
        assert!(state.stats.seeds_fuzzed == 1);
        assert!(state.stats.stage(StageId::Havoc).execs > 0);
        assert!(state.stats.stage(StageId::Flip1).execs > 0);
    }

    #[test]
    fn seed_missing_every_rare_edge_is_skipped() {
        let mut exec = target_executor();
        let mut corpus = corpus_with(vec![b"no marker here", b"aa#aaa"]);
        // the rare edge exists globally, but entry 0 does not hit it, and
        // its own edges are common after a few runs
        for _ in 0..300 {
            exec.run(b"no marker here").unwrap();
        }
        exec.run(b"aa#aaa").unwrap();

        let mut state = FuzzState::new(small_config(), 11);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Skipped);
        assert_eq!(state.stats.seeds_skipped, 1);
        assert!(!corpus.entry(0).was_fuzzed);
    }

    #[test]
    fn vanilla_mode_runs_without_targeting() {
        let mut exec = target_executor();
        let mut corpus = corpus_with(vec![b"plain data", b"other data"]);
        let cfg = Config {
            rare_targeting: false,
            ..small_config()
        };
        let mut state = FuzzState::new(cfg, 3);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        // no trimming and no branch-mask probing in vanilla mode
        assert_eq!(state.stats.stage(StageId::Trim).execs, 0);
        assert_eq!(state.stats.stage(StageId::BranchMask).execs, 0);
    }

    #[test]
    fn unfavored_seed_is_skipped_while_favorites_are_pending() {
        let mut exec = target_executor();
        let mut corpus = corpus_with(vec![b"aa#aaa"]);
        corpus.pending_favored = 3;
        let cfg = Config {
            skip_to_new_prob: 100,
            ..small_config()
        };
        let mut state = FuzzState::new(cfg, 5);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Skipped);
        assert_eq!(exec.counters().total_execs, 0);
    }

    #[test]
    fn shadow_mode_rolls_back_the_untargeted_pass() {
        let mut exec = target_executor();
        let mut corpus = corpus_with(vec![b"aa#aaa", b"bbbbbb"]);
        exec.run(b"aa#aaa").unwrap();
        let queued_before = exec.counters().queued_paths;

        let cfg = Config {
            shadow_mode: true,
            ..small_config()
        };
        let mut state = FuzzState::new(cfg, 13);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        // both passes ran; the first one's calibration exec is part of the
        // discarded bracket but stats (core-side) keep counting
        assert!(state.stats.stage(StageId::Calibrate).execs >= 2);
        // the targeted pass still found whatever it found
        assert!(exec.counters().queued_paths >= queued_before);
    }

    #[test]
    fn trimming_commits_the_shorter_input_to_the_queue() {
        let mut exec = target_executor();
        let mut long: Vec<u8> = vec![b'x'; 120];
        long.push(b'#');
        let mut corpus = VecCorpus::new(vec![QueueEntry::new(long.clone(), MAP)]);
        // common edges first, so the marker edge stays in the rare tier
        let plain = vec![b'y'; 121];
        for _ in 0..300 {
            exec.run(&plain).unwrap();
        }
        exec.run(&long).unwrap();

        let cfg = Config {
            trim_min_bytes: 1,
            ..small_config()
        };
        let mut state = FuzzState::new(cfg, 17);
        let status = state.fuzz_one(&mut exec, &mut corpus, 0).unwrap();
        assert_eq!(status, FuzzOneStatus::Fuzzed);
        let entry = corpus.entry(0);
        assert!(entry.trim_done);
        assert!(entry.data.len() < long.len());
        assert!(entry.data.contains(&b'#'));
    }

    #[test]
    fn locate_diffs_finds_the_differing_range() {
        assert_eq!(locate_diffs(b"abcd", b"abcd"), (None, None));
        assert_eq!(locate_diffs(b"abcd", b"axcy"), (Some(1), Some(3)));
        assert_eq!(locate_diffs(b"abc", b"abcdef"), (None, None));
    }
}
