//! The stacked random mutation stage. Each iteration asks the operator
//! bandit for one of 23 op classes and the batch bandit for a stacking
//! size, applies the op that many times, executes once, and feeds the
//! outcome back to both bandits.
//!
//! Under rare-branch targeting every offset comes out of the branch-mask
//! position pools; an op that finds no legal position breaks its batch
//! early, and the executor still runs on whatever the batch produced.

use crate::bandit::{ArmMask, BanditGrid};
use crate::config::Config;
use crate::executor::{ExecError, Executor};
use crate::mask::{BranchMask, DELETE, OVERWRITE};
use crate::queue::{Corpus, ExtrasStore};
use crate::rng::Rng;
use crate::stats::{FuzzerStats, StageId};
use crate::world::World;

use super::tables::{INTERESTING_16, INTERESTING_32, INTERESTING_8};

/// The atomic havoc operator classes, one bandit arm each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HavocOp {
    FlipBit,
    InterestByte,
    InterestWordLe,
    InterestWordBe,
    InterestDwordLe,
    InterestDwordBe,
    ArithByte,
    ArithWordLe,
    ArithWordBe,
    ArithDwordLe,
    ArithDwordBe,
    RandByte,
    DeleteBytes,
    CloneBytes,
    InsertConstBytes,
    OverwriteChunk,
    OverwriteConstByte,
    OverwriteExtra,
    InsertExtra,
    OverwriteAutoExtra,
    InsertAutoExtra,
    SpliceOverwrite,
    SpliceInsert,
}

impl HavocOp {
    pub const COUNT: usize = 23;

    pub const ALL: [HavocOp; Self::COUNT] = [
        HavocOp::FlipBit,
        HavocOp::InterestByte,
        HavocOp::InterestWordLe,
        HavocOp::InterestWordBe,
        HavocOp::InterestDwordLe,
        HavocOp::InterestDwordBe,
        HavocOp::ArithByte,
        HavocOp::ArithWordLe,
        HavocOp::ArithWordBe,
        HavocOp::ArithDwordLe,
        HavocOp::ArithDwordBe,
        HavocOp::RandByte,
        HavocOp::DeleteBytes,
        HavocOp::CloneBytes,
        HavocOp::InsertConstBytes,
        HavocOp::OverwriteChunk,
        HavocOp::OverwriteConstByte,
        HavocOp::OverwriteExtra,
        HavocOp::InsertExtra,
        HavocOp::OverwriteAutoExtra,
        HavocOp::InsertAutoExtra,
        HavocOp::SpliceOverwrite,
        HavocOp::SpliceInsert,
    ];

    /// Structural ops change the buffer length; their batches are undone
    /// by a full restore instead of patch reverts.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            HavocOp::DeleteBytes
                | HavocOp::CloneBytes
                | HavocOp::InsertConstBytes
                | HavocOp::InsertExtra
                | HavocOp::InsertAutoExtra
                | HavocOp::SpliceInsert
        )
    }

    fn grows(self) -> bool {
        matches!(
            self,
            HavocOp::CloneBytes
                | HavocOp::InsertConstBytes
                | HavocOp::InsertExtra
                | HavocOp::InsertAutoExtra
                | HavocOp::SpliceInsert
        )
    }
}

/// Before-image of a fine-grained mutation.
struct Patch {
    pos: usize,
    old: Vec<u8>,
}

/// The working aggregate of the havoc stage: buffer, mask and scratch
/// space move together so growth ops can extend all of them atomically.
pub struct HavocState {
    pub buf: Vec<u8>,
    pub mask: BranchMask,
    offers: Vec<usize>,
    undo: Vec<Patch>,
    structural: bool,
}

impl HavocState {
    pub fn new(buf: Vec<u8>, mask: BranchMask) -> Self {
        debug_assert_eq!(mask.input_len(), buf.len());
        Self {
            buf,
            mask,
            offers: Vec::new(),
            undo: Vec::new(),
            structural: false,
        }
    }

    fn record_patch(&mut self, pos: usize, len: usize) {
        self.undo.push(Patch {
            pos,
            old: self.buf[pos..pos + len].to_vec(),
        });
    }

    fn revert_patches(&mut self) {
        while let Some(patch) = self.undo.pop() {
            self.buf[patch.pos..patch.pos + patch.old.len()].copy_from_slice(&patch.old);
        }
    }
}

pub struct HavocOutcome {
    pub stopped: bool,
    /// Performance score after reward-driven scaling.
    pub perf_score: usize,
}

pub struct HavocStage<'a, E: Executor, C: Corpus + ?Sized> {
    pub exec: &'a mut E,
    pub world: &'a World,
    pub cfg: &'a Config,
    pub rng: &'a Rng,
    pub stats: &'a mut FuzzerStats,
    pub extras: &'a ExtrasStore,
    pub corpus: &'a C,
    /// Queue index of the seed being fuzzed; splice ops avoid it.
    pub cur_idx: usize,
    pub grid: &'a mut BanditGrid,
}

impl<'a, E: Executor, C: Corpus + ?Sized> HavocStage<'a, E, C> {
    pub fn run(
        &mut self,
        state: &mut HavocState,
        perf_score: usize,
        stage: StageId,
    ) -> Result<HavocOutcome, ExecError> {
        let cfg = self.cfg;
        let mut perf_score = perf_score.max(1);
        let mut stage_max = cfg
            .havoc_min
            .max(cfg.havoc_cycles * perf_score / cfg.havoc_div / 100);

        let base_buf = state.buf.clone();
        let base_mask = state.mask.clone();
        let bucket = self.grid.bucket_index(state.buf.len());

        let finds_before = self.exec.counters().queued_paths + self.exec.counters().crashes;
        let mut queued_before = self.exec.counters().queued_paths;
        let mut stopped = false;

        let mut iter = 0;
        while iter < stage_max {
            if self.world.stop_requested() {
                stopped = true;
                break;
            }

            let op_mask = self.build_op_mask(state.buf.len());
            let op_arm = self
                .grid
                .bucket_at_mut(bucket)
                .ops
                .select_arm(self.rng, Some(&op_mask));
            let batch_arm = self
                .grid
                .bucket_at_mut(bucket)
                .batches
                .select_arm(self.rng, None);
            let batch = cfg.batch_size(batch_arm);

            state.undo.clear();
            state.structural = false;
            let op = HavocOp::ALL[op_arm % HavocOp::COUNT];
            for _ in 0..batch {
                if !self.apply_op(op, state) {
                    break;
                }
            }

            self.exec.run(&state.buf)?;
            self.stats.record_exec(stage);

            let queued_now = self.exec.counters().queued_paths;
            let reward = if queued_now > queued_before { 1.0 } else { 0.0 };
            queued_before = queued_now;

            let grid_bucket = self.grid.bucket_at_mut(bucket);
            grid_bucket.ops.add_reward(op_arm, reward);
            grid_bucket.batches.add_reward(batch_arm, reward);

            if reward > 0.0 {
                self.stats.havoc_rewards += 1;
                // found something: afford this seed a longer stage
                if perf_score <= cfg.havoc_max_mult * 100 {
                    stage_max *= 2;
                    perf_score *= 2;
                }
            }

            if state.structural {
                state.buf.clone_from(&base_buf);
                state.mask.clone_from(&base_mask);
                state.undo.clear();
            } else {
                state.revert_patches();
            }
            iter += 1;
        }

        let finds_after = self.exec.counters().queued_paths + self.exec.counters().crashes;
        self.stats.record_finds(stage, finds_after - finds_before);

        Ok(HavocOutcome {
            stopped,
            perf_score,
        })
    }

    /// Arms that cannot fire right now: dictionary ops without tokens,
    /// splice ops without a second corpus entry, growth ops at the size
    /// cap, deletion on a sub-2-byte buffer.
    pub(crate) fn build_op_mask(&self, buf_len: usize) -> ArmMask {
        let mut mask = ArmMask::allow_all(self.cfg.havoc_op_arms);
        for (arm, op) in HavocOp::ALL.iter().enumerate().take(self.cfg.havoc_op_arms) {
            let banned = match op {
                HavocOp::OverwriteExtra | HavocOp::InsertExtra => !self.extras.has_user(),
                HavocOp::OverwriteAutoExtra | HavocOp::InsertAutoExtra => !self.extras.has_auto(),
                HavocOp::SpliceOverwrite | HavocOp::SpliceInsert => self.corpus.count() <= 1,
                HavocOp::DeleteBytes => buf_len < 2,
                _ => false,
            };
            let banned = banned || (op.grows() && buf_len >= self.cfg.max_file);
            if banned {
                mask.ban(arm);
            }
        }
        mask
    }

    /// Block length ladder for structural ops, weighted towards small
    /// blocks early in the run.
    fn choose_block_len(&self, limit: usize) -> usize {
        debug_assert!(limit > 0);
        let rlim = self.corpus.cycle().clamp(1, 3);
        let (mut min_value, max_value) = match self.rng.below(rlim) {
            0 => (1, self.cfg.havoc_blk_small),
            1 => (self.cfg.havoc_blk_small, self.cfg.havoc_blk_medium),
            _ => {
                if self.rng.below(10) != 0 {
                    (self.cfg.havoc_blk_medium, self.cfg.havoc_blk_large)
                } else {
                    (self.cfg.havoc_blk_large, self.cfg.havoc_blk_xl)
                }
            }
        };
        if min_value >= limit {
            min_value = 1;
        }
        min_value + self.rng.below(max_value.min(limit) - min_value + 1)
    }

    fn random_corpus_donor(&self) -> Option<usize> {
        if self.corpus.count() <= 1 {
            return None;
        }
        // bounded retry; the corpus has at least one other entry
        for _ in 0..8 {
            let idx = self.rng.below(self.corpus.count());
            if idx != self.cur_idx && !self.corpus.entry(idx).is_empty() {
                return Some(idx);
            }
        }
        None
    }

    /// Apply one in-batch application of `op`. Returns false when no
    /// legal position exists, which ends the batch.
    fn apply_op(&mut self, op: HavocOp, state: &mut HavocState) -> bool {
        let rng = self.rng;
        let len = state.buf.len();
        match op {
            HavocOp::FlipBit => {
                let Some((byte, bit)) = state.mask.pick_bit_pos(rng, &mut state.offers) else {
                    return false;
                };
                state.record_patch(byte, 1);
                state.buf[byte] ^= 128 >> bit;
            }
            HavocOp::InterestByte => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 8, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 1);
                state.buf[pos] = INTERESTING_8[rng.below(INTERESTING_8.len())] as u8;
            }
            HavocOp::InterestWordLe | HavocOp::InterestWordBe => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 16, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 2);
                let v = INTERESTING_16[rng.below(INTERESTING_16.len())] as u16;
                let bytes = if op == HavocOp::InterestWordLe {
                    v.to_le_bytes()
                } else {
                    v.to_be_bytes()
                };
                state.buf[pos..pos + 2].copy_from_slice(&bytes);
            }
            HavocOp::InterestDwordLe | HavocOp::InterestDwordBe => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 32, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 4);
                let v = INTERESTING_32[rng.below(INTERESTING_32.len())] as u32;
                let bytes = if op == HavocOp::InterestDwordLe {
                    v.to_le_bytes()
                } else {
                    v.to_be_bytes()
                };
                state.buf[pos..pos + 4].copy_from_slice(&bytes);
            }
            HavocOp::ArithByte => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 8, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 1);
                let delta = 1 + rng.below(self.cfg.arith_max as usize) as u8;
                state.buf[pos] = if rng.bool() {
                    state.buf[pos].wrapping_add(delta)
                } else {
                    state.buf[pos].wrapping_sub(delta)
                };
            }
            HavocOp::ArithWordLe | HavocOp::ArithWordBe => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 16, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 2);
                let delta = 1 + rng.below(self.cfg.arith_max as usize) as u16;
                let le = op == HavocOp::ArithWordLe;
                let raw = [state.buf[pos], state.buf[pos + 1]];
                let v = if le {
                    u16::from_le_bytes(raw)
                } else {
                    u16::from_be_bytes(raw)
                };
                let v = if rng.bool() {
                    v.wrapping_add(delta)
                } else {
                    v.wrapping_sub(delta)
                };
                let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
                state.buf[pos..pos + 2].copy_from_slice(&bytes);
            }
            HavocOp::ArithDwordLe | HavocOp::ArithDwordBe => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 32, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 4);
                let delta = 1 + rng.below(self.cfg.arith_max as usize) as u32;
                let le = op == HavocOp::ArithDwordLe;
                let raw = [
                    state.buf[pos],
                    state.buf[pos + 1],
                    state.buf[pos + 2],
                    state.buf[pos + 3],
                ];
                let v = if le {
                    u32::from_le_bytes(raw)
                } else {
                    u32::from_be_bytes(raw)
                };
                let v = if rng.bool() {
                    v.wrapping_add(delta)
                } else {
                    v.wrapping_sub(delta)
                };
                let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
                state.buf[pos..pos + 4].copy_from_slice(&bytes);
            }
            HavocOp::RandByte => {
                let Some(pos) = state.mask.pick_pos(rng, OVERWRITE, 8, &mut state.offers) else {
                    return false;
                };
                state.record_patch(pos, 1);
                state.buf[pos] ^= 1 + rng.below(255) as u8;
            }
            HavocOp::DeleteBytes => {
                if len < 2 {
                    return false;
                }
                let del_len = self.choose_block_len(len - 1);
                let Some(pos) = state
                    .mask
                    .pick_pos(rng, DELETE, del_len * 8, &mut state.offers)
                else {
                    return false;
                };
                state.buf.drain(pos..pos + del_len);
                state.mask.shrink_at(pos, del_len);
                state.structural = true;
            }
            HavocOp::CloneBytes => {
                if len == 0 {
                    return false;
                }
                let clone_len = self.choose_block_len(len);
                if len + clone_len > self.cfg.max_file {
                    return false;
                }
                let Some(pos) = state.mask.pick_insert_pos(rng, &mut state.offers) else {
                    return false;
                };
                let from = rng.below(len - clone_len + 1);
                let chunk: Vec<u8> = state.buf[from..from + clone_len].to_vec();
                state.buf.splice(pos..pos, chunk);
                state.mask.grow_at(pos, clone_len);
                state.structural = true;
            }
            HavocOp::InsertConstBytes => {
                let block_len = self.choose_block_len(self.cfg.havoc_blk_xl);
                if len + block_len > self.cfg.max_file {
                    return false;
                }
                let Some(pos) = state.mask.pick_insert_pos(rng, &mut state.offers) else {
                    return false;
                };
                let val = if rng.bool() || len == 0 {
                    rng.byte()
                } else {
                    state.buf[rng.below(len)]
                };
                state.buf.splice(pos..pos, std::iter::repeat(val).take(block_len));
                state.mask.grow_at(pos, block_len);
                state.structural = true;
            }
            HavocOp::OverwriteChunk => {
                if len < 2 {
                    return false;
                }
                let copy_len = self.choose_block_len(len - 1);
                let Some(pos) = state
                    .mask
                    .pick_pos(rng, OVERWRITE, copy_len * 8, &mut state.offers)
                else {
                    return false;
                };
                let from = rng.below(len - copy_len + 1);
                if from == pos {
                    return true;
                }
                state.record_patch(pos, copy_len);
                let chunk: Vec<u8> = state.buf[from..from + copy_len].to_vec();
                state.buf[pos..pos + copy_len].copy_from_slice(&chunk);
            }
            HavocOp::OverwriteConstByte => {
                if len < 2 {
                    return false;
                }
                let fill_len = self.choose_block_len(len - 1);
                let Some(pos) = state
                    .mask
                    .pick_pos(rng, OVERWRITE, fill_len * 8, &mut state.offers)
                else {
                    return false;
                };
                state.record_patch(pos, fill_len);
                let val = if rng.bool() {
                    rng.byte()
                } else {
                    state.buf[rng.below(len)]
                };
                for b in &mut state.buf[pos..pos + fill_len] {
                    *b = val;
                }
            }
            HavocOp::OverwriteExtra | HavocOp::OverwriteAutoExtra => {
                let token = match self.pick_token(op == HavocOp::OverwriteAutoExtra) {
                    Some(t) => t,
                    None => return false,
                };
                if token.len() > len {
                    return false;
                }
                let Some(pos) = state
                    .mask
                    .pick_pos(rng, OVERWRITE, token.len() * 8, &mut state.offers)
                else {
                    return false;
                };
                state.record_patch(pos, token.len());
                state.buf[pos..pos + token.len()].copy_from_slice(token);
            }
            HavocOp::InsertExtra | HavocOp::InsertAutoExtra => {
                let token = match self.pick_token(op == HavocOp::InsertAutoExtra) {
                    Some(t) => t,
                    None => return false,
                };
                if len + token.len() > self.cfg.max_file {
                    return false;
                }
                let Some(pos) = state.mask.pick_insert_pos(rng, &mut state.offers) else {
                    return false;
                };
                let token = token.to_vec();
                let tlen = token.len();
                state.buf.splice(pos..pos, token);
                state.mask.grow_at(pos, tlen);
                state.structural = true;
            }
            HavocOp::SpliceOverwrite => {
                let Some(donor_idx) = self.random_corpus_donor() else {
                    return false;
                };
                let donor = &self.corpus.entry(donor_idx).data;
                let copy_len = self.choose_block_len(donor.len().min(len.max(1)));
                if copy_len > len {
                    return false;
                }
                let Some(pos) = state
                    .mask
                    .pick_pos(rng, OVERWRITE, copy_len * 8, &mut state.offers)
                else {
                    return false;
                };
                let from = rng.below(donor.len() - copy_len + 1);
                let chunk: Vec<u8> = donor[from..from + copy_len].to_vec();
                state.record_patch(pos, copy_len);
                state.buf[pos..pos + copy_len].copy_from_slice(&chunk);
            }
            HavocOp::SpliceInsert => {
                let Some(donor_idx) = self.random_corpus_donor() else {
                    return false;
                };
                let donor = &self.corpus.entry(donor_idx).data;
                let clone_len = self.choose_block_len(donor.len());
                if len + clone_len > self.cfg.max_file {
                    return false;
                }
                let Some(pos) = state.mask.pick_insert_pos(rng, &mut state.offers) else {
                    return false;
                };
                let from = rng.below(donor.len() - clone_len + 1);
                let chunk: Vec<u8> = donor[from..from + clone_len].to_vec();
                state.buf.splice(pos..pos, chunk);
                state.mask.grow_at(pos, clone_len);
                state.structural = true;
            }
        }
        true
    }

    fn pick_token(&self, auto: bool) -> Option<&[u8]> {
        let pool = if auto {
            let usable = self.extras.auto().len().min(self.cfg.use_auto_extras);
            &self.extras.auto()[..usable]
        } else {
            self.extras.user()
        };
        if pool.is_empty() {
            None
        } else {
            Some(&pool[self.rng.below(pool.len())].data)
        }
    }
}
