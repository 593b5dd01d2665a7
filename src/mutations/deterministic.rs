//! The deterministic walk over a seed: bit flips, arithmetic,
//! interesting-value substitutions and dictionary stages, in a fixed
//! order, each candidate executed once and reverted.
//!
//! Two maps are built as side products and gate everything downstream:
//! the effector map (which 8-byte chunks react to being touched at all)
//! and, under rare-branch targeting, the branch mask (which positions can
//! be overwritten, deleted, or inserted into without losing the target
//! edge).

use crate::config::Config;
use crate::coverage::EdgeId;
use crate::executor::{ExecError, Executor};
use crate::mask::{BranchMask, DELETE, INSERT, OVERWRITE};
use crate::queue::ExtrasStore;
use crate::rng::Rng;
use crate::stats::{FuzzerStats, StageId};
use crate::world::World;

use super::predicates::{could_be_arith, could_be_bitflip, could_be_interest};
use super::tables::{INTERESTING_16, INTERESTING_32, INTERESTING_8};
use super::total_finds;

#[inline]
fn flip_bit(buf: &mut [u8], bit: usize) {
    buf[bit >> 3] ^= 128 >> (bit & 7);
}

/// One flag per 8-byte chunk: does touching this chunk change the trace
/// checksum at all? Chunks that never do are skipped by the expensive
/// stages.
pub struct EffectorMap {
    flags: Vec<bool>,
    marked: usize,
}

const EFF_SCALE: usize = 3;

#[inline]
fn eff_pos(byte: usize) -> usize {
    byte >> EFF_SCALE
}

impl EffectorMap {
    pub fn new(input_len: usize) -> Self {
        let chunks = if input_len == 0 {
            1
        } else {
            eff_pos(input_len - 1) + 1
        };
        let mut map = Self {
            flags: vec![false; chunks],
            marked: 0,
        };
        // the first and last chunks are always considered live
        map.mark(0);
        if input_len > 0 {
            map.mark(input_len - 1);
        }
        map
    }

    pub fn effective_at(&self, byte: usize) -> bool {
        self.flags[eff_pos(byte)]
    }

    pub fn mark(&mut self, byte: usize) {
        let chunk = eff_pos(byte);
        if !self.flags[chunk] {
            self.flags[chunk] = true;
            self.marked += 1;
        }
    }

    /// If nearly everything turned out effective, stop pretending the map
    /// carries information and mark the rest too.
    pub fn finalize(&mut self, max_perc: usize) {
        let total = self.flags.len();
        if self.marked != total && self.marked * 100 / total > max_perc {
            for f in self.flags.iter_mut() {
                *f = true;
            }
            self.marked = total;
        }
    }
}

pub struct DetOutcome {
    pub stopped: bool,
    /// The overwrite sweep found no safe position; the caller should
    /// blacklist the target edge.
    pub target_dropped: bool,
}

/// Result of the standalone mask probe used when the deterministic stages
/// are skipped for a seed.
pub struct MaskProbe {
    /// `None` when no position tolerated an overwrite.
    pub mask: Option<BranchMask>,
    pub stopped: bool,
}

/// Probe every byte of `buf` with the three sweeps of the branch-mask
/// construction, without running any other deterministic stage.
pub fn probe_branch_mask<E: Executor>(
    exec: &mut E,
    world: &World,
    rng: &Rng,
    stats: &mut FuzzerStats,
    buf: &mut Vec<u8>,
    target: EdgeId,
) -> Result<MaskProbe, ExecError> {
    let mut mask = BranchMask::blank(buf.len());
    let mut stopped = false;

    // overwrite sweep
    for i in 0..buf.len() {
        if world.stop_requested() {
            stopped = true;
            break;
        }
        let orig = buf[i];
        buf[i] = orig ^ 0xff;
        exec.run(buf)?;
        stats.record_exec(StageId::BranchMask);
        buf[i] = orig;
        if exec.trace_contains(target) {
            mask.set_bit(i, OVERWRITE);
        }
    }
    if stopped {
        return Ok(MaskProbe { mask: None, stopped });
    }
    if mask.count_with_bit(OVERWRITE) == 0 {
        return Ok(MaskProbe { mask: None, stopped });
    }

    stopped = delete_sweep(exec, world, stats, buf, target, &mut mask)?
        || insert_sweep(exec, world, rng, stats, buf, target, &mut mask)?;
    Ok(MaskProbe {
        mask: Some(mask),
        stopped,
    })
}

fn delete_sweep<E: Executor>(
    exec: &mut E,
    world: &World,
    stats: &mut FuzzerStats,
    buf: &[u8],
    target: EdgeId,
    mask: &mut BranchMask,
) -> Result<bool, ExecError> {
    let mut scratch = Vec::with_capacity(buf.len());
    for i in 0..buf.len() {
        if world.stop_requested() {
            return Ok(true);
        }
        scratch.clear();
        scratch.extend_from_slice(&buf[..i]);
        scratch.extend_from_slice(&buf[i + 1..]);
        exec.run(&scratch)?;
        stats.record_exec(StageId::BranchMask);
        if exec.trace_contains(target) {
            mask.set_bit(i, DELETE);
        }
    }
    Ok(false)
}

fn insert_sweep<E: Executor>(
    exec: &mut E,
    world: &World,
    rng: &Rng,
    stats: &mut FuzzerStats,
    buf: &[u8],
    target: EdgeId,
    mask: &mut BranchMask,
) -> Result<bool, ExecError> {
    let mut scratch = Vec::with_capacity(buf.len() + 1);
    for i in 0..=buf.len() {
        if world.stop_requested() {
            return Ok(true);
        }
        scratch.clear();
        scratch.extend_from_slice(&buf[..i]);
        scratch.push(rng.byte());
        scratch.extend_from_slice(&buf[i..]);
        exec.run(&scratch)?;
        stats.record_exec(StageId::BranchMask);
        if exec.trace_contains(target) {
            mask.set_bit(i, INSERT);
        }
    }
    Ok(false)
}

pub struct DetStages<'a, E: Executor> {
    exec: &'a mut E,
    world: &'a World,
    cfg: &'a Config,
    rng: &'a Rng,
    stats: &'a mut FuzzerStats,
    extras: &'a mut ExtrasStore,
    buf: &'a mut Vec<u8>,
    mask: &'a mut BranchMask,
    target: Option<EdgeId>,
    /// Trace hash of the unmutated seed, from its calibration run.
    base_cksum: u64,
    eff: EffectorMap,
    stopped: bool,
    target_dropped: bool,
}

impl<'a, E: Executor> DetStages<'a, E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exec: &'a mut E,
        world: &'a World,
        cfg: &'a Config,
        rng: &'a Rng,
        stats: &'a mut FuzzerStats,
        extras: &'a mut ExtrasStore,
        buf: &'a mut Vec<u8>,
        mask: &'a mut BranchMask,
        target: Option<EdgeId>,
        base_cksum: u64,
    ) -> Self {
        let eff = EffectorMap::new(buf.len());
        Self {
            exec,
            world,
            cfg,
            rng,
            stats,
            extras,
            buf,
            mask,
            target,
            base_cksum,
            eff,
            stopped: false,
            target_dropped: false,
        }
    }

    pub fn run(mut self) -> Result<DetOutcome, ExecError> {
        if self.buf.is_empty() {
            return Ok(self.outcome());
        }
        self.stage_flip1()?;
        self.stage_flip8()?;
        self.stage_flip2()?;
        self.stage_flip4()?;
        self.stage_flip16()?;
        self.stage_flip32()?;
        self.stage_arith8()?;
        self.stage_arith16()?;
        self.stage_arith32()?;
        self.stage_interest8()?;
        self.stage_interest16()?;
        self.stage_interest32()?;
        self.stage_extras_overwrite(StageId::ExtrasUserOverwrite)?;
        self.stage_extras_insert()?;
        self.stage_extras_overwrite(StageId::ExtrasAutoOverwrite)?;
        Ok(self.outcome())
    }

    fn outcome(&self) -> DetOutcome {
        DetOutcome {
            stopped: self.stopped,
            target_dropped: self.target_dropped,
        }
    }

    /// Execute the current buffer for one candidate. Returns false when
    /// the stage must stop (stop signal seen before the run).
    fn run_current(&mut self, stage: StageId) -> Result<bool, ExecError> {
        if self.stopped || self.world.stop_requested() {
            self.stopped = true;
            return Ok(false);
        }
        self.exec.run(self.buf)?;
        self.stats.record_exec(stage);
        Ok(true)
    }

    /// Same, for candidates that live in a scratch buffer of a different
    /// length (inserts, sweeps).
    fn run_scratch(&mut self, stage: StageId, data: &[u8]) -> Result<bool, ExecError> {
        if self.stopped || self.world.stop_requested() {
            self.stopped = true;
            return Ok(false);
        }
        self.exec.run(data)?;
        self.stats.record_exec(stage);
        Ok(true)
    }

    fn finds_now(&self) -> usize {
        total_finds(&self.exec.counters())
    }

    /// Whether a `width`-byte write at `pos` is allowed by the effector
    /// map and, under targeting, by the branch mask.
    fn write_allowed(&self, pos: usize, width: usize) -> bool {
        let eff_ok = (pos..pos + width).any(|i| self.eff.effective_at(i));
        let mask_ok = self.target.is_none() || self.mask.range_overwritable(pos, width);
        eff_ok && mask_ok
    }

    /// Stricter gate for the wide flips: every chunk involved must be
    /// effective.
    fn all_chunks_effective(&self, pos: usize, width: usize) -> bool {
        (pos..pos + width).all(|i| self.eff.effective_at(i))
    }

    // ---- stage 1: walking single-bit flips + token mining ----

    fn stage_flip1(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let len = self.buf.len();
        let stage_max = len * 8;
        let mut prev_cksum = self.base_cksum;
        let mut collect: Vec<u8> = Vec::new();

        for cur in 0..stage_max {
            flip_bit(self.buf, cur);
            let ran = self.run_current(StageId::Flip1)?;
            flip_bit(self.buf, cur);
            if !ran {
                break;
            }

            // token mining: runs of bytes whose flipped trace hash stays
            // put, bracketed by hash changes, look like magic values
            if cur & 7 == 7 {
                let byte = cur >> 3;
                let cksum = self.exec.exec_cksum();
                if cur == stage_max - 1 && cksum == prev_cksum {
                    if collect.len() < self.cfg.max_auto_extra {
                        collect.push(self.buf[byte]);
                    }
                    if collect.len() >= self.cfg.min_auto_extra {
                        self.extras.maybe_add_auto(&collect, self.rng);
                    }
                } else if cksum != prev_cksum {
                    if collect.len() >= self.cfg.min_auto_extra {
                        self.extras.maybe_add_auto(&collect, self.rng);
                    }
                    collect.clear();
                    prev_cksum = cksum;
                }
                if cksum != self.base_cksum && collect.len() < self.cfg.max_auto_extra {
                    collect.push(self.buf[byte]);
                }
            }
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Flip1, found);
        Ok(())
    }

    // ---- stage 2: byte inversions; builds the effector map and the
    // overwrite bits of the branch mask, then runs the delete and insert
    // sweeps ----

    fn stage_flip8(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let len = self.buf.len();

        for i in 0..len {
            self.buf[i] ^= 0xff;
            let ran = self.run_current(StageId::Flip8)?;
            if ran {
                if let Some(target) = self.target {
                    if self.exec.trace_contains(target) {
                        self.mask.set_bit(i, OVERWRITE);
                    }
                }
                if !self.eff.effective_at(i) {
                    let cksum = if len >= self.cfg.eff_min_len {
                        self.exec.exec_cksum()
                    } else {
                        !self.base_cksum
                    };
                    if cksum != self.base_cksum {
                        self.eff.mark(i);
                    }
                }
            }
            self.buf[i] ^= 0xff;
            if !ran {
                break;
            }
        }
        self.eff.finalize(self.cfg.eff_max_perc);
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Flip8, found);

        if self.stopped {
            return Ok(());
        }
        if let Some(target) = self.target {
            if self.mask.count_with_bit(OVERWRITE) == 0 {
                // nothing preserves the edge; degrade to untargeted
                self.target = None;
                self.target_dropped = true;
                *self.mask = BranchMask::permissive(len);
            } else {
                let stopped =
                    delete_sweep(self.exec, self.world, self.stats, self.buf, target, self.mask)?
                        || insert_sweep(
                            self.exec, self.world, self.rng, self.stats, self.buf, target,
                            self.mask,
                        )?;
                self.stopped = stopped;
            }
        }
        Ok(())
    }

    // ---- stages 3-4: walking two- and four-bit flips ----

    fn stage_flip2(&mut self) -> Result<(), ExecError> {
        self.walking_flip(StageId::Flip2, 2)
    }

    fn stage_flip4(&mut self) -> Result<(), ExecError> {
        self.walking_flip(StageId::Flip4, 4)
    }

    fn walking_flip(&mut self, stage: StageId, width_bits: usize) -> Result<(), ExecError> {
        let before = self.finds_now();
        let len = self.buf.len();
        if len * 8 < width_bits {
            return Ok(());
        }
        for cur in 0..len * 8 - (width_bits - 1) {
            let first_byte = cur >> 3;
            let last_byte = (cur + width_bits - 1) >> 3;
            let span = last_byte - first_byte + 1;
            if !self.write_allowed(first_byte, span) {
                self.stats.record_skip(stage);
                continue;
            }
            for b in 0..width_bits {
                flip_bit(self.buf, cur + b);
            }
            let ran = self.run_current(stage)?;
            for b in 0..width_bits {
                flip_bit(self.buf, cur + b);
            }
            if !ran {
                break;
            }
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(stage, found);
        Ok(())
    }

    // ---- stages 5-6: word and dword inversions ----

    fn stage_flip16(&mut self) -> Result<(), ExecError> {
        self.wide_flip(StageId::Flip16, 2)
    }

    fn stage_flip32(&mut self) -> Result<(), ExecError> {
        self.wide_flip(StageId::Flip32, 4)
    }

    fn wide_flip(&mut self, stage: StageId, width: usize) -> Result<(), ExecError> {
        let before = self.finds_now();
        let len = self.buf.len();
        if len < width {
            return Ok(());
        }
        for i in 0..=len - width {
            if !self.all_chunks_effective(i, width)
                || (self.target.is_some() && !self.mask.range_overwritable(i, width))
            {
                self.stats.record_skip(stage);
                continue;
            }
            for b in 0..width {
                self.buf[i + b] ^= 0xff;
            }
            let ran = self.run_current(stage)?;
            for b in 0..width {
                self.buf[i + b] ^= 0xff;
            }
            if !ran {
                break;
            }
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(stage, found);
        Ok(())
    }

    // ---- stages 7-9: arithmetic ----

    fn stage_arith8(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max;
        'outer: for i in 0..self.buf.len() {
            if !self.write_allowed(i, 1) {
                self.stats.record_skip(StageId::Arith8);
                continue;
            }
            let orig = self.buf[i];
            for j in 1..=arith_max {
                let plus = orig.wrapping_add(j as u8);
                if !could_be_bitflip(u32::from(orig ^ plus)) {
                    self.buf[i] = plus;
                    if !self.run_current(StageId::Arith8)? {
                        self.buf[i] = orig;
                        break 'outer;
                    }
                } else {
                    self.stats.record_skip(StageId::Arith8);
                }
                let minus = orig.wrapping_sub(j as u8);
                if !could_be_bitflip(u32::from(orig ^ minus)) {
                    self.buf[i] = minus;
                    if !self.run_current(StageId::Arith8)? {
                        self.buf[i] = orig;
                        break 'outer;
                    }
                } else {
                    self.stats.record_skip(StageId::Arith8);
                }
            }
            self.buf[i] = orig;
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Arith8, found);
        Ok(())
    }

    fn stage_arith16(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max as u16;
        let len = self.buf.len();
        if len < 2 {
            return Ok(());
        }
        'outer: for i in 0..len - 1 {
            if !self.write_allowed(i, 2) {
                self.stats.record_skip(StageId::Arith16);
                continue;
            }
            let orig = u16::from_le_bytes([self.buf[i], self.buf[i + 1]]);
            for j in 1..=arith_max {
                // operations indistinguishable from single-byte arith are
                // only tried when they carry across the byte boundary
                let candidates = [
                    ((orig & 0xff) + j > 0xff, orig.wrapping_add(j)),
                    ((orig & 0xff) < j, orig.wrapping_sub(j)),
                    (
                        (orig >> 8) + j > 0xff,
                        orig.swap_bytes().wrapping_add(j).swap_bytes(),
                    ),
                    (
                        (orig >> 8) < j,
                        orig.swap_bytes().wrapping_sub(j).swap_bytes(),
                    ),
                ];
                for (wanted, new_val) in candidates {
                    if wanted && !could_be_bitflip(u32::from(orig ^ new_val)) {
                        self.buf[i..i + 2].copy_from_slice(&new_val.to_le_bytes());
                        if !self.run_current(StageId::Arith16)? {
                            self.buf[i..i + 2].copy_from_slice(&orig.to_le_bytes());
                            break 'outer;
                        }
                    } else {
                        self.stats.record_skip(StageId::Arith16);
                    }
                }
            }
            self.buf[i..i + 2].copy_from_slice(&orig.to_le_bytes());
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Arith16, found);
        Ok(())
    }

    fn stage_arith32(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max;
        let len = self.buf.len();
        if len < 4 {
            return Ok(());
        }
        'outer: for i in 0..len - 3 {
            if !self.write_allowed(i, 4) {
                self.stats.record_skip(StageId::Arith32);
                continue;
            }
            let orig = u32::from_le_bytes([
                self.buf[i],
                self.buf[i + 1],
                self.buf[i + 2],
                self.buf[i + 3],
            ]);
            for j in 1..=arith_max {
                let candidates = [
                    ((orig & 0xffff) + j > 0xffff, orig.wrapping_add(j)),
                    ((orig & 0xffff) < j, orig.wrapping_sub(j)),
                    (
                        (orig.swap_bytes() & 0xffff) + j > 0xffff,
                        orig.swap_bytes().wrapping_add(j).swap_bytes(),
                    ),
                    (
                        (orig.swap_bytes() & 0xffff) < j,
                        orig.swap_bytes().wrapping_sub(j).swap_bytes(),
                    ),
                ];
                for (wanted, new_val) in candidates {
                    if wanted && !could_be_bitflip(orig ^ new_val) {
                        self.buf[i..i + 4].copy_from_slice(&new_val.to_le_bytes());
                        if !self.run_current(StageId::Arith32)? {
                            self.buf[i..i + 4].copy_from_slice(&orig.to_le_bytes());
                            break 'outer;
                        }
                    } else {
                        self.stats.record_skip(StageId::Arith32);
                    }
                }
            }
            self.buf[i..i + 4].copy_from_slice(&orig.to_le_bytes());
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Arith32, found);
        Ok(())
    }

    // ---- stages 10-12: interesting values ----

    fn stage_interest8(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max;
        'outer: for i in 0..self.buf.len() {
            if !self.write_allowed(i, 1) {
                self.stats.record_skip(StageId::Interest8);
                continue;
            }
            let orig = self.buf[i];
            for &v in &INTERESTING_8 {
                let v = v as u8;
                if could_be_bitflip(u32::from(orig ^ v))
                    || could_be_arith(u32::from(orig), u32::from(v), 1, arith_max)
                {
                    self.stats.record_skip(StageId::Interest8);
                    continue;
                }
                self.buf[i] = v;
                if !self.run_current(StageId::Interest8)? {
                    self.buf[i] = orig;
                    break 'outer;
                }
            }
            self.buf[i] = orig;
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Interest8, found);
        Ok(())
    }

    fn stage_interest16(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max;
        let len = self.buf.len();
        if len < 2 {
            return Ok(());
        }
        'outer: for i in 0..len - 1 {
            if !self.write_allowed(i, 2) {
                self.stats.record_skip(StageId::Interest16);
                continue;
            }
            let orig = u16::from_le_bytes([self.buf[i], self.buf[i + 1]]);
            for &v in &INTERESTING_16 {
                let le = v as u16;
                let be = le.swap_bytes();
                let mut tries = [Some(le), None];
                if be != le {
                    tries[1] = Some(be);
                }
                for (endian, val) in tries.iter().enumerate() {
                    let Some(val) = *val else { continue };
                    let check_le = endian == 1;
                    if could_be_arith(u32::from(orig), u32::from(val), 2, arith_max)
                        || could_be_bitflip(u32::from(orig ^ val))
                        || could_be_interest(u32::from(orig), u32::from(val), 2, check_le)
                    {
                        self.stats.record_skip(StageId::Interest16);
                        continue;
                    }
                    self.buf[i..i + 2].copy_from_slice(&val.to_le_bytes());
                    if !self.run_current(StageId::Interest16)? {
                        self.buf[i..i + 2].copy_from_slice(&orig.to_le_bytes());
                        break 'outer;
                    }
                }
            }
            self.buf[i..i + 2].copy_from_slice(&orig.to_le_bytes());
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Interest16, found);
        Ok(())
    }

    fn stage_interest32(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        let arith_max = self.cfg.arith_max;
        let len = self.buf.len();
        if len < 4 {
            return Ok(());
        }
        'outer: for i in 0..len - 3 {
            if !self.write_allowed(i, 4) {
                self.stats.record_skip(StageId::Interest32);
                continue;
            }
            let orig = u32::from_le_bytes([
                self.buf[i],
                self.buf[i + 1],
                self.buf[i + 2],
                self.buf[i + 3],
            ]);
            for &v in &INTERESTING_32 {
                let le = v as u32;
                let be = le.swap_bytes();
                let mut tries = [Some(le), None];
                if be != le {
                    tries[1] = Some(be);
                }
                for (endian, val) in tries.iter().enumerate() {
                    let Some(val) = *val else { continue };
                    let check_le = endian == 1;
                    if could_be_arith(orig, val, 4, arith_max)
                        || could_be_bitflip(orig ^ val)
                        || could_be_interest(orig, val, 4, check_le)
                    {
                        self.stats.record_skip(StageId::Interest32);
                        continue;
                    }
                    self.buf[i..i + 4].copy_from_slice(&val.to_le_bytes());
                    if !self.run_current(StageId::Interest32)? {
                        self.buf[i..i + 4].copy_from_slice(&orig.to_le_bytes());
                        break 'outer;
                    }
                }
            }
            self.buf[i..i + 4].copy_from_slice(&orig.to_le_bytes());
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::Interest32, found);
        Ok(())
    }

    // ---- stages 13-15: dictionaries ----

    fn stage_extras_overwrite(&mut self, stage: StageId) -> Result<(), ExecError> {
        let before = self.finds_now();
        let auto = stage == StageId::ExtrasAutoOverwrite;
        let token_count = if auto {
            self.extras.auto().len().min(self.cfg.use_auto_extras)
        } else {
            self.extras.user().len()
        };
        if token_count == 0 {
            return Ok(());
        }
        let len = self.buf.len();
        let subsample = !auto && token_count > self.cfg.max_det_extras;

        'outer: for i in 0..len {
            for t in 0..token_count {
                let token: &[u8] = if auto {
                    &self.extras.auto()[t].data
                } else {
                    &self.extras.user()[t].data
                };
                let tlen = token.len();
                if tlen > len - i {
                    self.stats.record_skip(stage);
                    continue;
                }
                if subsample && self.rng.below(token_count) >= self.cfg.max_det_extras {
                    self.stats.record_skip(stage);
                    continue;
                }
                if &self.buf[i..i + tlen] == token {
                    self.stats.record_skip(stage);
                    continue;
                }
                let eff_ok = (i..i + tlen).any(|p| self.eff.effective_at(p));
                let mask_ok = self.target.is_none() || self.mask.range_overwritable(i, tlen);
                if !eff_ok || !mask_ok {
                    self.stats.record_skip(stage);
                    continue;
                }
                let saved: Vec<u8> = self.buf[i..i + tlen].to_vec();
                let token = token.to_vec();
                self.buf[i..i + tlen].copy_from_slice(&token);
                let ran = self.run_current(stage)?;
                self.buf[i..i + tlen].copy_from_slice(&saved);
                if !ran {
                    break 'outer;
                }
            }
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(stage, found);
        Ok(())
    }

    fn stage_extras_insert(&mut self) -> Result<(), ExecError> {
        let before = self.finds_now();
        if !self.extras.has_user() {
            return Ok(());
        }
        let len = self.buf.len();
        let mut scratch: Vec<u8> = Vec::with_capacity(len + self.cfg.max_dict_file);

        'outer: for i in 0..=len {
            if self.target.is_some() && !self.mask.has_bit(i, INSERT) {
                self.stats.record_skip(StageId::ExtrasUserInsert);
                continue;
            }
            for t in 0..self.extras.user().len() {
                let token = self.extras.user()[t].data.clone();
                if len + token.len() > self.cfg.max_file {
                    self.stats.record_skip(StageId::ExtrasUserInsert);
                    continue;
                }
                scratch.clear();
                scratch.extend_from_slice(&self.buf[..i]);
                scratch.extend_from_slice(&token);
                scratch.extend_from_slice(&self.buf[i..]);
                if !self.run_scratch(StageId::ExtrasUserInsert, &scratch)? {
                    break 'outer;
                }
            }
        }
        let found = self.finds_now() - before;
        self.stats.record_finds(StageId::ExtrasUserInsert, found);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::CountingExecutor;
    use crate::executor::ExecStatus;

    const TARGET: EdgeId = 5;

    struct Fixture {
        cfg: Config,
        rng: Rng,
        world: World,
        stats: FuzzerStats,
        extras: ExtrasStore,
    }

    impl Fixture {
        fn new() -> Self {
            let cfg = Config {
                map_size: 64,
                ..Config::default()
            };
            let extras = ExtrasStore::new(
                cfg.max_auto_extras,
                cfg.min_auto_extra,
                cfg.max_auto_extra,
                cfg.max_dict_file,
            );
            Self {
                cfg,
                rng: Rng::new(99),
                world: World::default(),
                stats: FuzzerStats::default(),
                extras,
            }
        }
    }

    /// Target edge is hit iff byte 3 still holds its original value.
    fn sensitive_byte_executor() -> CountingExecutor {
        CountingExecutor::new(64, |input, map| {
            map.record(0);
            if input.len() > 3 && input[3] == b'A' {
                map.record(TARGET);
            }
            ExecStatus::Ok
        })
    }

    #[test]
    fn overwrite_sweep_classifies_the_sensitive_byte() {
        let mut fx = Fixture::new();
        let mut exec = sensitive_byte_executor();
        // only position 3 holds the byte the edge depends on
        let mut buf = b"XYZAW".to_vec();
        exec.run(&buf).unwrap();

        let probe = probe_branch_mask(
            &mut exec,
            &fx.world,
            &fx.rng,
            &mut fx.stats,
            &mut buf,
            TARGET,
        )
        .unwrap();
        let mask = probe.mask.expect("mask should exist");
        for pos in 0..5 {
            assert_eq!(
                mask.has_bit(pos, OVERWRITE),
                pos != 3,
                "wrong overwrite bit at {}",
                pos
            );
        }
        // deleting at or before position 3 shifts the marker away;
        // deleting behind it is harmless
        assert!(!mask.has_bit(0, DELETE));
        assert!(!mask.has_bit(2, DELETE));
        assert!(mask.has_bit(4, DELETE));
        // same for insertions
        assert!(mask.has_bit(4, INSERT));
        assert!(mask.has_bit(5, INSERT));
        assert!(!mask.has_bit(0, INSERT));
    }

    #[test]
    fn probe_reports_degenerate_mask() {
        // the edge depends on every byte; nothing is overwrite-safe
        let mut fx = Fixture::new();
        let mut exec = CountingExecutor::new(64, |input, map| {
            if input.iter().all(|&b| b == b'z') {
                map.record(TARGET);
            }
            map.record(1);
            ExecStatus::Ok
        });
        let mut buf = b"zzzz".to_vec();
        exec.run(&buf).unwrap();
        let probe = probe_branch_mask(
            &mut exec,
            &fx.world,
            &fx.rng,
            &mut fx.stats,
            &mut buf,
            TARGET,
        )
        .unwrap();
        assert!(probe.mask.is_none());
    }

    #[test]
    fn deterministic_mutations_restore_the_buffer() {
        let mut fx = Fixture::new();
        fx.extras.add_user(b"key".to_vec());
        let mut exec = CountingExecutor::new(64, |input, map| {
            map.record(input.iter().map(|&b| b as usize).sum::<usize>() % 60);
            ExecStatus::Ok
        });
        let mut buf = b"hello world!".to_vec();
        let snapshot = buf.clone();
        exec.run(&buf).unwrap();
        let base_cksum = exec.exec_cksum();

        let mut mask = BranchMask::permissive(buf.len());
        let det = DetStages::new(
            &mut exec,
            &fx.world,
            &fx.cfg,
            &fx.rng,
            &mut fx.stats,
            &mut fx.extras,
            &mut buf,
            &mut mask,
            None,
            base_cksum,
        );
        let outcome = det.run().unwrap();
        assert!(!outcome.stopped);
        assert_eq!(buf, snapshot);
        assert!(fx.stats.stage(StageId::Flip1).execs == snapshot.len() * 8);
        assert!(fx.stats.stage(StageId::Flip8).execs == snapshot.len());
    }

    #[test]
    fn arith8_skips_values_reachable_by_bitflip() {
        // +1 over a zero byte is exactly a single-bit flip: every such
        // candidate must be skipped without an execution
        let mut fx = Fixture::new();
        let mut exec = CountingExecutor::new(64, |_, map| {
            map.record(2);
            ExecStatus::Ok
        });
        let mut buf = vec![0u8];
        exec.run(&buf).unwrap();
        let base_cksum = exec.exec_cksum();

        let mut mask = BranchMask::permissive(buf.len());
        let det = DetStages::new(
            &mut exec,
            &fx.world,
            &fx.cfg,
            &fx.rng,
            &mut fx.stats,
            &mut fx.extras,
            &mut buf,
            &mut mask,
            None,
            base_cksum,
        );
        det.run().unwrap();
        let arith = fx.stats.stage(StageId::Arith8);
        // one byte, +/- up to arith_max: every candidate is either run or
        // accounted as a skip
        assert_eq!(
            arith.execs + arith.skipped,
            2 * fx.cfg.arith_max as usize
        );
        // 0 + 1 == flip of bit 0, so at least that one was skipped
        let expected_skips = (1..=fx.cfg.arith_max)
            .flat_map(|j| [0u8.wrapping_add(j as u8), 0u8.wrapping_sub(j as u8)])
            .filter(|&v| could_be_bitflip(u32::from(v)))
            .count();
        assert!(expected_skips > 0);
        assert_eq!(arith.skipped, expected_skips);
    }

    #[test]
    fn flip1_mines_auto_tokens() {
        // the trace hash changes while flipping inside the magic token
        // and nowhere else, so the token's bytes get collected
        let mut fx = Fixture::new();
        let mut exec = CountingExecutor::new(64, |input, map| {
            map.record(0);
            if input.windows(4).any(|w| w == b"MAGI") {
                map.record(9);
            }
            ExecStatus::Ok
        });
        let mut buf = b"....MAGI....".to_vec();
        exec.run(&buf).unwrap();
        let base_cksum = exec.exec_cksum();
        let mut mask = BranchMask::permissive(buf.len());
        let det = DetStages::new(
            &mut exec,
            &fx.world,
            &fx.cfg,
            &fx.rng,
            &mut fx.stats,
            &mut fx.extras,
            &mut buf,
            &mut mask,
            None,
            base_cksum,
        );
        det.run().unwrap();
        assert!(
            fx.extras.auto().iter().any(|e| e.data == b"MAGI"),
            "mined tokens: {:?}",
            fx.extras
                .auto()
                .iter()
                .map(|e| String::from_utf8_lossy(&e.data).into_owned())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn stop_signal_halts_mid_stage() {
        let mut fx = Fixture::new();
        let mut exec = CountingExecutor::new(64, |_, map| {
            map.record(0);
            ExecStatus::Ok
        });
        let mut buf = vec![0xab; 32];
        exec.run(&buf).unwrap();
        let base_cksum = exec.exec_cksum();
        fx.world.stop_signal().set();

        let mut mask = BranchMask::permissive(buf.len());
        let det = DetStages::new(
            &mut exec,
            &fx.world,
            &fx.cfg,
            &fx.rng,
            &mut fx.stats,
            &mut fx.extras,
            &mut buf,
            &mut mask,
            None,
            base_cksum,
        );
        let outcome = det.run().unwrap();
        assert!(outcome.stopped);
        assert_eq!(fx.stats.stage(StageId::Flip1).execs, 0);
    }
}
