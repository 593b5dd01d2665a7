//! What the core needs to know about the seed queue and the dictionaries.
//! Queue scheduling and persistence belong to the outer fuzzer; the core
//! reads entries, flips their bookkeeping flags, and consumes tokens.

use bit_vec::BitVec;

use crate::coverage::EdgeId;
use crate::mutations::tables::{INTERESTING_16, INTERESTING_32};
use crate::rng::Rng;

/// One previously-seen input plus the core's per-seed bookkeeping.
#[derive(Clone)]
pub struct QueueEntry {
    pub data: Vec<u8>,
    /// One presence bit per edge, from the entry's calibration run.
    pub footprint: BitVec,
    /// Rare edges already attacked from this seed.
    pub fuzzed_branches: BitVec,
    /// Trace hash from the calibration run.
    pub exec_cksum: u64,
    /// Scheduling score assigned by the outer fuzzer; 100 is neutral.
    pub perf_score: usize,
    pub favored: bool,
    pub was_fuzzed: bool,
    pub trim_done: bool,
    pub passed_det: bool,
}

impl QueueEntry {
    pub fn new(data: Vec<u8>, map_size: usize) -> Self {
        Self {
            data,
            footprint: BitVec::from_elem(map_size, false),
            fuzzed_branches: BitVec::from_elem(map_size, false),
            exec_cksum: 0,
            perf_score: 100,
            favored: false,
            was_fuzzed: false,
            trim_done: false,
            passed_det: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn branch_fuzzed(&self, edge: EdgeId) -> bool {
        self.fuzzed_branches.get(edge).unwrap_or(false)
    }

    pub fn mark_branch_fuzzed(&mut self, edge: EdgeId) {
        self.fuzzed_branches.set(edge, true);
    }
}

/// Read access to the queue, plus the two scheduler counters the skip gate
/// needs. The core never inserts entries itself; discoveries are enqueued
/// by the executor wrapper.
pub trait Corpus {
    fn count(&self) -> usize;
    fn entry(&self, idx: usize) -> &QueueEntry;
    fn entry_mut(&mut self, idx: usize) -> &mut QueueEntry;
    /// Favored entries that have not been fuzzed yet.
    fn pending_favored(&self) -> usize;
    /// How many full passes over the queue the outer fuzzer has made.
    fn cycle(&self) -> usize;
}

/// Minimal in-memory queue, enough for tests and for embedding the core
/// without a real scheduler.
#[derive(Default)]
pub struct VecCorpus {
    pub entries: Vec<QueueEntry>,
    pub pending_favored: usize,
    pub cycle: usize,
}

impl VecCorpus {
    pub fn new(entries: Vec<QueueEntry>) -> Self {
        Self {
            entries,
            pending_favored: 0,
            cycle: 1,
        }
    }
}

impl Corpus for VecCorpus {
    fn count(&self) -> usize {
        self.entries.len()
    }
    fn entry(&self, idx: usize) -> &QueueEntry {
        &self.entries[idx]
    }
    fn entry_mut(&mut self, idx: usize) -> &mut QueueEntry {
        &mut self.entries[idx]
    }
    fn pending_favored(&self) -> usize {
        self.pending_favored
    }
    fn cycle(&self) -> usize {
        self.cycle
    }
}

/// A dictionary token and how often it proved useful.
#[derive(Clone)]
pub struct Extra {
    pub data: Vec<u8>,
    pub hits: usize,
}

fn eq_nocase(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

/// User-supplied and auto-discovered dictionary tokens. The auto side is
/// bounded; when full, an insertion replaces a random token from the
/// less-used half. Auto tokens are kept sorted by hit count, descending.
pub struct ExtrasStore {
    user: Vec<Extra>,
    auto: Vec<Extra>,
    max_auto: usize,
    min_auto_len: usize,
    max_auto_len: usize,
    max_token_len: usize,
}

impl ExtrasStore {
    pub fn new(
        max_auto: usize,
        min_auto_len: usize,
        max_auto_len: usize,
        max_token_len: usize,
    ) -> Self {
        Self {
            user: Vec::new(),
            auto: Vec::new(),
            max_auto,
            min_auto_len,
            max_auto_len,
            max_token_len,
        }
    }

    /// Register a user token. Tokens are kept sorted by length so the
    /// deterministic stages can stop early at a position.
    pub fn add_user(&mut self, data: Vec<u8>) {
        if data.is_empty() || data.len() > self.max_token_len {
            return;
        }
        let pos = self
            .user
            .partition_point(|e| e.data.len() <= data.len());
        self.user.insert(pos, Extra { data, hits: 0 });
    }

    pub fn user(&self) -> &[Extra] {
        &self.user
    }

    pub fn auto(&self) -> &[Extra] {
        &self.auto
    }

    pub fn has_user(&self) -> bool {
        !self.user.is_empty()
    }

    pub fn has_auto(&self) -> bool {
        !self.auto.is_empty()
    }

    /// Offer a candidate token mined by the bit-flip stage. Rejects
    /// constants, values reachable through the interesting tables, and
    /// duplicates of user tokens; bumps and re-ranks known auto tokens.
    pub fn maybe_add_auto(&mut self, candidate: &[u8], rng: &Rng) {
        if candidate.len() < self.min_auto_len || candidate.len() > self.max_auto_len {
            return;
        }
        // skip runs of a single byte value
        if candidate.iter().all(|&b| b == candidate[0]) {
            return;
        }
        if candidate.len() == 2 {
            let v = u16::from_le_bytes([candidate[0], candidate[1]]);
            if INTERESTING_16
                .iter()
                .any(|&i| v == i as u16 || v == (i as u16).swap_bytes())
            {
                return;
            }
        }
        if candidate.len() == 4 {
            let v = u32::from_le_bytes([candidate[0], candidate[1], candidate[2], candidate[3]]);
            if INTERESTING_32
                .iter()
                .any(|&i| v == i as u32 || v == (i as u32).swap_bytes())
            {
                return;
            }
        }
        if self.user.iter().any(|e| eq_nocase(&e.data, candidate)) {
            return;
        }
        if let Some(idx) = self.auto.iter().position(|e| eq_nocase(&e.data, candidate)) {
            self.auto[idx].hits += 1;
            // bubble up to keep descending hit order
            let mut i = idx;
            while i > 0 && self.auto[i].hits > self.auto[i - 1].hits {
                self.auto.swap(i, i - 1);
                i -= 1;
            }
            return;
        }
        let extra = Extra {
            data: candidate.to_vec(),
            hits: 0,
        };
        if self.auto.len() < self.max_auto {
            self.auto.push(extra);
        } else {
            // evict from the less-used half
            let lower_half_start = self.max_auto / 2;
            let victim = lower_half_start + rng.below(self.auto.len() - lower_half_start);
            self.auto[victim] = extra;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_extras_sorted_by_length() {
        let mut store = ExtrasStore::new(16, 3, 32, 128);
        store.add_user(b"longer".to_vec());
        store.add_user(b"ab".to_vec());
        store.add_user(b"midl".to_vec());
        let lens: Vec<usize> = store.user().iter().map(|e| e.data.len()).collect();
        assert_eq!(lens, vec![2, 4, 6]);
    }

    #[test]
    fn auto_rejects_constant_runs_and_short_tokens() {
        let rng = Rng::new(0);
        let mut store = ExtrasStore::new(16, 3, 32, 128);
        store.maybe_add_auto(b"aaaa", &rng);
        store.maybe_add_auto(b"ab", &rng);
        assert!(!store.has_auto());
        store.maybe_add_auto(b"abcd", &rng);
        assert_eq!(store.auto().len(), 1);
    }

    #[test]
    fn auto_bump_reorders_by_hits() {
        let rng = Rng::new(0);
        let mut store = ExtrasStore::new(16, 3, 32, 128);
        store.maybe_add_auto(b"first", &rng);
        store.maybe_add_auto(b"second", &rng);
        store.maybe_add_auto(b"second", &rng);
        assert_eq!(store.auto()[0].data, b"second");
        assert_eq!(store.auto()[0].hits, 1);
    }

    #[test]
    fn auto_dedup_is_case_insensitive() {
        let rng = Rng::new(0);
        let mut store = ExtrasStore::new(16, 3, 32, 128);
        store.maybe_add_auto(b"Token", &rng);
        store.maybe_add_auto(b"tOKEN", &rng);
        assert_eq!(store.auto().len(), 1);
        assert_eq!(store.auto()[0].hits, 1);
    }

    #[test]
    fn auto_store_is_bounded() {
        let rng = Rng::new(1);
        let mut store = ExtrasStore::new(4, 3, 32, 128);
        for i in 0..20u32 {
            store.maybe_add_auto(&i.to_le_bytes().map(|b| b.wrapping_add(1)), &rng);
        }
        assert!(store.auto().len() <= 4);
    }
}
