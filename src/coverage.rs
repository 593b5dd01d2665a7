//! Coverage bookkeeping: the dense per-edge counter array filled by the
//! executor, its compressed one-bit-per-edge footprint, and the global
//! count of distinct inputs that touched each edge.

use std::hash::Hasher;

use ahash::AHasher;
use bit_vec::BitVec;

/// A transition between two instrumented basic blocks.
pub type EdgeId = usize;

/// Dense array of edge counters for a single execution.
#[derive(Clone)]
pub struct CoverageMap {
    hits: Vec<u32>,
}

impl CoverageMap {
    pub fn new(map_size: usize) -> Self {
        Self {
            hits: vec![0; map_size],
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn reset(&mut self) {
        for h in self.hits.iter_mut() {
            *h = 0;
        }
    }

    #[inline]
    pub fn record(&mut self, edge: EdgeId) {
        self.hits[edge] = self.hits[edge].saturating_add(1);
    }

    #[inline]
    pub fn contains(&self, edge: EdgeId) -> bool {
        self.hits[edge] > 0
    }

    pub fn iter_hit_edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.hits
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(e, _)| e)
    }

    /// Compress to one presence bit per edge.
    pub fn footprint(&self) -> BitVec {
        let mut bits = BitVec::from_elem(self.hits.len(), false);
        for edge in self.iter_hit_edges() {
            bits.set(edge, true);
        }
        bits
    }

    /// Order-sensitive hash of the whole trace. Keys are fixed so that the
    /// checksum of identical traces is stable within a process.
    pub fn checksum(&self) -> u64 {
        let mut hasher = AHasher::new_with_keys(0x51ab_c0de, 0xfee1_600d);
        for &h in &self.hits {
            hasher.write_u32(h);
        }
        hasher.finish()
    }
}

/// Per-edge count of distinct inputs that reached the edge. Monotonically
/// non-decreasing; zero means never seen.
#[derive(Clone)]
pub struct HitBits {
    counts: Vec<u32>,
}

impl HitBits {
    pub fn new(map_size: usize) -> Self {
        Self {
            counts: vec![0; map_size],
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, edge: EdgeId) -> u32 {
        self.counts[edge]
    }

    /// Credit every edge present in the trace with one more input.
    pub fn record_trace(&mut self, trace: &CoverageMap) {
        for edge in trace.iter_hit_edges() {
            self.counts[edge] = self.counts[edge].saturating_add(1);
        }
    }

    pub fn iter_seen(&self) -> impl Iterator<Item = (EdgeId, u32)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(e, &c)| (e, c))
    }

    pub fn reset(&mut self) {
        for c in self.counts.iter_mut() {
            *c = 0;
        }
    }
}

/// Index of the highest set bit. The order of magnitude of an edge's hit
/// count, used to tier edges by rarity.
#[inline]
pub fn highest_order_bit(count: u32) -> u32 {
    debug_assert!(count > 0);
    31 - count.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_matches_hit_edges() {
        let mut map = CoverageMap::new(64);
        map.record(3);
        map.record(3);
        map.record(17);
        let bits = map.footprint();
        for edge in 0..64 {
            assert_eq!(bits.get(edge).unwrap(), edge == 3 || edge == 17);
        }
    }

    #[test]
    fn checksum_changes_with_trace() {
        let mut map = CoverageMap::new(16);
        let base = map.checksum();
        map.record(5);
        assert_ne!(base, map.checksum());
        let with_5 = map.checksum();
        map.reset();
        assert_eq!(base, map.checksum());
        map.record(5);
        assert_eq!(with_5, map.checksum());
    }

    #[test]
    fn hit_bits_are_monotone() {
        let mut map = CoverageMap::new(8);
        map.record(1);
        let mut hits = HitBits::new(8);
        hits.record_trace(&map);
        hits.record_trace(&map);
        assert_eq!(hits.count(1), 2);
        assert_eq!(hits.count(0), 0);
    }

    #[test]
    fn highest_order_bit_tiers() {
        assert_eq!(highest_order_bit(1), 0);
        assert_eq!(highest_order_bit(2), 1);
        assert_eq!(highest_order_bit(3), 1);
        assert_eq!(highest_order_bit(255), 7);
        assert_eq!(highest_order_bit(256), 8);
    }
}
