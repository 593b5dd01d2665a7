//! Choosing which rarely-hit edge to attack. Rarity is tiered by the
//! order of magnitude of an edge's hit count: the selector keeps a moving
//! exponent and only edges strictly below it qualify. Edges that no
//! mutation could preserve end up on a blacklist and never qualify again.

use ahash::AHashSet;
use bit_vec::BitVec;

use crate::coverage::{highest_order_bit, EdgeId, HitBits};
use crate::queue::QueueEntry;

/// Target edge chosen for one seed.
pub struct RareTarget {
    pub edge: EdgeId,
    /// Every rare edge of this seed was attacked before; deterministic
    /// stages may be skipped.
    pub all_fuzzed: bool,
}

pub struct RareBranchSelector {
    /// Edges with hit-count exponent strictly below this are rare.
    rare_branch_exp: u32,
    blacklist: AHashSet<EdgeId>,
    max_rare_branches: usize,
}

impl RareBranchSelector {
    pub fn new(max_rare_branches: usize) -> Self {
        Self {
            rare_branch_exp: u32::MAX,
            blacklist: AHashSet::new(),
            max_rare_branches,
        }
    }

    pub fn rare_branch_exp(&self) -> u32 {
        self.rare_branch_exp
    }

    pub fn blacklist_len(&self) -> usize {
        self.blacklist.len()
    }

    pub fn blacklist_edge(&mut self, edge: EdgeId) {
        self.blacklist.insert(edge);
    }

    pub fn is_blacklisted(&self, edge: EdgeId) -> bool {
        self.blacklist.contains(&edge)
    }

    pub fn reset(&mut self) {
        self.rare_branch_exp = u32::MAX;
        self.blacklist.clear();
    }

    /// Scan the hit bits for the currently rarest tier of edges. The
    /// exponent tightens whenever an edge more than one tier below the
    /// accepted one appears, which discards everything collected so far.
    /// An empty harvest relaxes the exponent to just above the rarest
    /// exponent seen and rescans.
    pub fn rarest_edges(&mut self, hits: &HitBits) -> Vec<EdgeId> {
        loop {
            let mut out = Vec::new();
            let mut lowest_hob = u32::MAX;
            for (edge, count) in hits.iter_seen() {
                if self.blacklist.contains(&edge) {
                    continue;
                }
                let hob = highest_order_bit(count);
                if hob < lowest_hob {
                    lowest_hob = hob;
                }
                if hob < self.rare_branch_exp {
                    if hob + 1 < self.rare_branch_exp {
                        self.rare_branch_exp = hob + 1;
                        out.clear();
                    }
                    if out.len() < self.max_rare_branches {
                        out.push(edge);
                    }
                }
            }
            if !out.is_empty() || lowest_hob == u32::MAX {
                return out;
            }
            self.rare_branch_exp = lowest_hob + 1;
        }
    }

    /// The rare edges present in a seed's compressed footprint, sorted by
    /// ascending hit count.
    pub fn rare_edges_hit_by(&mut self, hits: &HitBits, footprint: &BitVec) -> Vec<EdgeId> {
        let rarest: AHashSet<EdgeId> = self.rarest_edges(hits).into_iter().collect();
        let mut sorted: Vec<EdgeId> = Vec::new();
        for (edge, present) in footprint.iter().enumerate() {
            if !present || !rarest.contains(&edge) {
                continue;
            }
            let count = hits.count(edge);
            let pos = sorted.partition_point(|&e| hits.count(e) <= count);
            sorted.insert(pos, edge);
        }
        sorted
    }

    /// Pick the edge to attack from this seed: the rarest edge not yet
    /// fuzzed from it, or the rarest one overall when all were (in which
    /// case the deterministic stages carry no new information). The chosen
    /// edge is marked fuzzed before use.
    pub fn choose_target(
        &mut self,
        hits: &HitBits,
        entry: &mut QueueEntry,
    ) -> Option<RareTarget> {
        let candidates = self.rare_edges_hit_by(hits, &entry.footprint);
        if candidates.is_empty() {
            return None;
        }
        let (edge, all_fuzzed) = match candidates.iter().find(|&&e| !entry.branch_fuzzed(e)) {
            Some(&edge) => (edge, false),
            None => (candidates[0], true),
        };
        entry.mark_branch_fuzzed(edge);
        Some(RareTarget { edge, all_fuzzed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageMap;

    fn hits_from(counts: &[(EdgeId, u32)], map_size: usize) -> HitBits {
        let mut hits = HitBits::new(map_size);
        let mut map = CoverageMap::new(map_size);
        for &(edge, count) in counts {
            for _ in 0..count {
                map.reset();
                map.record(edge);
                hits.record_trace(&map);
            }
        }
        hits
    }

    #[test]
    fn rarest_edges_are_strictly_below_exponent() {
        let hits = hits_from(&[(1, 1), (2, 3), (3, 200), (4, 250)], 16);
        let mut sel = RareBranchSelector::new(64);
        let rare = sel.rarest_edges(&hits);
        for &edge in &rare {
            assert!(highest_order_bit(hits.count(edge)) < sel.rare_branch_exp());
        }
        // the tier-0 edge tightens the exponent to 1, evicting everything
        // coarser, including the tier-1 edge
        assert_eq!(rare, vec![1]);
        assert_eq!(sel.rare_branch_exp(), 1);
    }

    #[test]
    fn tightening_discards_coarser_edges() {
        // edge 5 (count 200, tier 7) is seen first; edge 6 (count 1,
        // tier 0) then tightens the exponent and evicts it
        let hits = hits_from(&[(5, 200), (6, 1)], 16);
        let mut sel = RareBranchSelector::new(64);
        let rare = sel.rarest_edges(&hits);
        assert_eq!(rare, vec![6]);
        assert_eq!(sel.rare_branch_exp(), 1);
    }

    #[test]
    fn empty_harvest_relaxes_exponent() {
        let hits = hits_from(&[(3, 200)], 16);
        let mut sel = RareBranchSelector::new(64);
        let rare = sel.rarest_edges(&hits);
        // first pass tightens to tier 8 and keeps edge 3; fuzz it away
        assert_eq!(rare, vec![3]);
        sel.blacklist_edge(3);
        assert!(sel.rarest_edges(&hits).is_empty());
    }

    #[test]
    fn blacklisted_edges_never_qualify() {
        let hits = hits_from(&[(1, 1), (2, 1)], 16);
        let mut sel = RareBranchSelector::new(64);
        sel.blacklist_edge(1);
        let rare = sel.rarest_edges(&hits);
        assert_eq!(rare, vec![2]);
    }

    #[test]
    fn hit_list_is_sorted_by_ascending_count() {
        let hits = hits_from(&[(1, 3), (2, 2), (3, 2)], 16);
        let mut sel = RareBranchSelector::new(64);
        let mut footprint = BitVec::from_elem(16, false);
        footprint.set(1, true);
        footprint.set(2, true);
        footprint.set(3, true);
        let sorted = sel.rare_edges_hit_by(&hits, &footprint);
        assert_eq!(sorted, vec![2, 3, 1]);
    }

    #[test]
    fn target_selection_skips_already_fuzzed_edges() {
        let hits = hits_from(&[(1, 1), (2, 1)], 16);
        let mut sel = RareBranchSelector::new(64);
        let mut entry = QueueEntry::new(vec![0; 4], 16);
        entry.footprint.set(1, true);
        entry.footprint.set(2, true);

        let first = sel.choose_target(&hits, &mut entry).unwrap();
        assert_eq!(first.edge, 1);
        assert!(!first.all_fuzzed);

        let second = sel.choose_target(&hits, &mut entry).unwrap();
        assert_eq!(second.edge, 2);

        // everything fuzzed now: rarest again, flagged as exhausted
        let third = sel.choose_target(&hits, &mut entry).unwrap();
        assert_eq!(third.edge, 1);
        assert!(third.all_fuzzed);
    }
}
