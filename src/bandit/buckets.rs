//! Input length conditions which mutations pay off, so bandit learning is
//! partitioned by length class: each bucket owns an operator bandit and a
//! batch-size bandit, and a seed's length picks the pair used for its
//! whole havoc stage.

use super::{Bandit, StrategyKind};
use crate::config::Config;

pub struct BucketBandits {
    pub ops: Bandit,
    pub batches: Bandit,
}

pub struct BanditGrid {
    buckets: Vec<BucketBandits>,
    thresholds: [usize; 4],
}

impl BanditGrid {
    pub fn new(cfg: &Config) -> Self {
        Self::with_strategies(cfg, cfg.op_strategy, cfg.batch_strategy)
    }

    pub fn with_strategies(cfg: &Config, ops: StrategyKind, batches: StrategyKind) -> Self {
        let buckets = (0..cfg.num_batch_buckets())
            .map(|_| BucketBandits {
                ops: Bandit::new(ops, cfg.havoc_op_arms, cfg),
                batches: Bandit::new(batches, cfg.batch_arms, cfg),
            })
            .collect();
        Self {
            buckets,
            thresholds: cfg.batch_bucket_thresholds,
        }
    }

    pub fn bucket_index(&self, input_len: usize) -> usize {
        self.thresholds
            .iter()
            .position(|&limit| input_len <= limit)
            .unwrap_or(self.thresholds.len())
    }

    pub fn bucket_mut(&mut self, input_len: usize) -> &mut BucketBandits {
        let idx = self.bucket_index(input_len);
        &mut self.buckets[idx]
    }

    pub fn bucket_at_mut(&mut self, idx: usize) -> &mut BucketBandits {
        &mut self.buckets[idx]
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        let cfg = Config::default();
        let grid = BanditGrid::new(&cfg);
        assert_eq!(grid.num_buckets(), 5);
        assert_eq!(grid.bucket_index(0), 0);
        assert_eq!(grid.bucket_index(100), 0);
        assert_eq!(grid.bucket_index(101), 1);
        assert_eq!(grid.bucket_index(1_000), 1);
        assert_eq!(grid.bucket_index(10_000), 2);
        assert_eq!(grid.bucket_index(100_000), 3);
        assert_eq!(grid.bucket_index(100_001), 4);
    }
}
