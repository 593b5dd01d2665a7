//! Every tunable of the mutation core, gathered into one plain value.
//!
//! Nothing here parses anything. The surrounding program decides how these
//! are set (flags, env, hardcoded); the core only reads them.

use crate::bandit::StrategyKind;

#[derive(Clone, Debug)]
pub struct Config {
    /// Number of instrumented edges in the coverage map.
    pub map_size: usize,
    /// Hard cap on the size of any generated input.
    pub max_file: usize,

    /// Highest value added to / subtracted from bytes in arithmetic stages.
    pub arith_max: u32,

    /// Floor on the number of havoc iterations per seed.
    pub havoc_min: usize,
    /// Baseline havoc iterations, scaled by the seed's performance score.
    pub havoc_cycles: usize,
    /// Divisor applied to the havoc budget by the outer scheduler.
    pub havoc_div: usize,
    /// Cap factor for the reward-driven doubling of the havoc budget.
    pub havoc_max_mult: usize,
    /// Block-size ladder for structural havoc ops.
    pub havoc_blk_small: usize,
    pub havoc_blk_medium: usize,
    pub havoc_blk_large: usize,
    pub havoc_blk_xl: usize,

    /// Initial trim step is `next_pow2(len) / trim_start_steps`.
    pub trim_start_steps: usize,
    /// Trimming stops once the step falls below `next_pow2(len) / trim_end_steps`.
    pub trim_end_steps: usize,
    /// Absolute floor on the trim step, in bytes.
    pub trim_min_bytes: usize,

    /// Inputs shorter than this are treated as fully effective.
    pub eff_min_len: usize,
    /// If more than this percentage of chunks is effective, mark them all.
    pub eff_max_perc: usize,

    /// Deterministic extras stages subsample dictionaries larger than this.
    pub max_det_extras: usize,
    /// How many auto-discovered tokens the consuming stages look at.
    pub use_auto_extras: usize,
    /// Length bounds on mined auto tokens.
    pub min_auto_extra: usize,
    pub max_auto_extra: usize,
    /// Capacity of the auto-token store.
    pub max_auto_extras: usize,
    /// Longest dictionary token accepted from the user.
    pub max_dict_file: usize,

    /// Upper bound on splice retries after havoc.
    pub splice_cycles: usize,

    /// Probability (%) of skipping a seed when favored seeds are pending.
    pub skip_to_new_prob: u32,
    /// Probability (%) of skipping a not-yet-fuzzed, non-favored seed.
    pub skip_nfav_new_prob: u32,
    /// Probability (%) of skipping an already-fuzzed, non-favored seed.
    pub skip_nfav_old_prob: u32,

    /// ADWIN: max buckets per exponential-histogram row.
    pub adwin_m: usize,
    /// ADWIN: confidence parameter of the Hoeffding cut.
    pub adwin_delta: f64,
    /// ADWIN: minimum observations on each side of a candidate cut.
    pub adwin_min_elem_to_check: usize,
    /// ADWIN: window size below which no drop is attempted.
    pub adwin_min_elem_to_start_drop: usize,
    /// ADWIN: change detection runs every this many inserts.
    pub adwin_drop_interval: usize,

    /// Discount factor of the discounted Thompson strategy.
    pub dts_gamma: f64,
    /// Clamp discounted-Thompson samples to the posterior mean.
    pub dts_optimistic: bool,
    /// Discount factor of the discounted Boltzmann strategy.
    pub dbe_gamma: f64,

    /// KL-UCB: Newton start offset and clipping margin.
    pub klucb_delta: f64,
    /// KL-UCB: squared-residual convergence threshold.
    pub klucb_eps: f64,

    /// EXP3++: confidence-width exponent for the gap estimate.
    pub exp_alpha: f64,
    /// EXP3++: scaling of the per-arm exploration floor.
    pub exp_beta: f64,
    /// Upper bound on arm counts accepted by the exponential-weights family.
    pub exp_max_n_arms: usize,
    /// Rewards are mapped from `[exp_lower, exp_lower + exp_amplitude]`
    /// into `[0, 1]` before feeding the exponential-weights family.
    pub exp_lower: f64,
    pub exp_amplitude: f64,

    /// Strategy used for the havoc operator bandits.
    pub op_strategy: StrategyKind,
    /// Strategy used for the batch-size bandits.
    pub batch_strategy: StrategyKind,
    /// Number of havoc operator arms.
    pub havoc_op_arms: usize,
    /// Number of batch-size arms.
    pub batch_arms: usize,
    /// Batch arm `t` maps to `1 + t` instead of `1 << t`.
    pub linear_batches: bool,
    /// Input-length thresholds separating the batch buckets.
    pub batch_bucket_thresholds: [usize; 4],

    /// Upper bound on the rare-branch candidate list.
    pub max_rare_branches: usize,
    /// Rare-branch targeting on/off (off means vanilla fuzzing).
    pub rare_targeting: bool,
    /// Run every seed twice, once untargeted with rolled-back effects.
    pub shadow_mode: bool,
    /// Skip the deterministic stages entirely.
    pub skip_deterministic: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_size: 1 << 16,
            max_file: 1 << 20,

            arith_max: 35,

            havoc_min: 16,
            havoc_cycles: 256,
            havoc_div: 1,
            havoc_max_mult: 16,
            havoc_blk_small: 32,
            havoc_blk_medium: 128,
            havoc_blk_large: 1500,
            havoc_blk_xl: 32768,

            trim_start_steps: 16,
            trim_end_steps: 1024,
            trim_min_bytes: 4,

            eff_min_len: 128,
            eff_max_perc: 90,

            max_det_extras: 200,
            use_auto_extras: 50,
            min_auto_extra: 3,
            max_auto_extra: 32,
            max_auto_extras: 5000,
            max_dict_file: 128,

            splice_cycles: 15,

            skip_to_new_prob: 99,
            skip_nfav_new_prob: 75,
            skip_nfav_old_prob: 95,

            adwin_m: 5,
            adwin_delta: 0.002,
            adwin_min_elem_to_check: 5,
            adwin_min_elem_to_start_drop: 30,
            adwin_drop_interval: 32,

            dts_gamma: 0.95,
            dts_optimistic: true,
            dbe_gamma: 0.9,

            klucb_delta: 1e-8,
            klucb_eps: 1e-12,

            exp_alpha: 3.0,
            exp_beta: 256.0,
            exp_max_n_arms: 64,
            exp_lower: 0.0,
            exp_amplitude: 1.0,

            op_strategy: StrategyKind::DiscountedThompson,
            batch_strategy: StrategyKind::DiscountedThompson,
            havoc_op_arms: crate::mutations::havoc::HavocOp::COUNT,
            batch_arms: 8,
            linear_batches: false,
            batch_bucket_thresholds: [100, 1_000, 10_000, 100_000],

            max_rare_branches: 1024,
            rare_targeting: true,
            shadow_mode: false,
            skip_deterministic: false,
        }
    }
}

impl Config {
    /// Number of input-length buckets, one more than there are thresholds.
    pub fn num_batch_buckets(&self) -> usize {
        self.batch_bucket_thresholds.len() + 1
    }

    /// Batch size encoded by a batch-bandit arm.
    pub fn batch_size(&self, arm: usize) -> usize {
        if self.linear_batches {
            1 + arm
        } else {
            1 << arm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batch_arms_cover_1_to_128() {
        let cfg = Config::default();
        assert!(cfg.batch_arms >= 7);
        assert_eq!(cfg.batch_size(0), 1);
        assert_eq!(cfg.batch_size(cfg.batch_arms - 1), 128);
    }

    #[test]
    fn linear_batches() {
        let cfg = Config {
            linear_batches: true,
            ..Config::default()
        };
        assert_eq!(cfg.batch_size(0), 1);
        assert_eq!(cfg.batch_size(6), 7);
    }
}
