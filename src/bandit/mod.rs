//! Multi-armed bandits that drive operator and batch-size selection.
//!
//! All strategies share one two-method surface: `select_arm(mask)` returns
//! a usable arm, `add_reward(arm, reward)` feeds the observed outcome
//! back. Each `select_arm` is paired with exactly one `add_reward` before
//! the next selection on the same bandit. Dispatch is a tagged enum, not a
//! trait object; arm counts are fixed at construction.

pub mod adwin;
pub mod arm;
mod buckets;
mod exp3;
mod thompson;
mod ucb;

pub use buckets::{BanditGrid, BucketBandits};

use bit_vec::BitVec;

use crate::config::Config;
use crate::rng::Rng;
use adwin::AdwinParams;
use arm::PlainArm;
use exp3::{Exp3Ix, Exp3Pp};
use thompson::{AdwinThompson, DiscountedBoltzmann, DiscountedThompson, Thompson};
use ucb::{KlUcb, Ucb1};

/// Arms that must not be selected right now (dictionary ops without a
/// dictionary, splice ops on a one-entry corpus, ...).
#[derive(Clone)]
pub struct ArmMask {
    banned: BitVec,
}

impl ArmMask {
    pub fn allow_all(num_arms: usize) -> Self {
        Self {
            banned: BitVec::from_elem(num_arms, false),
        }
    }

    pub fn ban(&mut self, arm: usize) {
        self.banned.set(arm, true);
    }

    pub fn allows(&self, arm: usize) -> bool {
        !self.banned.get(arm).unwrap_or(false)
    }

    pub fn allowed_count(&self) -> usize {
        self.banned.iter().filter(|&b| !b).count()
    }

    /// Convenience for the common `Option<&ArmMask>` parameter.
    #[inline]
    pub fn allows_opt(mask: Option<&ArmMask>, arm: usize) -> bool {
        mask.map_or(true, |m| m.allows(arm))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Uniform,
    Ucb1,
    KlUcb,
    Thompson,
    AdwinThompson,
    DiscountedThompson,
    DiscountedBoltzmann,
    Exp3Ix,
    Exp3Pp,
}

/// Baseline strategy: uniform over the unmasked arms, counters only.
pub struct Uniform {
    arms: Vec<PlainArm>,
}

impl Uniform {
    pub fn new(num_arms: usize) -> Self {
        Self {
            arms: vec![PlainArm::default(); num_arms],
        }
    }

    pub fn select_arm(&self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        let allowed: Vec<usize> = (0..self.arms.len())
            .filter(|&i| ArmMask::allows_opt(mask, i))
            .collect();
        debug_assert!(!allowed.is_empty(), "all arms masked");
        if allowed.is_empty() {
            0
        } else {
            allowed[rng.below(allowed.len())]
        }
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        self.arms[arm].record(reward);
    }

    #[cfg(test)]
    pub(crate) fn arm(&self, i: usize) -> &PlainArm {
        &self.arms[i]
    }
}

pub enum Bandit {
    Uniform(Uniform),
    Ucb1(Ucb1),
    KlUcb(KlUcb),
    Thompson(Thompson),
    AdwinThompson(AdwinThompson),
    DiscountedThompson(DiscountedThompson),
    DiscountedBoltzmann(DiscountedBoltzmann),
    Exp3Ix(Exp3Ix),
    Exp3Pp(Exp3Pp),
}

impl Bandit {
    pub fn new(kind: StrategyKind, num_arms: usize, cfg: &Config) -> Self {
        debug_assert!(num_arms > 0);
        debug_assert!(num_arms <= cfg.exp_max_n_arms);
        match kind {
            StrategyKind::Uniform => Bandit::Uniform(Uniform::new(num_arms)),
            StrategyKind::Ucb1 => Bandit::Ucb1(Ucb1::new(num_arms)),
            StrategyKind::KlUcb => {
                Bandit::KlUcb(KlUcb::new(num_arms, cfg.klucb_delta, cfg.klucb_eps))
            }
            StrategyKind::Thompson => Bandit::Thompson(Thompson::new(num_arms)),
            StrategyKind::AdwinThompson => {
                let params = AdwinParams {
                    max_buckets: cfg.adwin_m,
                    delta: cfg.adwin_delta,
                    min_elem_to_check: cfg.adwin_min_elem_to_check,
                    min_elem_to_start_drop: cfg.adwin_min_elem_to_start_drop,
                    drop_interval: cfg.adwin_drop_interval,
                    reset_on_change: false,
                };
                Bandit::AdwinThompson(AdwinThompson::new(num_arms, params))
            }
            StrategyKind::DiscountedThompson => Bandit::DiscountedThompson(DiscountedThompson::new(
                num_arms,
                cfg.dts_gamma,
                cfg.dts_optimistic,
            )),
            StrategyKind::DiscountedBoltzmann => {
                Bandit::DiscountedBoltzmann(DiscountedBoltzmann::new(num_arms, cfg.dbe_gamma))
            }
            StrategyKind::Exp3Ix => {
                Bandit::Exp3Ix(Exp3Ix::new(num_arms, cfg.exp_lower, cfg.exp_amplitude))
            }
            StrategyKind::Exp3Pp => Bandit::Exp3Pp(Exp3Pp::new(
                num_arms,
                cfg.exp_alpha,
                cfg.exp_beta,
                cfg.exp_lower,
                cfg.exp_amplitude,
            )),
        }
    }

    pub fn select_arm(&mut self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        match self {
            Bandit::Uniform(b) => b.select_arm(rng, mask),
            Bandit::Ucb1(b) => b.select_arm(mask),
            Bandit::KlUcb(b) => b.select_arm(mask),
            Bandit::Thompson(b) => b.select_arm(rng, mask),
            Bandit::AdwinThompson(b) => b.select_arm(rng, mask),
            Bandit::DiscountedThompson(b) => b.select_arm(rng, mask),
            Bandit::DiscountedBoltzmann(b) => b.select_arm(rng, mask),
            Bandit::Exp3Ix(b) => b.select_arm(rng, mask),
            Bandit::Exp3Pp(b) => b.select_arm(rng, mask),
        }
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        match self {
            Bandit::Uniform(b) => b.add_reward(arm, reward),
            Bandit::Ucb1(b) => b.add_reward(arm, reward),
            Bandit::KlUcb(b) => b.add_reward(arm, reward),
            Bandit::Thompson(b) => b.add_reward(arm, reward),
            Bandit::AdwinThompson(b) => b.add_reward(arm, reward),
            Bandit::DiscountedThompson(b) => b.add_reward(arm, reward),
            Bandit::DiscountedBoltzmann(b) => b.add_reward(arm, reward),
            Bandit::Exp3Ix(b) => b.add_reward(arm, reward),
            Bandit::Exp3Pp(b) => b.add_reward(arm, reward),
        }
    }
}

#[cfg(test)]
pub(crate) const ALL_STRATEGIES: [StrategyKind; 9] = [
    StrategyKind::Uniform,
    StrategyKind::Ucb1,
    StrategyKind::KlUcb,
    StrategyKind::Thompson,
    StrategyKind::AdwinThompson,
    StrategyKind::DiscountedThompson,
    StrategyKind::DiscountedBoltzmann,
    StrategyKind::Exp3Ix,
    StrategyKind::Exp3Pp,
];
