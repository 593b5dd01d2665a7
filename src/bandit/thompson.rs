//! Thompson-sampling family: the stationary sampler over Beta posteriors,
//! the ADWIN-windowed variant for non-stationary streams, the discounted
//! posterior, and the discounted Boltzmann exploration rule.

use super::adwin::{Adwin, AdwinParams};
use super::arm::{DiscountedArm, PlainArm};
use super::ArmMask;
use crate::rng::Rng;

pub struct Thompson {
    arms: Vec<PlainArm>,
}

impl Thompson {
    pub fn new(num_arms: usize) -> Self {
        Self {
            arms: vec![PlainArm::default(); num_arms],
        }
    }

    pub fn select_arm(&self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        let mut best = usize::MAX;
        let mut best_sample = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            let successes = arm.total_rewards;
            let failures = arm.num_selected as f64 - arm.total_rewards;
            let sample = rng.beta(successes + 1.0, failures.max(0.0) + 1.0);
            if sample > best_sample {
                best_sample = sample;
                best = i;
            }
        }
        debug_assert!(best != usize::MAX, "all arms masked");
        if best == usize::MAX {
            0
        } else {
            best
        }
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        self.arms[arm].record(reward);
    }
}

/// Thompson sampling where each arm's posterior is built from an ADWIN
/// window instead of lifetime counters, so a change in the reward stream
/// discards the stale evidence.
pub struct AdwinThompson {
    windows: Vec<Adwin>,
}

impl AdwinThompson {
    pub fn new(num_arms: usize, params: AdwinParams) -> Self {
        Self {
            windows: (0..num_arms).map(|_| Adwin::new(params.clone())).collect(),
        }
    }

    pub fn select_arm(&self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        let mut best = usize::MAX;
        let mut best_sample = f64::NEG_INFINITY;
        for (i, window) in self.windows.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            let successes = window.sum();
            let failures = window.width() as f64 - window.sum();
            let sample = rng.beta(successes + 1.0, failures.max(0.0) + 1.0);
            if sample > best_sample {
                best_sample = sample;
                best = i;
            }
        }
        debug_assert!(best != usize::MAX, "all arms masked");
        if best == usize::MAX {
            0
        } else {
            best
        }
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        self.windows[arm].insert(reward);
    }
}

/// Discounted Thompson sampling. Evidence decays by `gamma` every round,
/// so the posterior concentrates on the recent reward regime. The
/// optimistic variant never samples below the posterior mean.
pub struct DiscountedThompson {
    arms: Vec<DiscountedArm>,
    gamma: f64,
    optimistic: bool,
}

impl DiscountedThompson {
    pub fn new(num_arms: usize, gamma: f64, optimistic: bool) -> Self {
        Self {
            arms: vec![DiscountedArm::default(); num_arms],
            gamma,
            optimistic,
        }
    }

    pub fn select_arm(&self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        let mut best = usize::MAX;
        let mut best_sample = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            let a = arm.total_rewards + 1.0;
            let b = arm.total_losses + 1.0;
            let mut sample = rng.beta(a, b);
            if self.optimistic {
                sample = sample.max(a / (a + b));
            }
            if sample > best_sample {
                best_sample = sample;
                best = i;
            }
        }
        debug_assert!(best != usize::MAX, "all arms masked");
        if best == usize::MAX {
            0
        } else {
            best
        }
    }

    /// The new observation joins the chosen arm before the whole row of
    /// arms is decayed.
    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        for (i, a) in self.arms.iter_mut().enumerate() {
            if i == arm {
                a.record_and_decay(reward, self.gamma);
            } else {
                a.decay(self.gamma);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn arm(&self, i: usize) -> &DiscountedArm {
        &self.arms[i]
    }
}

/// Discounted Boltzmann exploration. Weights are `2^(beta * mean /
/// (2 max_mean))` with `beta` growing in the number of usable arms; decayed
/// sample means are recomputed lazily from the discounted sums.
pub struct DiscountedBoltzmann {
    arms: Vec<DiscountedArm>,
    gamma: f64,
    weights: Vec<f64>,
}

impl DiscountedBoltzmann {
    pub fn new(num_arms: usize, gamma: f64) -> Self {
        Self {
            arms: vec![DiscountedArm::default(); num_arms],
            gamma,
            weights: vec![0.0; num_arms],
        }
    }

    pub fn select_arm(&mut self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        // every arm gets pulled once before the weights mean anything
        if let Some(arm) = self
            .arms
            .iter()
            .enumerate()
            .position(|(i, a)| ArmMask::allows_opt(mask, i) && a.num_selected == 0)
        {
            return arm;
        }
        let active: Vec<usize> = (0..self.arms.len())
            .filter(|&i| ArmMask::allows_opt(mask, i))
            .collect();
        debug_assert!(!active.is_empty(), "all arms masked");
        if active.is_empty() {
            return 0;
        }
        let max_mean = active
            .iter()
            .map(|&i| self.arms[i].sample_mean())
            .fold(0.0f64, f64::max);
        if max_mean <= 0.0 {
            return active[rng.below(active.len())];
        }
        let beta = 4.0 + 2.0 * active.len() as f64;
        let mut total = 0.0;
        for &i in &active {
            let w = (beta * self.arms[i].sample_mean() / (2.0 * max_mean)).exp2();
            self.weights[i] = w;
            total += w;
        }
        if !total.is_finite() {
            // scaling blew up; drop all learned state and start over
            for a in self.arms.iter_mut() {
                a.reset();
            }
            return active[rng.below(active.len())];
        }
        let mut threshold = rng.f64() * total;
        for &i in &active {
            threshold -= self.weights[i];
            if threshold <= 0.0 {
                return i;
            }
        }
        *active.last().unwrap()
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        for (i, a) in self.arms.iter_mut().enumerate() {
            if i == arm {
                a.record_and_decay(reward, self.gamma);
            } else {
                a.decay(self.gamma);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bernoulli(rng: &Rng, p: f64) -> f64 {
        if rng.f64() < p {
            1.0
        } else {
            0.0
        }
    }

    #[test]
    fn thompson_prefers_the_better_arm() {
        let rng = Rng::new(21);
        let mut bandit = Thompson::new(2);
        let mut pulls = [0usize; 2];
        for _ in 0..5_000 {
            let arm = bandit.select_arm(&rng, None);
            pulls[arm] += 1;
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.2 } else { 0.8 }));
        }
        assert!(pulls[1] > 4_000, "{:?}", pulls);
    }

    #[test]
    fn thompson_honors_mask() {
        let rng = Rng::new(22);
        let mut bandit = Thompson::new(3);
        let mut mask = ArmMask::allow_all(3);
        mask.ban(0);
        mask.ban(2);
        for _ in 0..200 {
            let arm = bandit.select_arm(&rng, Some(&mask));
            assert_eq!(arm, 1);
            bandit.add_reward(arm, 1.0);
        }
    }

    #[test]
    fn adwin_thompson_adapts_to_swapped_means() {
        let rng = Rng::new(23);
        let mut bandit = AdwinThompson::new(2, AdwinParams::default());
        for _ in 0..3_000 {
            let arm = bandit.select_arm(&rng, None);
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.8 } else { 0.2 }));
        }
        // the environment flips; the windowed posterior must follow
        let mut recent = [0usize; 2];
        for i in 0..6_000 {
            let arm = bandit.select_arm(&rng, None);
            if i >= 3_000 {
                recent[arm] += 1;
            }
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.2 } else { 0.8 }));
        }
        assert!(recent[1] > recent[0], "{:?}", recent);
    }

    #[test]
    fn discounted_thompson_decays_all_arms() {
        let mut bandit = DiscountedThompson::new(2, 0.9, false);
        bandit.add_reward(0, 1.0);
        let r0 = bandit.arm(0).total_rewards;
        bandit.add_reward(1, 1.0);
        assert!(bandit.arm(0).total_rewards < r0);
    }

    #[test]
    fn boltzmann_prefers_the_better_arm() {
        let rng = Rng::new(24);
        let mut bandit = DiscountedBoltzmann::new(2, 0.9);
        let mut pulls = [0usize; 2];
        for _ in 0..5_000 {
            let arm = bandit.select_arm(&rng, None);
            pulls[arm] += 1;
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.1 } else { 0.9 }));
        }
        assert!(pulls[1] > pulls[0], "{:?}", pulls);
    }
}
