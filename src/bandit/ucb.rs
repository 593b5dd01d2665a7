//! Upper-confidence-bound strategies: classic UCB1 and the tighter KL-UCB
//! index computed by Newton iteration on the binary KL divergence.

use super::arm::PlainArm;
use super::ArmMask;

pub struct Ucb1 {
    arms: Vec<PlainArm>,
    t: usize,
}

impl Ucb1 {
    pub fn new(num_arms: usize) -> Self {
        Self {
            arms: vec![PlainArm::default(); num_arms],
            t: 0,
        }
    }

    pub fn select_arm(&self, mask: Option<&ArmMask>) -> usize {
        // unseen arms first
        if let Some(arm) = self
            .arms
            .iter()
            .enumerate()
            .position(|(i, a)| ArmMask::allows_opt(mask, i) && a.num_selected == 0)
        {
            return arm;
        }
        let ln_t = (self.t.max(1) as f64).ln();
        let mut best = usize::MAX;
        let mut best_score = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            let bonus = (2.0 * ln_t / arm.num_selected as f64).sqrt();
            let score = arm.sample_mean() + bonus;
            if score > best_score {
                best_score = score;
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
        self.t += 1;
    }

    #[cfg(test)]
    pub(crate) fn arm(&self, i: usize) -> &PlainArm {
        &self.arms[i]
    }
}

/// Bernoulli KL divergence with the usual conventions at the boundary.
fn kl_bernoulli(p: f64, q: f64) -> f64 {
    let q = q.clamp(1e-15, 1.0 - 1e-15);
    let mut kl = 0.0;
    if p > 0.0 {
        kl += p * (p / q).ln();
    }
    if p < 1.0 {
        kl += (1.0 - p) * ((1.0 - p) / (1.0 - q)).ln();
    }
    kl
}

pub struct KlUcb {
    arms: Vec<PlainArm>,
    t: usize,
    /// Newton start offset and clip margin.
    delta: f64,
    /// Squared-residual convergence threshold.
    eps: f64,
}

impl KlUcb {
    const MAX_NEWTON_ITERS: usize = 25;

    pub fn new(num_arms: usize, delta: f64, eps: f64) -> Self {
        Self {
            arms: vec![PlainArm::default(); num_arms],
            t: 0,
            delta,
            eps,
        }
    }

    /// Largest `q` with `n_a * KL(mean, q) <= ln t`, by Newton from
    /// `mean + delta`, clipped to `[mean + delta, 1 - delta]`.
    fn index(&self, arm: &PlainArm) -> f64 {
        let p = arm.sample_mean();
        let target = (self.t.max(1) as f64).ln() / arm.num_selected as f64;
        let lo = p + self.delta;
        let hi = 1.0 - self.delta;
        if lo >= hi {
            return hi;
        }
        let mut q = lo;
        for _ in 0..Self::MAX_NEWTON_ITERS {
            let f = kl_bernoulli(p, q);
            if (target - f) * (target - f) < self.eps {
                break;
            }
            let df = (q - p) / (q * (1.0 - q));
            if df <= 0.0 {
                break;
            }
            q = (q + (target - f) / df).clamp(lo, hi);
        }
        q
    }

    pub fn select_arm(&self, mask: Option<&ArmMask>) -> usize {
        if let Some(arm) = self
            .arms
            .iter()
            .enumerate()
            .position(|(i, a)| ArmMask::allows_opt(mask, i) && a.num_selected == 0)
        {
            return arm;
        }
        let mut best = usize::MAX;
        let mut best_score = f64::NEG_INFINITY;
        for (i, arm) in self.arms.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            let score = self.index(arm);
            if score > best_score {
                best_score = score;
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
        self.t += 1;
    }
}
