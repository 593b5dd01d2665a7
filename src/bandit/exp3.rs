//! Exponential-weights strategies for adversarial, non-stationary reward
//! streams: EXP3-IX with implicit exploration, and EXP3++ with per-arm
//! exploration floors driven by gap estimates.

use super::arm::PlainArm;
use super::ArmMask;
use crate::rng::Rng;

/// Map a raw reward into `[0, 1]` given the caller's reward range.
fn rescale(reward: f64, lower: f64, amplitude: f64) -> f64 {
    ((reward - lower) / amplitude).clamp(0.0, 1.0)
}

/// Draw an index from `probs`, restricted to unmasked arms.
fn sample_masked(rng: &Rng, probs: &[f64], mask: Option<&ArmMask>) -> usize {
    let total: f64 = probs
        .iter()
        .enumerate()
        .filter(|(i, _)| ArmMask::allows_opt(mask, *i))
        .map(|(_, p)| p)
        .sum();
    let mut last_allowed = 0;
    if total > 0.0 {
        let mut threshold = rng.f64() * total;
        for (i, &p) in probs.iter().enumerate() {
            if !ArmMask::allows_opt(mask, i) {
                continue;
            }
            last_allowed = i;
            threshold -= p;
            if threshold <= 0.0 {
                return i;
            }
        }
        return last_allowed;
    }
    // degenerate distribution; any allowed arm will do
    let allowed: Vec<usize> = (0..probs.len())
        .filter(|&i| ArmMask::allows_opt(mask, i))
        .collect();
    if allowed.is_empty() {
        0
    } else {
        allowed[rng.below(allowed.len())]
    }
}

pub struct Exp3Ix {
    losses: Vec<f64>,
    /// Normalized weights from the most recent selection.
    probs: Vec<f64>,
    /// Implicit-exploration bias of the most recent selection.
    last_gamma: f64,
    t: usize,
    lower: f64,
    amplitude: f64,
}

impl Exp3Ix {
    pub fn new(num_arms: usize, lower: f64, amplitude: f64) -> Self {
        Self {
            losses: vec![0.0; num_arms],
            probs: vec![1.0 / num_arms as f64; num_arms],
            last_gamma: 0.0,
            t: 0,
            lower,
            amplitude,
        }
    }

    fn recompute_probs(&mut self) {
        let k = self.losses.len() as f64;
        let t = (self.t + 1) as f64;
        let eta = (2.0 * k.ln() / (k * t)).sqrt();
        self.last_gamma = eta / 2.0;
        let min_loss = self.losses.iter().cloned().fold(f64::INFINITY, f64::min);
        let mut total = 0.0;
        for (p, &loss) in self.probs.iter_mut().zip(self.losses.iter()) {
            *p = (-eta * (loss - min_loss)).exp();
            total += *p;
        }
        for p in self.probs.iter_mut() {
            *p /= total;
        }
    }

    pub fn select_arm(&mut self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        self.recompute_probs();
        sample_masked(rng, &self.probs, mask)
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        let loss = 1.0 - rescale(reward, self.lower, self.amplitude);
        self.losses[arm] += loss / (self.probs[arm] + self.last_gamma);
        self.t += 1;
        self.recompute_probs();
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probs
    }
}

pub struct Exp3Pp {
    losses: Vec<f64>,
    stats: Vec<PlainArm>,
    /// Trust distribution from the most recent selection.
    trusts: Vec<f64>,
    t: usize,
    alpha: f64,
    beta: f64,
    lower: f64,
    amplitude: f64,
}

impl Exp3Pp {
    pub fn new(num_arms: usize, alpha: f64, beta: f64, lower: f64, amplitude: f64) -> Self {
        Self {
            losses: vec![0.0; num_arms],
            stats: vec![PlainArm::default(); num_arms],
            trusts: vec![1.0 / num_arms as f64; num_arms],
            t: 0,
            alpha,
            beta,
            lower,
            amplitude,
        }
    }

    /// Gap estimate of an arm's mean loss above the best arm's, from
    /// confidence bounds around the empirical means.
    fn gap_estimate(&self, arm: usize) -> f64 {
        let t = (self.t + 1) as f64;
        let k = self.losses.len() as f64;
        let conf_width = |a: &PlainArm| {
            if a.num_selected == 0 {
                return 1.0;
            }
            (self.alpha * (t * k.powf(1.0 / self.alpha)).ln() / (2.0 * a.num_selected as f64))
                .sqrt()
        };
        let best_ucb_reward = self
            .stats
            .iter()
            .map(|a| a.sample_mean() + conf_width(a))
            .fold(f64::NEG_INFINITY, f64::max);
        let lcb_loss = 1.0 - (self.stats[arm].sample_mean() + conf_width(&self.stats[arm]));
        let best_ucb_loss = 1.0 - best_ucb_reward;
        (lcb_loss - best_ucb_loss).clamp(0.0, 1.0)
    }

    fn recompute_trusts(&mut self) {
        let k = self.losses.len() as f64;
        let t = (self.t + 1) as f64;
        let eta = 0.5 * (k.ln() / (t * k)).sqrt();
        let uniform_floor = 0.5 / k;
        let time_floor = 0.5 * (k.ln() / (t * k)).sqrt();

        let mut epsilons = vec![0.0; self.losses.len()];
        for (i, eps) in epsilons.iter_mut().enumerate() {
            let gap = self.gap_estimate(i);
            let xi = if gap > 0.0 {
                self.beta * t.ln() / (t * gap * gap)
            } else {
                f64::INFINITY
            };
            *eps = uniform_floor.min(time_floor).min(xi);
        }
        let eps_sum: f64 = epsilons.iter().sum();

        let min_loss = self.losses.iter().cloned().fold(f64::INFINITY, f64::min);
        let mut total = 0.0;
        for (w, &loss) in self.trusts.iter_mut().zip(self.losses.iter()) {
            *w = (-eta * (loss - min_loss)).exp();
            total += *w;
        }
        for (w, &eps) in self.trusts.iter_mut().zip(epsilons.iter()) {
            *w = (1.0 - eps_sum) * (*w / total) + eps;
        }
        // normalize away the residual of the floors
        let trust_total: f64 = self.trusts.iter().sum();
        for w in self.trusts.iter_mut() {
            *w /= trust_total;
        }
    }

    pub fn select_arm(&mut self, rng: &Rng, mask: Option<&ArmMask>) -> usize {
        // one forced pull per arm before trusting the weights
        if let Some(arm) = self
            .stats
            .iter()
            .enumerate()
            .position(|(i, a)| ArmMask::allows_opt(mask, i) && a.num_selected == 0)
        {
            return arm;
        }
        self.recompute_trusts();
        sample_masked(rng, &self.trusts, mask)
    }

    pub fn add_reward(&mut self, arm: usize, reward: f64) {
        let r = rescale(reward, self.lower, self.amplitude);
        let loss = 1.0 - r;
        let trust = self.trusts[arm].max(1e-12);
        self.losses[arm] += loss / trust;
        self.stats[arm].record(r);
        self.t += 1;
        self.recompute_trusts();
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.trusts
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
    fn exp3ix_weights_stay_normalized() {
        let rng = Rng::new(31);
        let mut bandit = Exp3Ix::new(5, 0.0, 1.0);
        for _ in 0..2_000 {
            let arm = bandit.select_arm(&rng, None);
            bandit.add_reward(arm, bernoulli(&rng, 0.3));
            let sum: f64 = bandit.probabilities().iter().sum();
            assert!((sum - 1.0).abs() < 1e-8, "sum {}", sum);
        }
    }

    #[test]
    fn exp3ix_prefers_the_better_arm() {
        let rng = Rng::new(32);
        let mut bandit = Exp3Ix::new(2, 0.0, 1.0);
        let mut pulls = [0usize; 2];
        for _ in 0..20_000 {
            let arm = bandit.select_arm(&rng, None);
            pulls[arm] += 1;
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.2 } else { 0.8 }));
        }
        assert!(pulls[1] > pulls[0], "{:?}", pulls);
    }

    #[test]
    fn exp3ix_mask_is_effective() {
        let rng = Rng::new(33);
        let mut bandit = Exp3Ix::new(4, 0.0, 1.0);
        let mut mask = ArmMask::allow_all(4);
        mask.ban(1);
        mask.ban(3);
        for _ in 0..500 {
            let arm = bandit.select_arm(&rng, Some(&mask));
            assert!(arm == 0 || arm == 2);
            bandit.add_reward(arm, 0.0);
        }
    }

    #[test]
    fn exp3pp_weights_stay_normalized() {
        let rng = Rng::new(34);
        let mut bandit = Exp3Pp::new(4, 3.0, 256.0, 0.0, 1.0);
        for _ in 0..2_000 {
            let arm = bandit.select_arm(&rng, None);
            bandit.add_reward(arm, bernoulli(&rng, 0.5));
            let sum: f64 = bandit.probabilities().iter().sum();
            assert!((sum - 1.0).abs() < 1e-8, "sum {}", sum);
        }
    }

    #[test]
    fn exp3pp_pulls_every_arm_once_first() {
        let rng = Rng::new(35);
        let mut bandit = Exp3Pp::new(6, 3.0, 256.0, 0.0, 1.0);
        let mut seen = [false; 6];
        for _ in 0..6 {
            let arm = bandit.select_arm(&rng, None);
            assert!(!seen[arm], "arm {} pulled twice in warmup", arm);
            seen[arm] = true;
            bandit.add_reward(arm, 1.0);
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn exp3pp_prefers_the_better_arm() {
        let rng = Rng::new(36);
        let mut bandit = Exp3Pp::new(2, 3.0, 256.0, 0.0, 1.0);
        let mut pulls = [0usize; 2];
        for _ in 0..20_000 {
            let arm = bandit.select_arm(&rng, None);
            pulls[arm] += 1;
            bandit.add_reward(arm, bernoulli(&rng, if arm == 0 { 0.1 } else { 0.9 }));
        }
        assert!(pulls[1] > pulls[0], "{:?}", pulls);
    }
}
