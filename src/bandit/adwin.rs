//! Adaptive windowing over a binary reward stream. The window is an
//! exponential histogram: row `k` holds buckets that each summarize `2^k`
//! consecutive observations, newest first. When the Hoeffding bound says
//! the old and new sides of some split disagree, the oldest bucket is
//! dropped (or the whole window reset), shrinking the summary to the
//! recent regime.

use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct AdwinParams {
    /// Max buckets per row before two merge into the next row.
    pub max_buckets: usize,
    /// Confidence parameter of the cut test.
    pub delta: f64,
    /// Minimum observations required on each side of a candidate cut.
    pub min_elem_to_check: usize,
    /// Window size below which no drop is attempted.
    pub min_elem_to_start_drop: usize,
    /// Run the cut test every this many inserts.
    pub drop_interval: usize,
    /// Reset the whole window instead of dropping the oldest bucket.
    pub reset_on_change: bool,
}

impl Default for AdwinParams {
    fn default() -> Self {
        Self {
            max_buckets: 5,
            delta: 0.002,
            min_elem_to_check: 5,
            min_elem_to_start_drop: 30,
            drop_interval: 32,
            reset_on_change: false,
        }
    }
}

/// Rows of bucket sums. `rows[k]` holds up to `max_buckets` sums, each
/// covering `2^k` observations; front is newest.
#[derive(Clone)]
pub struct Adwin {
    params: AdwinParams,
    rows: Vec<VecDeque<f64>>,
    width: usize,
    total: f64,
    inserts_since_check: usize,
}

impl Adwin {
    pub fn new(params: AdwinParams) -> Self {
        Self {
            params,
            rows: Vec::new(),
            width: 0,
            total: 0.0,
            inserts_since_check: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn sum(&self) -> f64 {
        self.total
    }

    pub fn estimate(&self) -> f64 {
        if self.width == 0 {
            0.0
        } else {
            self.total / self.width as f64
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.width = 0;
        self.total = 0.0;
        self.inserts_since_check = 0;
    }

    pub fn insert(&mut self, x: f64) {
        if self.rows.is_empty() {
            self.rows.push(VecDeque::new());
        }
        self.rows[0].push_front(x);
        self.width += 1;
        self.total += x;
        self.compress();

        self.inserts_since_check += 1;
        if self.inserts_since_check >= self.params.drop_interval {
            self.inserts_since_check = 0;
            self.detect_and_shrink();
        }
    }

    /// Merge overfull rows: the two oldest buckets of row `k` become the
    /// newest bucket of row `k + 1`.
    fn compress(&mut self) {
        let mut k = 0;
        while k < self.rows.len() {
            if self.rows[k].len() > self.params.max_buckets {
                let oldest = self.rows[k].pop_back().unwrap();
                let second = self.rows[k].pop_back().unwrap();
                if k + 1 == self.rows.len() {
                    self.rows.push(VecDeque::new());
                }
                self.rows[k + 1].push_front(oldest + second);
            }
            k += 1;
        }
    }

    /// Repeatedly test every old/new split of the window and shrink while
    /// any split shows a significant difference in means.
    fn detect_and_shrink(&mut self) {
        if self.width < self.params.min_elem_to_start_drop {
            return;
        }
        while self.cut_detected() {
            if self.params.reset_on_change {
                self.clear();
                return;
            }
            self.drop_oldest_bucket();
            if self.width < self.params.min_elem_to_start_drop {
                return;
            }
        }
    }

    /// Walk splits from the oldest bucket toward the newest, accumulating
    /// the old side, and apply the Hoeffding test at each boundary.
    fn cut_detected(&self) -> bool {
        let n = self.width;
        if n < 2 {
            return false;
        }
        let delta_prime = 2.0 * (2.0 * (n as f64).ln() / self.params.delta).ln();
        if !delta_prime.is_finite() {
            return false;
        }
        let u = self.total / n as f64;
        let k_min = self.params.min_elem_to_check;

        let mut n0 = 0usize;
        let mut s0 = 0.0f64;
        for k in (0..self.rows.len()).rev() {
            for &bucket in self.rows[k].iter().rev() {
                n0 += 1 << k;
                s0 += bucket;
                let n1 = n - n0;
                if n0 < k_min || n1 < k_min {
                    continue;
                }
                let s1 = self.total - s0;
                let inv = 1.0 / (1 + n0 - k_min) as f64 + 1.0 / (1 + n1 - k_min) as f64;
                let eps = (u * (1.0 - u) * delta_prime * inv).sqrt() + delta_prime / 3.0 * inv;
                let mean0 = s0 / n0 as f64;
                let mean1 = s1 / n1 as f64;
                if (mean0 - mean1).abs() > eps {
                    return true;
                }
            }
        }
        false
    }

    fn drop_oldest_bucket(&mut self) {
        for k in (0..self.rows.len()).rev() {
            if let Some(bucket) = self.rows[k].pop_back() {
                self.width -= 1 << k;
                self.total -= bucket;
                while matches!(self.rows.last(), Some(row) if row.is_empty()) {
                    self.rows.pop();
                }
                return;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sanity_check(&self) {
        let mut width = 0usize;
        let mut total = 0.0f64;
        for (k, row) in self.rows.iter().enumerate() {
            assert!(
                row.len() <= self.params.max_buckets + 1,
                "row {} holds {} buckets",
                k,
                row.len()
            );
            width += row.len() << k;
            total += row.iter().sum::<f64>();
        }
        assert_eq!(width, self.width);
        assert!((total - self.total).abs() < 1e-6);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    #[test]
    fn histogram_invariants_hold_under_inserts() {
        let mut w = Adwin::new(AdwinParams::default());
        let rng = Rng::new(3);
        for _ in 0..5000 {
            w.insert(if rng.f64() < 0.5 { 1.0 } else { 0.0 });
            w.sanity_check();
        }
    }

    #[test]
    fn estimate_tracks_stationary_mean() {
        let mut w = Adwin::new(AdwinParams::default());
        let rng = Rng::new(9);
        for _ in 0..4000 {
            w.insert(if rng.f64() < 0.3 { 1.0 } else { 0.0 });
        }
        assert!((w.estimate() - 0.3).abs() < 0.05, "{}", w.estimate());
    }

    #[test]
    fn detects_change_and_shrinks_window() {
        // 1000 samples of Bernoulli(0.2), then Bernoulli(0.8); the window
        // must shrink below 1500 at some point after the change, and the
        // estimate must converge towards 0.8 within 500 extra samples.
        let mut w = Adwin::new(AdwinParams::default());
        let rng = Rng::new(77);
        for _ in 0..1000 {
            w.insert(if rng.f64() < 0.2 { 1.0 } else { 0.0 });
        }
        for _ in 0..1000 {
            w.insert(if rng.f64() < 0.8 { 1.0 } else { 0.0 });
        }
        let mut shrunk = w.width() < 1500;
        let mut converged = false;
        for i in 0..500 {
            w.insert(if rng.f64() < 0.8 { 1.0 } else { 0.0 });
            shrunk |= w.width() < 1500;
            if (w.estimate() - 0.8).abs() < 0.1 {
                converged = true;
                let _ = i;
                break;
            }
        }
        assert!(shrunk, "window never shrank: width {}", w.width());
        assert!(converged, "estimate stuck at {}", w.estimate());
    }

    #[test]
    fn reset_on_change_empties_window() {
        let params = AdwinParams {
            reset_on_change: true,
            ..AdwinParams::default()
        };
        let mut w = Adwin::new(params);
        for _ in 0..600 {
            w.insert(0.0);
        }
        for _ in 0..600 {
            w.insert(1.0);
        }
        // at some point after the shift the window was reset and rebuilt
        assert!(w.width() < 1200);
        w.sanity_check();
    }
}
