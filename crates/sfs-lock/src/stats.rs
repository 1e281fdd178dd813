//! Integer mean and variance.
//!
//! Two estimators share one trait: [`MeanAndVariance`] keeps exact running
//! sums, [`MeanAndVarianceWeighted`] is an exponentially weighted moving
//! estimate in fixed point. The weighted form keeps `mean` and `variance`
//! scaled by `2^weight` so small deltas are not lost to truncation:
//!
//! ```text
//!   x_w     = x << w
//!   diff_w  = x_w - mean_w
//!   mean_w' = mean_w + diff_w / 2^w
//!   var_w'  = (var_w * (2^w - 1) + diff_w * (x_w - mean_w') / 2^w) / 2^w
//! ```

use serde::{Deserialize, Serialize};

pub trait MeanAndVarianceStats {
    fn update(&mut self, sample: i64);
    fn mean(&self) -> i64;
    fn variance(&self) -> u64;

    fn stddev(&self) -> u64 {
        self.variance().isqrt()
    }
}

/// Exact mean and variance over every sample seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeanAndVariance {
    n: u64,
    sum: i128,
    sum_squares: u128,
}

impl MeanAndVariance {
    #[must_use]
    pub fn count(&self) -> u64 {
        self.n
    }
}

impl MeanAndVarianceStats for MeanAndVariance {
    fn update(&mut self, sample: i64) {
        self.n = self.n.saturating_add(1);
        self.sum = self.sum.saturating_add(i128::from(sample));
        let sq = u128::from(sample.unsigned_abs()).saturating_mul(u128::from(sample.unsigned_abs()));
        self.sum_squares = self.sum_squares.saturating_add(sq);
    }

    fn mean(&self) -> i64 {
        if self.n == 0 {
            return 0;
        }
        i64::try_from(self.sum / i128::from(self.n)).unwrap_or(i64::MAX)
    }

    fn variance(&self) -> u64 {
        if self.n == 0 {
            return 0;
        }
        let mean = self.mean().unsigned_abs();
        let mean_sq = u128::from(mean) * u128::from(mean);
        let var = (self.sum_squares / u128::from(self.n)).saturating_sub(mean_sq);
        u64::try_from(var).unwrap_or(u64::MAX)
    }
}

/// Exponentially weighted estimate; larger `weight` reacts more slowly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeanAndVarianceWeighted {
    weight: u8,
    initialized: bool,
    mean: i64,
    variance: u64,
}

/// Round-toward-zero division by `2^d` for signed values.
fn fast_divpow2(n: i128, d: u8) -> i128 {
    let bias = if n < 0 { (1_i128 << d) - 1 } else { 0 };
    (n + bias) >> d
}

impl MeanAndVarianceWeighted {
    /// `weight` must be below 32; larger values are clamped.
    #[must_use]
    pub fn new(weight: u8) -> Self {
        Self {
            weight: weight.min(31),
            initialized: false,
            mean: 0,
            variance: 0,
        }
    }

    #[must_use]
    pub fn weight(&self) -> u8 {
        self.weight
    }
}

impl MeanAndVarianceStats for MeanAndVarianceWeighted {
    fn update(&mut self, sample: i64) {
        let w = self.weight;
        let x_w = i128::from(sample) << w;
        if !self.initialized {
            self.mean = i64::try_from(x_w).unwrap_or(if sample < 0 { i64::MIN } else { i64::MAX });
            self.variance = 0;
            self.initialized = true;
            return;
        }
        let mean = i128::from(self.mean);
        let diff_w = x_w - mean;
        let next_mean = mean + fast_divpow2(diff_w, w);
        let var = i128::from(self.variance);
        let spread = (diff_w * (x_w - next_mean)).max(0) >> w;
        let next_var = ((var << w) - var + spread) >> w;
        self.mean = i64::try_from(next_mean).unwrap_or(if next_mean < 0 { i64::MIN } else { i64::MAX });
        self.variance = u64::try_from(next_var.max(0)).unwrap_or(u64::MAX);
    }

    fn mean(&self) -> i64 {
        i64::try_from(fast_divpow2(i128::from(self.mean), self.weight)).unwrap_or(0)
    }

    fn variance(&self) -> u64 {
        self.variance >> self.weight
    }
}
