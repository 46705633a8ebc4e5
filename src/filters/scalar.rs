/// One-dimensional Gaussian belief with Kalman predict/update laws
///
/// The estimate is a `(mean, variance)` pair. `predict` propagates it through a
/// noisy process, `update` fuses an independent measurement of the same
/// quantity by inverse-variance weighting.
use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};
use crate::types::Estimate;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalarEstimate {
    mean: f64,
    variance: f64,
}

impl ScalarEstimate {
    /// Seed an estimate. Variance is clamped at zero and must be finite.
    pub fn new(mean: f64, variance: f64) -> FusionResult<Self> {
        if !mean.is_finite() {
            return Err(FusionError::NonFinite("initial mean"));
        }
        if !variance.is_finite() || variance < 0.0 {
            return Err(FusionError::InvalidProcessNoise { variance });
        }
        Ok(Self { mean, variance })
    }

    /// Perfectly known starting point (zero variance).
    pub fn certain(mean: f64) -> FusionResult<Self> {
        Self::new(mean, 0.0)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn snapshot(&self) -> Estimate {
        Estimate {
            mean: self.mean,
            variance: self.variance,
        }
    }

    /// `mean += delta_mean; variance += added_variance`
    ///
    /// Rejects inputs that would leave the estimate non-finite or with negative
    /// variance; the estimate is untouched on error.
    pub fn predict(&mut self, delta_mean: f64, added_variance: f64) -> FusionResult<()> {
        if !delta_mean.is_finite() {
            return Err(FusionError::NonFinite("predict delta"));
        }
        if !added_variance.is_finite() || added_variance < 0.0 {
            return Err(FusionError::InvalidProcessNoise {
                variance: added_variance,
            });
        }

        let mean = self.mean + delta_mean;
        let variance = self.variance + added_variance;
        if !mean.is_finite() || !variance.is_finite() {
            return Err(FusionError::NonFinite("predicted estimate"));
        }

        self.mean = mean;
        self.variance = variance;
        Ok(())
    }

    /// Fuse a measurement `(measurement_mean, measurement_variance)`.
    ///
    /// Computed in gain form, `k = var / (var + r)`, which equals
    /// `(mean*r + z*var) / (var + r)` and `1 / (1/var + 1/r)` for positive
    /// variances and stays defined when the current variance is zero.
    pub fn update(&mut self, measurement_mean: f64, measurement_variance: f64) -> FusionResult<()> {
        if !measurement_variance.is_finite() || measurement_variance <= 0.0 {
            return Err(FusionError::DivisionHazard {
                variance: measurement_variance,
            });
        }
        if !measurement_mean.is_finite() {
            return Err(FusionError::NonFinite("measurement mean"));
        }

        let total = self.variance + measurement_variance;
        let gain = self.variance / total;
        let mean = self.mean + gain * (measurement_mean - self.mean);
        let variance = self.variance * measurement_variance / total;
        if !mean.is_finite() || !variance.is_finite() {
            return Err(FusionError::NonFinite("updated estimate"));
        }

        self.mean = mean;
        self.variance = variance.max(0.0);
        Ok(())
    }
}
