//! Entropy-driven momentum for the ensemble update.
//!
//! The live model and the ensemble are compared by the mean entropy of their
//! predictions on the incoming domain. A live model that is more certain than
//! the ensemble gets more weight (lower momentum), a less certain one keeps
//! more history:
//!
//! ```text
//! momentum = clip(0.5 + slope * (H_current - H_ensemble), 0, 1)
//! ```
//!
//! The first domain always uses momentum 0.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, Result};

/// Added inside the logarithm so `p = 0` contributes `0`.
pub const ENTROPY_EPS: f64 = 1e-20;

/// Mean Shannon entropy (nats) of the rows of a `(n, classes)` probability tensor.
///
/// # Errors
///
/// Returns [`AdaptError::InvalidInput`] for a non-2-D or empty tensor.
pub fn mean_entropy(probs: &Tensor) -> Result<f64> {
    let (rows, _) = probs.dims2().map_err(|_| {
        AdaptError::InvalidInput(format!(
            "entropy expects (n, classes), got {:?}",
            probs.dims()
        ))
    })?;
    if rows == 0 {
        return Err(AdaptError::InvalidInput(
            "entropy of an empty prediction set".into(),
        ));
    }
    let probs = probs.to_dtype(DType::F64)?;
    let log_probs = probs.affine(1.0, ENTROPY_EPS)?.log()?;
    let entropies = (probs * log_probs)?.sum(1)?.neg()?;
    Ok(entropies.mean_all()?.to_scalar::<f64>()?)
}

/// Map an entropy gap to a momentum coefficient in `[0, 1]`.
#[must_use]
pub fn momentum_from_entropy(slope: f64, current_entropy: f64, ensemble_entropy: f64) -> f64 {
    (0.5 + slope * (current_entropy - ensemble_entropy)).clamp(0.0, 1.0)
}

/// Outcome of one momentum estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MomentumEstimate {
    /// Domain the estimate was made for.
    pub domain: usize,
    /// Mean entropy of the ensemble pseudo-labels.
    pub ensemble_entropy: f64,
    /// Mean entropy of the live model.
    pub current_entropy: f64,
    /// Blend weight kept on the accumulated history.
    pub momentum: f64,
}

/// Computes [`MomentumEstimate`]s with a fixed slope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumEstimator {
    slope: f64,
}

impl MomentumEstimator {
    /// Create an estimator.
    #[must_use]
    pub const fn new(slope: f64) -> Self {
        Self { slope }
    }

    /// Slope of the entropy-to-momentum map.
    #[must_use]
    pub const fn slope(&self) -> f64 {
        self.slope
    }

    /// Estimate the momentum for `domain`.
    ///
    /// `current` holds the live model's probabilities and `ensemble` the
    /// normalized store rows for the same examples.
    ///
    /// # Errors
    ///
    /// Returns an error if either set is empty or not 2-D.
    pub fn estimate(
        &self,
        domain: usize,
        first_domain: bool,
        current: &Tensor,
        ensemble: &Tensor,
    ) -> Result<MomentumEstimate> {
        let ensemble_entropy = mean_entropy(ensemble)?;
        let current_entropy = mean_entropy(current)?;
        let momentum = if first_domain {
            0.0
        } else {
            momentum_from_entropy(self.slope, current_entropy, ensemble_entropy)
        };
        Ok(MomentumEstimate {
            domain,
            ensemble_entropy,
            current_entropy,
            momentum,
        })
    }
}
