//! Adam optimizer built fresh for every adaptation run.

use candle_core::Tensor;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::config::AdaptConfig;
use crate::error::{AdaptError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl From<&AdaptConfig> for OptimizerConfig {
    fn from(config: &AdaptConfig) -> Self {
        Self {
            learning_rate: config.adapt_lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
        }
    }
}

impl OptimizerConfig {
    /// Create an Adam optimizer over every variable in `varmap`.
    ///
    /// Adam is AdamW without weight decay.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adam(&self, varmap: &VarMap) -> Result<AdamOptimizer> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        };

        let opt = candle_nn::AdamW::new(varmap.all_vars(), params)
            .map_err(|e| AdaptError::Training(format!("Failed to create Adam: {e}")))?;

        Ok(AdamOptimizer { inner: opt })
    }
}

/// Adam optimizer wrapper.
///
/// Gradients are recomputed from the loss on every step, so there is no
/// accumulated gradient state to clear between steps.
pub struct AdamOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamOptimizer {
    /// Back-propagate `loss` and update the parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.inner
            .backward_step(loss)
            .map_err(|e| AdaptError::Training(format!("Optimizer step failed: {e}")))
    }
}
