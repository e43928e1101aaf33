//! Unsupervised validation scores.
//!
//! A [`Scorer`] sees every prediction of one pass through a domain, collected
//! in a [`ScorerInput`] under the name `"logits"`, and returns a fitness where
//! higher is better. No ground truth is involved.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::{AdaptError, Result};
use crate::momentum::mean_entropy;

/// Name of the logits entry in a [`ScorerInput`].
pub const LOGITS: &str = "logits";

/// Named tensors handed to a [`Scorer`].
#[derive(Debug, Clone, Default)]
pub struct ScorerInput {
    entries: BTreeMap<String, Tensor>,
}

impl ScorerInput {
    /// Input holding only `logits`.
    #[must_use]
    pub fn from_logits(logits: Tensor) -> Self {
        let mut input = Self::default();
        input.insert(LOGITS, logits);
        input
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.insert(name.into(), tensor);
    }

    /// Entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// The `"logits"` entry.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] if it is missing.
    pub fn logits(&self) -> Result<&Tensor> {
        self.get(LOGITS)
            .ok_or_else(|| AdaptError::InvalidInput("scorer input has no logits".into()))
    }
}

/// Label-free fitness of a set of predictions.
pub trait Scorer {
    /// Score the predictions; higher is better.
    ///
    /// # Errors
    ///
    /// Returns an error if the input lacks what the scorer needs.
    fn score(&self, input: &ScorerInput) -> Result<f64>;
}

impl<F> Scorer for F
where
    F: Fn(&ScorerInput) -> Result<f64>,
{
    fn score(&self, input: &ScorerInput) -> Result<f64> {
        self(input)
    }
}

/// Information maximization score.
///
/// `H(mean_i p_i) - mean_i H(p_i)`: high when each prediction is confident and
/// the predictions are spread over the classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImScorer;

impl Scorer for ImScorer {
    fn score(&self, input: &ScorerInput) -> Result<f64> {
        let logits = input.logits()?.to_dtype(DType::F64)?;
        let probs = candle_nn::ops::softmax(&logits, 1)?;
        let conditional = mean_entropy(&probs)?;
        let marginal = mean_entropy(&probs.mean_keepdim(0)?)?;
        Ok(marginal - conditional)
    }
}
