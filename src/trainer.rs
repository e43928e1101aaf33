//! Pseudo-label training epochs and adaptation runs.

use candle_core::Tensor;

use crate::config::{AdaptConfig, EmptyMaskPolicy};
use crate::data::DataLoader;
use crate::error::{AdaptError, Result};
use crate::metrics::MetricsSink;
use crate::model::AdaptModel;
use crate::optimizer::{AdamOptimizer, OptimizerConfig};
use crate::oracle::oracle_eval;
use crate::scorer::{Scorer, ScorerInput};
use crate::store::PseudoLabelStore;
use crate::threshold::pseudo_label_loss;

/// Result of one pass over a loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Mask-weighted mean pseudo-label loss; NaN if nothing was selected.
    pub loss: f64,
    /// Unsupervised score of every logit produced in the pass.
    pub score: f64,
    /// Examples that passed the confidence mask.
    pub selected: usize,
    /// Batches skipped because their mask was empty.
    pub skipped_batches: usize,
}

/// Output of [`AdaptationTrainer::run`].
pub struct RunOutput<M> {
    /// The trained copy of the model.
    pub model: M,
    /// Train score of the final epoch.
    pub score: f64,
    /// Train loss of the final epoch.
    pub loss: f64,
    /// Pseudo-label accuracy after the final epoch, when labels are known.
    pub pseudo_label_accuracy: Option<f64>,
}

/// Trains model copies against the thresholded pseudo-labels of a store.
///
/// The store is only read; it is refreshed by the caller before a run.
pub struct AdaptationTrainer<'a, S: Scorer + ?Sized> {
    store: &'a PseudoLabelStore,
    scorer: &'a S,
    empty_mask: EmptyMaskPolicy,
}

impl<'a, S: Scorer + ?Sized> AdaptationTrainer<'a, S> {
    /// Create a trainer reading pseudo-labels from `store`.
    pub fn new(store: &'a PseudoLabelStore, scorer: &'a S, empty_mask: EmptyMaskPolicy) -> Self {
        Self {
            store,
            scorer,
            empty_mask,
        }
    }

    /// One optimization pass over `loader`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::EmptyMask`] under [`EmptyMaskPolicy::Fail`], or
    /// any forward, backward or scoring error.
    pub fn train_epoch<M, L>(
        &self,
        model: &M,
        loader: &L,
        optimizer: &mut AdamOptimizer,
        alpha: f64,
    ) -> Result<EpochStats>
    where
        M: AdaptModel,
        L: DataLoader + ?Sized,
    {
        self.run_epoch(model, loader, alpha, Some(optimizer))
    }

    /// One pass over `loader` without parameter updates.
    ///
    /// # Errors
    ///
    /// Same as [`train_epoch`](Self::train_epoch).
    pub fn eval_epoch<M, L>(&self, model: &M, loader: &L, alpha: f64) -> Result<EpochStats>
    where
        M: AdaptModel,
        L: DataLoader + ?Sized,
    {
        self.run_epoch(model, loader, alpha, None)
    }

    fn run_epoch<M, L>(
        &self,
        model: &M,
        loader: &L,
        alpha: f64,
        mut optimizer: Option<&mut AdamOptimizer>,
    ) -> Result<EpochStats>
    where
        M: AdaptModel,
        L: DataLoader + ?Sized,
    {
        let mut total_loss = 0.0;
        let mut total_num = 0usize;
        let mut skipped_batches = 0usize;
        let mut all_logits = Vec::new();

        for (i, batch) in loader.batches().enumerate() {
            let batch = batch?;
            let student_logits = model.forward(&batch.inputs)?;
            let ensemble_probs = self.store.normalized_rows(&batch.ids)?;
            let out = pseudo_label_loss(&student_logits, &ensemble_probs, alpha)?;

            if out.selected == 0 {
                match self.empty_mask {
                    EmptyMaskPolicy::Fail => return Err(AdaptError::EmptyMask { batch: i }),
                    EmptyMaskPolicy::Skip => {
                        tracing::warn!("batch {} has no example above alpha {:.4}, skipped", i, alpha);
                        skipped_batches += 1;
                    }
                }
            } else {
                let value = out.value()?;
                if let Some(optimizer) = optimizer.as_deref_mut() {
                    optimizer.backward_step(&out.loss)?;
                }
                total_loss += value * out.selected as f64;
                total_num += out.selected;
                tracing::debug!("batch {}: loss {:.4}, {} selected", i, value, out.selected);
            }
            all_logits.push(student_logits.detach());
        }

        if all_logits.is_empty() {
            return Err(AdaptError::InvalidInput("epoch over an empty loader".into()));
        }
        let loss = if total_num == 0 {
            tracing::warn!("no example passed alpha {:.4} in this epoch", alpha);
            f64::NAN
        } else {
            total_loss / total_num as f64
        };
        let logits = Tensor::cat(&all_logits, 0)?;
        let score = self.scorer.score(&ScorerInput::from_logits(logits))?;

        Ok(EpochStats {
            loss,
            score,
            selected: total_num,
            skipped_batches,
        })
    }

    /// Adapt a deep copy of `current` to `loader` for `config.adapt_epochs`
    /// epochs with a fresh Adam optimizer.
    ///
    /// Per epoch, train loss and score (and oracle accuracies when `loader`
    /// carries labels, validation loss and score when `val_loader` is given)
    /// are logged and sent to `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if cloning, optimizer creation or any epoch fails.
    #[allow(clippy::too_many_arguments)]
    pub fn run<M, L>(
        &self,
        current: &M,
        loader: &L,
        alpha: f64,
        confidence_q: f64,
        config: &AdaptConfig,
        sink: &mut dyn MetricsSink,
        val_loader: Option<&L>,
    ) -> Result<RunOutput<M>>
    where
        M: AdaptModel,
        L: DataLoader + ?Sized,
    {
        let model = current.deep_clone()?;
        let mut optimizer = OptimizerConfig::from(config).build_adam(model.vars())?;

        let mut last = None;
        let mut pseudo_label_accuracy = None;
        for epoch in 1..=config.adapt_epochs {
            let train = self.train_epoch(&model, loader, &mut optimizer, alpha)?;
            let oracle = match oracle_eval(&model, self.store, loader) {
                Ok(report) => report,
                Err(e) => {
                    tracing::warn!("oracle evaluation failed: {e}");
                    None
                }
            };

            match oracle {
                Some(report) => tracing::info!(
                    "Slope: {} Confidence q: {} Epoch: {} Train Loss: {:.4} Train Acc: {:.4} PL Acc: {:.4}",
                    config.slope,
                    confidence_q,
                    epoch,
                    train.loss,
                    report.accuracy,
                    report.pseudo_label_accuracy
                ),
                None => tracing::info!(
                    "Slope: {} Confidence q: {} Epoch: {} Train Loss: {:.4} Train Score: {:.4}",
                    config.slope,
                    confidence_q,
                    epoch,
                    train.loss,
                    train.score
                ),
            }

            sink.add_scalar("Loss/train", train.loss, epoch);
            sink.add_scalar("Score/train", train.score, epoch);
            if let Some(report) = oracle {
                sink.add_scalar("Acc/train", report.accuracy, epoch);
                sink.add_scalar("PLAcc/train", report.pseudo_label_accuracy, epoch);
                pseudo_label_accuracy = Some(report.pseudo_label_accuracy);
            }
            if let Some(val_loader) = val_loader {
                let val = self.eval_epoch(&model, val_loader, alpha)?;
                sink.add_scalar("Loss/val", val.loss, epoch);
                sink.add_scalar("Score/val", val.score, epoch);
            }
            last = Some(train);
        }

        let last = last.ok_or_else(|| AdaptError::Config("adapt_epochs must be > 0".into()))?;
        Ok(RunOutput {
            model,
            score: last.score,
            loss: last.loss,
            pseudo_label_accuracy,
        })
    }
}

/// Supervised cross-entropy training on labelled batches, used to fit the
/// source model before adaptation. Returns the mean loss of every epoch.
///
/// # Errors
///
/// Returns [`AdaptError::InvalidInput`] if a batch has no labels, or any
/// forward or backward error.
pub fn fit_source<M, L>(
    model: &M,
    loader: &L,
    epochs: usize,
    optimizer: &mut AdamOptimizer,
) -> Result<Vec<f64>>
where
    M: AdaptModel,
    L: DataLoader + ?Sized,
{
    let mut history = Vec::with_capacity(epochs);
    for epoch in 1..=epochs {
        let mut total = 0.0;
        let mut count = 0usize;
        for batch in loader.batches() {
            let batch = batch?;
            let labels = batch.labels.as_ref().ok_or_else(|| {
                AdaptError::InvalidInput("source training needs labelled batches".into())
            })?;
            let logits = model.forward(&batch.inputs)?;
            let loss = candle_nn::loss::cross_entropy(&logits, labels)?;
            total += f64::from(loss.to_scalar::<f32>()?) * batch.len() as f64;
            count += batch.len();
            optimizer.backward_step(&loss)?;
        }
        let mean = if count == 0 { f64::NAN } else { total / count as f64 };
        tracing::debug!("source epoch {}: loss {:.4}", epoch, mean);
        history.push(mean);
    }
    Ok(history)
}
