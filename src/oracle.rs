//! Ground-truth diagnostics.
//!
//! Accuracy of the student and of the ensemble pseudo-labels. Only reported,
//! never used to pick a model.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::data::DataLoader;
use crate::error::Result;
use crate::model::AdaptModel;
use crate::store::PseudoLabelStore;

/// Accuracies over the labelled examples of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleReport {
    /// Student argmax vs. ground truth.
    pub accuracy: f64,
    /// `argmax(z[id])` vs. ground truth.
    pub pseudo_label_accuracy: f64,
    /// Number of labelled examples seen.
    pub examples: usize,
}

/// Evaluate `model` and the store's pseudo-labels against ground truth.
///
/// Batches without labels are skipped. Returns `None` when the loader has no
/// labelled example.
///
/// # Errors
///
/// Returns an error if the forward pass or a store lookup fails.
pub fn oracle_eval<M, L>(
    model: &M,
    store: &PseudoLabelStore,
    loader: &L,
) -> Result<Option<OracleReport>>
where
    M: AdaptModel,
    L: DataLoader + ?Sized,
{
    let mut correct = 0usize;
    let mut pl_correct = 0usize;
    let mut total = 0usize;

    for batch in loader.batches() {
        let batch = batch?;
        let Some(labels) = &batch.labels else {
            continue;
        };
        let labels = labels.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;

        let preds = model.forward(&batch.inputs)?.argmax(1)?.to_vec1::<u32>()?;
        let pseudo = store
            .normalized_rows(&batch.ids)?
            .argmax(1)?
            .to_vec1::<u32>()?;

        correct += preds.iter().zip(&labels).filter(|(p, y)| p == y).count();
        pl_correct += pseudo.iter().zip(&labels).filter(|(p, y)| p == y).count();
        total += labels.len();
    }

    if total == 0 {
        return Ok(None);
    }
    Ok(Some(OracleReport {
        accuracy: correct as f64 / total as f64,
        pseudo_label_accuracy: pl_correct as f64 / total as f64,
        examples: total,
    }))
}
