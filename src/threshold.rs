//! Confidence thresholding of pseudo-labels.
//!
//! The confidence of a probability row is its spread `max - min`. An example is
//! trusted for training when the spread of its ensemble row reaches `alpha`,
//! the `confidence_q` quantile of the spreads of its domain.

use candle_core::{DType, Tensor};

use crate::data::DataLoader;
use crate::error::{AdaptError, Result};
use crate::store::PseudoLabelStore;

/// Per-row `max - min` of a `(n, classes)` tensor.
///
/// # Errors
///
/// Returns an error if the tensor is not 2-D.
pub fn confidence_spread(probs: &Tensor) -> Result<Tensor> {
    probs.dims2()?;
    Ok((probs.max(1)? - probs.min(1)?)?)
}

/// `q`-quantile of `values`, interpolating linearly between order statistics.
///
/// # Errors
///
/// Returns [`AdaptError::InvalidInput`] if `values` is empty or `q` is outside
/// `[0, 1]`.
pub fn quantile(values: &[f64], q: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&q) {
        return Err(AdaptError::InvalidInput(format!(
            "quantile {q} outside [0, 1]"
        )));
    }
    if values.is_empty() {
        return Err(AdaptError::InvalidInput(
            "quantile of an empty set".into(),
        ));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

/// Confidence threshold for one domain: the `confidence_q` quantile of the
/// spreads of the raw accumulator rows of every example in `loader`.
///
/// # Errors
///
/// Returns [`AdaptError::InvalidInput`] for an empty loader or a quantile
/// outside `[0, 1]`.
pub fn calc_alpha<L: DataLoader + ?Sized>(
    store: &PseudoLabelStore,
    loader: &L,
    confidence_q: f64,
) -> Result<f64> {
    let mut spreads = Vec::with_capacity(loader.num_examples());
    for batch in loader.batches() {
        let batch = batch?;
        let rows = store.raw_rows(&batch.ids)?;
        spreads.extend(confidence_spread(&rows)?.to_dtype(DType::F64)?.to_vec1::<f64>()?);
    }
    if spreads.is_empty() {
        return Err(AdaptError::InvalidInput(
            "cannot derive alpha from an empty loader".into(),
        ));
    }
    quantile(&spreads, confidence_q)
}

/// Masked pseudo-label loss of one batch.
#[derive(Debug, Clone)]
pub struct PseudoLabelLoss {
    /// Mean NLL over the selected examples; NaN when none is selected.
    pub loss: Tensor,
    /// `mask[i]` is true when example `i` reached the threshold.
    pub mask: Vec<bool>,
    /// Number of selected examples.
    pub selected: usize,
}

impl PseudoLabelLoss {
    /// Loss as a host scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor cannot be read back.
    pub fn value(&self) -> Result<f64> {
        Ok(self.loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }
}

/// Negative log-likelihood of the student at the ensemble's argmax, averaged
/// over the examples whose ensemble spread is `>= alpha`.
///
/// Unselected examples add nothing to the numerator and are left out of the
/// count. With no selected example the division is `0 / 0` and the loss is
/// NaN.
///
/// # Errors
///
/// Returns [`AdaptError::ShapeMismatch`] if the two tensors differ in shape.
pub fn pseudo_label_loss(
    student_logits: &Tensor,
    ensemble_probs: &Tensor,
    alpha: f64,
) -> Result<PseudoLabelLoss> {
    let (batch, classes) = student_logits.dims2()?;
    if ensemble_probs.dims() != [batch, classes] {
        return Err(AdaptError::shape_mismatch(
            &[batch, classes],
            ensemble_probs.dims(),
        ));
    }
    let device = student_logits.device();

    let rows = ensemble_probs.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let mut mask = Vec::with_capacity(batch);
    let mut targets = Vec::with_capacity(batch);
    for row in &rows {
        let (argmax, max) = row
            .iter()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |best, (i, &p)| {
                if p > best.1 {
                    (i, p)
                } else {
                    best
                }
            });
        let min = row.iter().copied().fold(f64::INFINITY, f64::min);
        mask.push(max - min >= alpha);
        targets.push(argmax as u32);
    }
    let selected = mask.iter().filter(|&&m| m).count();

    let labels = Tensor::from_vec(targets, batch, device)?.unsqueeze(1)?;
    let weights = Tensor::from_vec(
        mask.iter().map(|&m| if m { 1f32 } else { 0f32 }).collect::<Vec<_>>(),
        batch,
        device,
    )?
    .to_dtype(student_logits.dtype())?;

    let log_probs = candle_nn::ops::log_softmax(student_logits, 1)?;
    let nll = log_probs.gather(&labels, 1)?.squeeze(1)?.neg()?;
    let total = (nll * weights)?.sum_all()?;
    let count = Tensor::new(selected as f32, device)?.to_dtype(total.dtype())?;
    let loss = total.broadcast_div(&count)?;

    Ok(PseudoLabelLoss {
        loss,
        mask,
        selected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryLoader;
    use candle_core::Device;

    fn tensor(rows: Vec<Vec<f64>>) -> Tensor {
        let (r, c) = (rows.len(), rows[0].len());
        Tensor::from_vec(rows.concat(), (r, c), &Device::Cpu).unwrap()
    }

    fn logits(rows: Vec<Vec<f32>>) -> Tensor {
        let (r, c) = (rows.len(), rows[0].len());
        Tensor::from_vec(rows.concat(), (r, c), &Device::Cpu).unwrap()
    }

    fn loader(ids: Vec<u32>) -> InMemoryLoader {
        let device = Device::Cpu;
        let inputs = Tensor::zeros((ids.len(), 1), DType::F32, &device).unwrap();
        InMemoryLoader::new(ids, inputs, None, 2, &device).unwrap()
    }

    #[test]
    fn test_quantile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&values, 0.0).unwrap(), 1.0);
        assert_eq!(quantile(&values, 1.0).unwrap(), 4.0);
        assert!((quantile(&values, 0.5).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_quantile_rejects_bad_input() {
        assert!(quantile(&[], 0.5).is_err());
        assert!(quantile(&[1.0], 1.1).is_err());
        assert!(quantile(&[1.0], -0.1).is_err());
    }

    #[test]
    fn test_alpha_monotone_in_quantile() {
        let raw = tensor(vec![
            vec![0.9, 0.1],
            vec![0.6, 0.4],
            vec![0.5, 0.5],
            vec![0.2, 0.8],
            vec![0.7, 0.3],
        ]);
        let store = PseudoLabelStore::from_raw(raw).unwrap();
        let loader = loader(vec![0, 1, 2, 3, 4]);

        let mut previous = f64::NEG_INFINITY;
        for step in 0..=20 {
            let alpha = calc_alpha(&store, &loader, f64::from(step) / 20.0).unwrap();
            assert!(alpha >= previous);
            previous = alpha;
        }
    }

    #[test]
    fn test_alpha_uses_only_loader_ids() {
        let store =
            PseudoLabelStore::from_raw(tensor(vec![vec![1.0, 0.0], vec![0.5, 0.5]])).unwrap();
        let alpha = calc_alpha(&store, &loader(vec![1]), 1.0).unwrap();
        assert!(alpha.abs() < 1e-12);
    }

    #[test]
    fn test_alpha_empty_loader_rejected() {
        let store = PseudoLabelStore::zeros(2, 2, &Device::Cpu).unwrap();
        let err = calc_alpha(&store, &loader(Vec::new()), 0.5).unwrap_err();
        assert!(matches!(err, AdaptError::InvalidInput(_)));
    }

    #[test]
    fn test_mask_includes_boundary() {
        let ensemble = tensor(vec![vec![0.75, 0.25], vec![0.6, 0.4], vec![0.25, 0.75]]);
        let student = logits(vec![vec![0.0, 0.0]; 3]);
        let out = pseudo_label_loss(&student, &ensemble, 0.5).unwrap();
        assert_eq!(out.mask, vec![true, false, true]);
        assert_eq!(out.selected, 2);
    }

    #[test]
    fn test_loss_averages_selected_only() {
        let ensemble = tensor(vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
        let student = logits(vec![vec![0.0, 0.0], vec![10.0, -10.0]]);
        let out = pseudo_label_loss(&student, &ensemble, 0.9).unwrap();
        assert_eq!(out.mask, vec![true, false]);
        assert!((out.value().unwrap() - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_loss_targets_ensemble_argmax() {
        let ensemble = tensor(vec![vec![0.1, 0.9]]);
        let confident_right = pseudo_label_loss(&logits(vec![vec![-5.0, 5.0]]), &ensemble, 0.0)
            .unwrap()
            .value()
            .unwrap();
        let confident_wrong = pseudo_label_loss(&logits(vec![vec![5.0, -5.0]]), &ensemble, 0.0)
            .unwrap()
            .value()
            .unwrap();
        assert!(confident_right < 1e-3);
        assert!(confident_wrong > 9.0);
    }

    #[test]
    fn test_empty_mask_is_nan() {
        let ensemble = tensor(vec![vec![0.5, 0.5]]);
        let out = pseudo_label_loss(&logits(vec![vec![1.0, 0.0]]), &ensemble, 0.5).unwrap();
        assert_eq!(out.selected, 0);
        assert!(out.value().unwrap().is_nan());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let ensemble = tensor(vec![vec![0.5, 0.25, 0.25]]);
        let err = pseudo_label_loss(&logits(vec![vec![1.0, 0.0]]), &ensemble, 0.5).unwrap_err();
        assert!(matches!(err, AdaptError::ShapeMismatch { .. }));
    }
}
