//! Momentum-blended pseudo-label store.
//!
//! Two `(num_examples, num_classes)` tensors are kept for the whole dataset:
//!
//! - `Z`, the raw accumulator, blended in place as
//!   `Z[i] = m * Z[i] + (1 - m) * softmax(model(x_i))`
//! - `z`, the row-L1-normalized view of `Z`, used as the pseudo-label source
//!
//! Rows are addressed by example id; ids must be dense and zero-based across
//! every domain. Neither tensor is ever reset between domains.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::data::DataLoader;
use crate::error::{AdaptError, Result};
use crate::model::AdaptModel;
use crate::momentum::{MomentumEstimate, MomentumEstimator};

/// Lower bound on an L1 norm before dividing.
const L1_EPS: f64 = 1e-12;

/// Divide each row of a 2-D tensor by its L1 norm (clamped below by `1e-12`).
///
/// # Errors
///
/// Returns an error if the tensor is not 2-D.
pub fn l1_normalize(rows: &Tensor) -> Result<Tensor> {
    rows.dims2()?;
    let norms = rows.abs()?.sum_keepdim(1)?.maximum(L1_EPS)?;
    Ok(rows.broadcast_div(&norms)?)
}

/// Raw and normalized pseudo-label accumulators.
#[derive(Debug, Clone)]
pub struct PseudoLabelStore {
    raw: Tensor,
    normalized: Tensor,
    num_classes: usize,
    first_domain: Option<usize>,
}

impl PseudoLabelStore {
    /// All-zero store for `num_examples` ids on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_classes` is zero or allocation fails.
    pub fn zeros(num_examples: usize, num_classes: usize, device: &Device) -> Result<Self> {
        Self::from_raw(Tensor::zeros((num_examples, num_classes), DType::F64, device)?)
    }

    /// Store seeded with an existing raw accumulator.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not 2-D with at least one class.
    pub fn from_raw(raw: Tensor) -> Result<Self> {
        let (_, num_classes) = raw.dims2().map_err(|_| {
            AdaptError::InvalidInput(format!("store must be 2-D, got {:?}", raw.dims()))
        })?;
        if num_classes == 0 {
            return Err(AdaptError::InvalidInput("store needs at least one class".into()));
        }
        let raw = raw.to_dtype(DType::F64)?.detach();
        let normalized = l1_normalize(&raw)?;
        Ok(Self {
            raw,
            normalized,
            num_classes,
            first_domain: None,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn num_examples(&self) -> usize {
        self.raw.dims()[0]
    }

    /// Row width.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Device both accumulators live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.raw.device()
    }

    /// The raw accumulator `Z`.
    #[must_use]
    pub fn raw(&self) -> &Tensor {
        &self.raw
    }

    /// The normalized accumulator `z`.
    #[must_use]
    pub fn normalized(&self) -> &Tensor {
        &self.normalized
    }

    /// Domain of the first successful [`update`](Self::update), if any.
    #[must_use]
    pub fn first_domain(&self) -> Option<usize> {
        self.first_domain
    }

    /// Rows of `Z` for `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] for ids outside the store.
    pub fn raw_rows(&self, ids: &Tensor) -> Result<Tensor> {
        self.check_ids(ids)?;
        Ok(self.raw.index_select(ids, 0)?)
    }

    /// Rows of `z` for `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] for ids outside the store.
    pub fn normalized_rows(&self, ids: &Tensor) -> Result<Tensor> {
        self.check_ids(ids)?;
        Ok(self.normalized.index_select(ids, 0)?)
    }

    fn check_ids(&self, ids: &Tensor) -> Result<()> {
        let n = self.num_examples();
        let ids = ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= n) {
            return Err(AdaptError::InvalidInput(format!(
                "example id {bad} outside store of {n} rows"
            )));
        }
        Ok(())
    }

    /// Blend `probs` into the rows of `ids` with weight `momentum` on history.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::ShapeMismatch`] if `probs` is not
    /// `(ids.len(), num_classes)`, or [`AdaptError::InvalidInput`] for ids
    /// outside the store or repeated within the call.
    pub fn blend(&mut self, ids: &Tensor, probs: &Tensor, momentum: f64) -> Result<()> {
        let expected = [ids.elem_count(), self.num_classes];
        if probs.dims() != expected {
            return Err(AdaptError::shape_mismatch(&expected, probs.dims()));
        }
        // index_add would apply a repeated row twice.
        let mut sorted = ids.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(AdaptError::InvalidInput(format!(
                "example id {} repeated in one update",
                pair[0]
            )));
        }
        let probs = probs.to_dtype(DType::F64)?.detach();

        let old_raw = self.raw_rows(ids)?;
        let new_raw = (old_raw.affine(momentum, 0.0)? + probs.affine(1.0 - momentum, 0.0)?)?;
        self.raw = self.raw.index_add(ids, &(&new_raw - &old_raw)?, 0)?;

        let old_norm = self.normalized.index_select(ids, 0)?;
        let new_norm = l1_normalize(&new_raw)?;
        self.normalized = self
            .normalized
            .index_add(ids, &(new_norm - old_norm)?, 0)?;
        Ok(())
    }

    /// Refresh the store for `domain_idx` and every later domain.
    ///
    /// The momentum is estimated on `domain_idx` and applied to every domain
    /// `>= domain_idx`; earlier domains are left untouched. It is forced to 0
    /// for the first domain this store is refreshed for (and for later
    /// refreshes of that same domain), whatever keys `loaders` holds.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] if `domain_idx` has no loader or no
    /// data, [`AdaptError::ShapeMismatch`] if the model's class count differs
    /// from the store width, or any forward-pass error.
    pub fn update<M, L>(
        &mut self,
        model: &M,
        loaders: &BTreeMap<usize, L>,
        domain_idx: usize,
        estimator: &MomentumEstimator,
    ) -> Result<MomentumEstimate>
    where
        M: AdaptModel,
        L: DataLoader,
    {
        let loader = loaders.get(&domain_idx).ok_or_else(|| {
            AdaptError::InvalidInput(format!("no loader for domain {domain_idx}"))
        })?;
        let first_domain = self.first_domain.map_or(true, |d| d == domain_idx);

        let mut batches = Vec::new();
        for batch in loader.batches() {
            let batch = batch?;
            let probs = self.predict(model, &batch.inputs)?;
            let ensemble = self.normalized_rows(&batch.ids)?;
            batches.push((batch.ids, probs, ensemble));
        }
        if batches.is_empty() {
            return Err(AdaptError::InvalidInput(format!(
                "domain {domain_idx} has no examples"
            )));
        }

        let current = Tensor::cat(&batches.iter().map(|b| &b.1).collect::<Vec<_>>(), 0)?;
        let ensemble = Tensor::cat(&batches.iter().map(|b| &b.2).collect::<Vec<_>>(), 0)?;
        let estimate = estimator.estimate(domain_idx, first_domain, &current, &ensemble)?;
        tracing::info!(
            "Domain Index: {} Ensemble Entropy: {:.3} Current Entropy: {:.3} Momentum: {:.3}",
            domain_idx,
            estimate.ensemble_entropy,
            estimate.current_entropy,
            estimate.momentum
        );

        for (ids, probs, _) in &batches {
            self.blend(ids, probs, estimate.momentum)?;
        }

        for (&domain, loader) in loaders.range(domain_idx + 1..) {
            tracing::debug!("blending domain {} with momentum {:.3}", domain, estimate.momentum);
            for batch in loader.batches() {
                let batch = batch?;
                let probs = self.predict(model, &batch.inputs)?;
                self.blend(&batch.ids, &probs, estimate.momentum)?;
            }
        }

        self.first_domain.get_or_insert(domain_idx);
        Ok(estimate)
    }

    fn predict<M: AdaptModel>(&self, model: &M, inputs: &Tensor) -> Result<Tensor> {
        let logits = model.forward(inputs)?.detach();
        let (rows, classes) = logits.dims2()?;
        if classes != self.num_classes {
            return Err(AdaptError::shape_mismatch(
                &[rows, self.num_classes],
                &[rows, classes],
            ));
        }
        Ok(candle_nn::ops::softmax(&logits, 1)?.to_dtype(DType::F64)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryLoader;
    use candle_nn::VarMap;

    fn tensor(rows: Vec<Vec<f64>>) -> Tensor {
        let (r, c) = (rows.len(), rows[0].len());
        Tensor::from_vec(rows.concat(), (r, c), &Device::Cpu).unwrap()
    }

    fn ids(values: &[u32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn row_sums(t: &Tensor) -> Vec<f64> {
        t.sum(1).unwrap().to_vec1::<f64>().unwrap()
    }

    #[test]
    fn test_l1_normalize_rows_sum_to_one() {
        let z = l1_normalize(&tensor(vec![vec![1.0, 3.0], vec![0.2, 0.2]])).unwrap();
        assert_eq!(z.to_vec2::<f64>().unwrap(), vec![vec![0.25, 0.75], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_l1_normalize_is_idempotent() {
        let once = l1_normalize(&tensor(vec![vec![0.3, 0.9, 0.1], vec![2.0, 1.0, 1.0]])).unwrap();
        let twice = l1_normalize(&once).unwrap();
        let a = once.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        let b = twice.flatten_all().unwrap().to_vec1::<f64>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_rows_stay_zero() {
        let store = PseudoLabelStore::zeros(3, 2, &Device::Cpu).unwrap();
        assert_eq!(row_sums(store.normalized()), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_blend_full_replacement() {
        let mut store = PseudoLabelStore::from_raw(tensor(vec![vec![0.5, 0.5]; 3])).unwrap();
        store
            .blend(&ids(&[2, 0]), &tensor(vec![vec![0.9, 0.1], vec![0.2, 0.8]]), 0.0)
            .unwrap();

        let raw = store.raw().to_vec2::<f64>().unwrap();
        assert!((raw[0][1] - 0.8).abs() < 1e-12);
        assert_eq!(raw[1], vec![0.5, 0.5]);
        assert!((raw[2][0] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_blend_keeps_history_with_momentum() {
        let mut store = PseudoLabelStore::from_raw(tensor(vec![vec![1.0, 0.0]])).unwrap();
        store.blend(&ids(&[0]), &tensor(vec![vec![0.0, 1.0]]), 0.75).unwrap();
        let raw = store.raw().to_vec2::<f64>().unwrap();
        assert!((raw[0][0] - 0.75).abs() < 1e-12);
        assert!((raw[0][1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_normalized_rows_sum_to_one_after_blend() {
        let mut store = PseudoLabelStore::zeros(4, 3, &Device::Cpu).unwrap();
        store
            .blend(
                &ids(&[0, 1, 2, 3]),
                &tensor(vec![
                    vec![0.2, 0.3, 0.5],
                    vec![0.6, 0.3, 0.1],
                    vec![1.0, 0.0, 0.0],
                    vec![0.1, 0.1, 0.8],
                ]),
                0.0,
            )
            .unwrap();
        store
            .blend(&ids(&[1, 3]), &tensor(vec![vec![0.0, 0.0, 1.0]; 2]), 0.3)
            .unwrap();
        for sum in row_sums(store.normalized()) {
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_blend_shape_mismatch() {
        let mut store = PseudoLabelStore::zeros(2, 2, &Device::Cpu).unwrap();
        let err = store
            .blend(&ids(&[0]), &tensor(vec![vec![0.2, 0.3, 0.5]]), 0.0)
            .unwrap_err();
        assert!(matches!(err, AdaptError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_repeated_id_rejected_by_blend() {
        let mut store = PseudoLabelStore::zeros(3, 2, &Device::Cpu).unwrap();
        let err = store
            .blend(&ids(&[1, 0, 1]), &tensor(vec![vec![0.5, 0.5]; 3]), 0.0)
            .unwrap_err();
        assert!(matches!(err, AdaptError::InvalidInput(_)));
        assert_eq!(row_sums(store.raw()), vec![0.0, 0.0, 0.0]);
    }

    /// Emits fixed logits of a given width for every input row.
    struct FixedModel {
        logits: Vec<f32>,
        vars: VarMap,
    }

    impl FixedModel {
        fn new(logits: Vec<f32>) -> Self {
            Self {
                logits,
                vars: VarMap::new(),
            }
        }
    }

    impl AdaptModel for FixedModel {
        fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
            let rows = inputs.dims()[0];
            let width = self.logits.len();
            let row = Tensor::from_slice(self.logits.as_slice(), (1, width), inputs.device())?;
            Ok(row.broadcast_as((rows, width))?.contiguous()?)
        }

        fn vars(&self) -> &VarMap {
            &self.vars
        }

        fn num_classes(&self) -> usize {
            self.logits.len()
        }

        fn deep_clone(&self) -> Result<Self> {
            Ok(Self::new(self.logits.clone()))
        }
    }

    fn loader(first_id: u32, len: usize) -> InMemoryLoader {
        let inputs = Tensor::zeros((len, 1), DType::F32, &Device::Cpu).unwrap();
        let ids = (first_id..first_id + len as u32).collect();
        InMemoryLoader::new(ids, inputs, None, 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_first_refresh_ignores_earlier_loader_keys() {
        let loaders = BTreeMap::from([(0usize, loader(0, 2)), (1, loader(2, 2)), (2, loader(4, 2))]);
        let mut store = PseudoLabelStore::zeros(6, 2, &Device::Cpu).unwrap();
        let model = FixedModel::new(vec![1.0, 0.0]);
        let steep = MomentumEstimator::new(10.0);

        let estimate = store.update(&model, &loaders, 1, &steep).unwrap();
        assert_eq!(estimate.momentum, 0.0);
        assert_eq!(store.first_domain(), Some(1));

        let z = store.normalized().to_vec2::<f64>().unwrap();
        assert_eq!(z[0], vec![0.0, 0.0]);
        for row in &z[2..] {
            assert!((row[0] + row[1] - 1.0).abs() < 1e-6);
            assert!(row[0] > row[1]);
        }

        // Refreshing the same domain again keeps the first-domain rule.
        let again = store.update(&model, &loaders, 1, &steep).unwrap();
        assert_eq!(again.momentum, 0.0);
    }

    #[test]
    fn test_later_domain_uses_entropy_momentum() {
        let loaders = BTreeMap::from([(1usize, loader(0, 2)), (2, loader(2, 2))]);
        let mut store = PseudoLabelStore::zeros(4, 2, &Device::Cpu).unwrap();
        let model = FixedModel::new(vec![0.0, 0.0]);
        let estimator = MomentumEstimator::new(0.0);

        store.update(&model, &loaders, 1, &estimator).unwrap();
        let estimate = store.update(&model, &loaders, 2, &estimator).unwrap();
        assert!((estimate.momentum - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_class_count_mismatch_detected_on_update() {
        let loaders = BTreeMap::from([(1usize, loader(0, 2))]);
        let mut store = PseudoLabelStore::zeros(2, 2, &Device::Cpu).unwrap();
        let model = FixedModel::new(vec![0.1, 0.2, 0.3]);

        let err = store
            .update(&model, &loaders, 1, &MomentumEstimator::new(1.0))
            .unwrap_err();
        assert!(matches!(err, AdaptError::ShapeMismatch { .. }));
        assert_eq!(store.first_domain(), None);
        assert_eq!(row_sums(store.raw()), vec![0.0, 0.0]);
    }

    #[test]
    fn test_out_of_range_id_rejected() {
        let store = PseudoLabelStore::zeros(2, 2, &Device::Cpu).unwrap();
        assert!(matches!(
            store.raw_rows(&ids(&[2])),
            Err(AdaptError::InvalidInput(_))
        ));
    }
}
