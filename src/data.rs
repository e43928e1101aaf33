//! Batched access to domain data.
//!
//! Every example carries a dense, zero-based `u32` id that is stable across all
//! domains. The id is the row of the example in the
//! [`PseudoLabelStore`](crate::store::PseudoLabelStore); loaders never reorder or
//! renumber them.
//!
//! - [`Batch`] - ids, inputs and optional ground truth for one step
//! - [`DataLoader`] - lazy, restartable source of batches
//! - [`InMemoryLoader`] - fixed-order loader over tensors held in memory

use candle_core::{Device, Tensor};

use crate::error::{AdaptError, Result};

/// One batch of a domain.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Example ids, `u32` of shape `(batch,)`.
    pub ids: Tensor,
    /// Model inputs, first dimension is the batch.
    pub inputs: Tensor,
    /// Ground-truth class ids, `u32` of shape `(batch,)`, when known.
    pub labels: Option<Tensor>,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.elem_count()
    }

    /// Whether the batch holds no example.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of batches for one domain.
///
/// `batches` may be called any number of times; each call restarts from the
/// first batch and yields the same ids in the same order.
pub trait DataLoader {
    /// Iterate over the batches of the domain.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;

    /// Total number of examples across all batches.
    fn num_examples(&self) -> usize;

    /// Whether the loader yields nothing.
    fn is_empty(&self) -> bool {
        self.num_examples() == 0
    }
}

/// Loader over tensors already held in memory.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use gradual_ensemble_rs::data::{DataLoader, InMemoryLoader};
///
/// # fn main() -> gradual_ensemble_rs::Result<()> {
/// let device = Device::Cpu;
/// let inputs = Tensor::zeros((5, 2), candle_core::DType::F32, &device)?;
/// let loader = InMemoryLoader::new(vec![0, 1, 2, 3, 4], inputs, None, 2, &device)?;
/// assert_eq!(loader.batches().count(), 3);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryLoader {
    ids: Vec<u32>,
    inputs: Tensor,
    labels: Option<Tensor>,
    batch_size: usize,
    device: Device,
}

impl InMemoryLoader {
    /// Create a loader.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] if `batch_size` is zero or the
    /// leading dimensions of `inputs` / `labels` disagree with `ids`.
    pub fn new(
        ids: Vec<u32>,
        inputs: Tensor,
        labels: Option<Tensor>,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(AdaptError::InvalidInput("batch_size must be > 0".into()));
        }
        let rows = inputs.dims().first().copied().unwrap_or(0);
        if rows != ids.len() {
            return Err(AdaptError::InvalidInput(format!(
                "{} ids for {rows} input rows",
                ids.len()
            )));
        }
        if let Some(labels) = &labels {
            if labels.elem_count() != ids.len() {
                return Err(AdaptError::InvalidInput(format!(
                    "{} ids for {} labels",
                    ids.len(),
                    labels.elem_count()
                )));
            }
        }

        Ok(Self {
            ids,
            inputs,
            labels,
            batch_size,
            device: device.clone(),
        })
    }

    /// Drop the ground truth, as for an unlabeled target domain.
    #[must_use]
    pub fn without_labels(mut self) -> Self {
        self.labels = None;
        self
    }

    /// Example ids in iteration order.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    fn batch_at(&self, start: usize) -> Result<Batch> {
        let len = self.batch_size.min(self.ids.len() - start);
        let ids = Tensor::from_slice(&self.ids[start..start + len], len, &self.device)?;
        let inputs = self.inputs.narrow(0, start, len)?.to_device(&self.device)?;
        let labels = match &self.labels {
            Some(labels) => Some(labels.narrow(0, start, len)?.to_device(&self.device)?),
            None => None,
        };
        Ok(Batch {
            ids,
            inputs,
            labels,
        })
    }
}

impl DataLoader for InMemoryLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(
            (0..self.ids.len())
                .step_by(self.batch_size)
                .map(move |start| self.batch_at(start)),
        )
    }

    fn num_examples(&self) -> usize {
        self.ids.len()
    }
}
