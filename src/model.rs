//! Trainable classifiers.
//!
//! [`AdaptModel`] is the seam between the adaptation loop and a network: a
//! forward pass producing per-class scores, the [`VarMap`] holding every
//! trainable parameter (for the optimizer), and a deep clone that shares no
//! storage with the original.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, Result};

/// A classifier the adaptation loop can train and duplicate.
pub trait AdaptModel: Sized {
    /// Map a batch of inputs to `(batch, num_classes)` logits.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, inputs: &Tensor) -> Result<Tensor>;

    /// All trainable parameters.
    fn vars(&self) -> &VarMap;

    /// Width of the logits.
    fn num_classes(&self) -> usize;

    /// Copy of the model whose parameters live in fresh storage.
    ///
    /// # Errors
    ///
    /// Returns an error if parameters cannot be copied.
    fn deep_clone(&self) -> Result<Self>;
}

/// Copy every variable of `vars` into a new, independent [`VarMap`].
///
/// # Errors
///
/// Returns an error if the map lock is poisoned or a copy fails.
pub fn deep_copy_varmap(vars: &VarMap) -> Result<VarMap> {
    let copied = VarMap::new();
    {
        let source = vars
            .data()
            .lock()
            .map_err(|e| AdaptError::Training(format!("VarMap lock poisoned: {e}")))?;
        let mut target = copied
            .data()
            .lock()
            .map_err(|e| AdaptError::Training(format!("VarMap lock poisoned: {e}")))?;
        for (name, var) in source.iter() {
            let fresh = Var::from_tensor(&var.as_tensor().copy()?)?;
            target.insert(name.clone(), fresh);
        }
    }
    Ok(copied)
}

/// Shape of an [`MlpClassifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Input feature count.
    pub input_dim: usize,
    /// Hidden layer widths; empty for a linear classifier.
    pub hidden_dims: Vec<usize>,
    /// Number of classes.
    pub num_classes: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            input_dim: 2,
            hidden_dims: vec![32, 32],
            num_classes: 2,
        }
    }
}

/// Fully connected ReLU classifier.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use gradual_ensemble_rs::model::{AdaptModel, MlpClassifier, MlpConfig};
///
/// # fn main() -> gradual_ensemble_rs::Result<()> {
/// let model = MlpClassifier::new(&MlpConfig::default(), &Device::Cpu)?;
/// let logits = model.forward(&Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?)?;
/// assert_eq!(logits.dims(), &[4, 2]);
/// # Ok(())
/// # }
/// ```
pub struct MlpClassifier {
    layers: Vec<Linear>,
    var_map: VarMap,
    config: MlpConfig,
    device: Device,
}

impl MlpClassifier {
    /// Create a randomly initialized classifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration has a zero-sized layer or
    /// parameter allocation fails.
    pub fn new(config: &MlpConfig, device: &Device) -> Result<Self> {
        Self::from_varmap(config, VarMap::new(), device)
    }

    /// Build the layers from `var_map`, reusing any variable already in it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration has a zero-sized layer or a stored
    /// variable has the wrong shape.
    pub fn from_varmap(config: &MlpConfig, var_map: VarMap, device: &Device) -> Result<Self> {
        if config.input_dim == 0 || config.num_classes == 0 || config.hidden_dims.contains(&0) {
            return Err(AdaptError::Config(format!(
                "MLP layers must be non-empty: {config:?}"
            )));
        }
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut widths = Vec::with_capacity(config.hidden_dims.len() + 2);
        widths.push(config.input_dim);
        widths.extend_from_slice(&config.hidden_dims);
        widths.push(config.num_classes);

        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::linear(w[0], w[1], vb.pp(format!("fc{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            var_map,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Layer configuration.
    #[must_use]
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Number of scalar parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl AdaptModel for MlpClassifier {
    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = inputs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            if i != last {
                x = x.relu()?;
            }
        }
        Ok(x)
    }

    fn vars(&self) -> &VarMap {
        &self.var_map
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn deep_clone(&self) -> Result<Self> {
        let var_map = deep_copy_varmap(&self.var_map)?;
        Self::from_varmap(&self.config, var_map, &self.device)
    }
}
