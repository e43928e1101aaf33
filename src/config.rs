//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, Result};

/// Run configuration for gradual adaptation.
///
/// # Example
///
/// ```rust
/// use gradual_ensemble_rs::AdaptConfig;
///
/// let config = AdaptConfig {
///     adapt_epochs: 5,
///     confidence_q_list: vec![0.1, 0.5],
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptConfig {
    /// Learning rate of the per-run Adam optimizer.
    #[serde(default = "default_adapt_lr")]
    pub adapt_lr: f64,

    /// Number of epochs per adaptation run.
    #[serde(default = "default_adapt_epochs")]
    pub adapt_epochs: usize,

    /// Method name, used in run names.
    #[serde(default = "default_method")]
    pub method: String,

    /// Dataset name, used in the metrics directory layout.
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Root directory for per-run metrics.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub random_seed: u64,

    /// Slope mapping the entropy gap to a momentum coefficient.
    #[serde(default = "default_slope")]
    pub slope: f64,

    /// Confidence quantiles explored by the sweep.
    #[serde(default = "default_confidence_q_list")]
    pub confidence_q_list: Vec<f64>,

    /// Batch size used by loaders built from this config.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// What to do when a batch selects no confident example.
    #[serde(default)]
    pub empty_mask: EmptyMaskPolicy,

    /// When the pseudo-label store is refreshed relative to the sweep.
    #[serde(default)]
    pub store_refresh: StoreRefresh,

    /// Adam beta1.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Adam beta2.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Adam epsilon.
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_adapt_lr() -> f64 {
    1e-3
}
fn default_adapt_epochs() -> usize {
    10
}
fn default_method() -> String {
    "uagde".into()
}
fn default_dataset() -> String {
    "rotating-gaussians".into()
}
fn default_log_dir() -> String {
    "./logs".into()
}
fn default_seed() -> u64 {
    42
}
fn default_slope() -> f64 {
    1.0
}
fn default_confidence_q_list() -> Vec<f64> {
    vec![0.1]
}
fn default_batch_size() -> usize {
    128
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            adapt_lr: default_adapt_lr(),
            adapt_epochs: default_adapt_epochs(),
            method: default_method(),
            dataset: default_dataset(),
            log_dir: default_log_dir(),
            random_seed: default_seed(),
            slope: default_slope(),
            confidence_q_list: default_confidence_q_list(),
            batch_size: default_batch_size(),
            empty_mask: EmptyMaskPolicy::Skip,
            store_refresh: StoreRefresh::Once,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
        }
    }
}

/// Handling of batches whose confidence mask selects nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyMaskPolicy {
    /// Skip the gradient step and give the batch zero weight.
    #[default]
    Skip,
    /// Abort the run with [`AdaptError::EmptyMask`].
    Fail,
}

/// When the pseudo-label store is refreshed during [`adapt`](crate::GradualEnsemble::adapt).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRefresh {
    /// Once per domain, before the sweep.
    #[default]
    Once,
    /// At the start of every sweep iteration.
    PerSweep,
}

impl AdaptConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Small, fast configuration for the synthetic demo.
    #[must_use]
    pub fn demo_preset() -> Self {
        Self {
            adapt_lr: 1e-2,
            adapt_epochs: 5,
            confidence_q_list: vec![0.0, 0.2, 0.5],
            batch_size: 64,
            log_dir: "./logs/demo".into(),
            ..Default::default()
        }
    }

    /// Name of the run for one sweep value: `{method}_{slope}_{confidence_q}_{seed}`.
    #[must_use]
    pub fn run_name(&self, confidence_q: f64) -> String {
        format!(
            "{}_{}_{}_{}",
            self.method, self.slope, confidence_q, self.random_seed
        )
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(self.adapt_lr.is_finite() && self.adapt_lr > 0.0) {
            return Err(AdaptError::Config(format!(
                "adapt_lr must be positive, got {}",
                self.adapt_lr
            )));
        }
        if self.adapt_epochs == 0 {
            return Err(AdaptError::Config("adapt_epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(AdaptError::Config("batch_size must be > 0".into()));
        }
        if !self.slope.is_finite() {
            return Err(AdaptError::Config("slope must be finite".into()));
        }
        if self.confidence_q_list.is_empty() {
            return Err(AdaptError::Config(
                "confidence_q_list must not be empty".into(),
            ));
        }
        if let Some(q) = self
            .confidence_q_list
            .iter()
            .find(|q| !(0.0..=1.0).contains(*q))
        {
            return Err(AdaptError::Config(format!(
                "confidence quantile {q} outside [0, 1]"
            )));
        }
        if self.method.is_empty() || self.dataset.is_empty() {
            return Err(AdaptError::Config(
                "method and dataset names must be set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        assert!(AdaptConfig::default().validate().is_ok());
        assert!(AdaptConfig::demo_preset().validate().is_ok());
    }

    #[test]
    fn test_run_name_format() {
        let config = AdaptConfig {
            method: "uagde".into(),
            slope: 2.0,
            random_seed: 7,
            ..Default::default()
        };
        assert_eq!(config.run_name(0.5), "uagde_2_0.5_7");
    }

    #[test]
    fn test_validation_rejects_bad_quantile() {
        let config = AdaptConfig {
            confidence_q_list: vec![0.2, 1.5],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn test_validation_rejects_zero_epochs() {
        let config = AdaptConfig {
            adapt_epochs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AdaptError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_empty_sweep() {
        let config = AdaptConfig {
            confidence_q_list: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "adapt_epochs: 3\nempty_mask: fail\nstore_refresh: per_sweep\n";
        let config: AdaptConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.adapt_epochs, 3);
        assert_eq!(config.empty_mask, EmptyMaskPolicy::Fail);
        assert_eq!(config.store_refresh, StoreRefresh::PerSweep);
        assert_eq!(config.batch_size, default_batch_size());
    }

    #[test]
    fn test_save_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adapt.yaml");
        let config = AdaptConfig::demo_preset();
        config.to_file(&path).unwrap();

        let loaded = AdaptConfig::from_file(&path).unwrap();
        assert_eq!(loaded.confidence_q_list, config.confidence_q_list);
        assert_eq!(loaded.adapt_epochs, config.adapt_epochs);
        assert_eq!(loaded.log_dir, config.log_dir);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = AdaptConfig::from_file("/nonexistent/adapt.yaml");
        assert!(matches!(result, Err(AdaptError::Io(_))));
    }
}
