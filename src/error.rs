//! Error types for gradual-ensemble-rs.
//!
//! # Example
//!
//! ```rust
//! use gradual_ensemble_rs::{AdaptConfig, AdaptError};
//!
//! # fn main() {
//! let config = AdaptConfig {
//!     adapt_epochs: 0,
//!     ..Default::default()
//! };
//! match config.validate() {
//!     Ok(()) => println!("valid"),
//!     Err(AdaptError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for gradual-ensemble-rs operations.
pub type Result<T> = std::result::Result<T, AdaptError>;

/// Errors that can occur while adapting across domains.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdaptError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Input that cannot be processed (empty loader, quantile out of range, bad id).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Model output width does not match the pseudo-label store.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// No example in a batch passed the confidence mask.
    #[error("confidence mask selected no examples in batch {batch}")]
    EmptyMask {
        /// Zero-based batch position within the epoch.
        batch: usize,
    },

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Progress bar template error.
    #[error("progress bar template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for AdaptError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}

impl AdaptError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = AdaptError::Config("slope must be finite".to_string());
        assert_eq!(error.to_string(), "configuration error: slope must be finite");
    }

    #[test]
    fn test_invalid_input_display() {
        let error = AdaptError::InvalidInput("empty loader".to_string());
        assert_eq!(error.to_string(), "invalid input: empty loader");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = AdaptError::shape_mismatch(&[4, 2], &[4, 3]);
        assert_eq!(
            error.to_string(),
            "shape mismatch: expected [4, 2], got [4, 3]"
        );
    }

    #[test]
    fn test_empty_mask_display() {
        let error = AdaptError::EmptyMask { batch: 3 };
        assert!(error.to_string().contains("batch 3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: AdaptError = io_error.into();
        assert!(matches!(error, AdaptError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: AdaptError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: AdaptError = json_error.into();
        assert!(matches!(error, AdaptError::Json(_)));
        assert!(error.to_string().contains("serialization error"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: AdaptError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        if let Err(err) = ProgressStyle::default_bar().template("{unknown_key}") {
            let error: AdaptError = err.into();
            assert!(error.to_string().contains("template error"));
        }
    }
}
