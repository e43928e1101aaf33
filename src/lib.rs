//! # gradual-ensemble-rs
//!
//! Gradual domain adaptation by self-training against an uncertainty-aware,
//! momentum-smoothed ensemble of pseudo-labels.
//!
//! A model trained on a labelled source domain is carried through a sequence
//! of unlabelled target domains, each a small shift from the previous one. For
//! every domain the crate:
//!
//! - **Refreshes the ensemble** - per-example class probabilities are blended
//!   into a persistent store with a momentum derived from the entropy gap
//!   between the current model and the store.
//! - **Thresholds by confidence** - a quantile of the ensemble's per-example
//!   confidence spread decides which pseudo-labels are trusted.
//! - **Sweeps and selects** - one copy of the model is trained per confidence
//!   quantile and the copy with the best unsupervised score is kept.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a demo configuration
//! gradual-ensemble init adapt.yaml
//!
//! # Validate it
//! gradual-ensemble validate adapt.yaml
//!
//! # Adapt across synthetic rotating Gaussians
//! gradual-ensemble demo --config adapt.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use candle_core::Device;
//! use gradual_ensemble_rs::metrics::JsonlSink;
//! use gradual_ensemble_rs::model::{MlpClassifier, MlpConfig};
//! use gradual_ensemble_rs::store::PseudoLabelStore;
//! use gradual_ensemble_rs::synthetic::{rotating_gaussians, SyntheticConfig};
//! use gradual_ensemble_rs::{AdaptConfig, GradualEnsemble};
//!
//! # fn main() -> gradual_ensemble_rs::Result<()> {
//! let device = Device::Cpu;
//! let config = AdaptConfig::demo_preset();
//! let domains = rotating_gaussians(&SyntheticConfig::default(), &device)?;
//! let total = domains.iter().map(|d| d.ids.len()).sum();
//!
//! let mut loaders = BTreeMap::new();
//! for domain in &domains[1..] {
//!     loaders.insert(domain.index, domain.loader(config.batch_size, &device)?);
//! }
//!
//! let model = MlpClassifier::new(&MlpConfig::default(), &device)?;
//! let store = PseudoLabelStore::zeros(total, 2, &device)?;
//! let mut ensemble = GradualEnsemble::new(model, store, config.slope);
//! let mut sink = JsonlSink::new(&config.log_dir);
//!
//! for (&domain, loader) in &loaders {
//!     ensemble.adapt(domain, &loaders, &config.confidence_q_list, &config, &mut sink, None)?;
//!     println!("domain {domain}: score {:.4}", ensemble.target_validate(loader)?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod metrics;
pub mod model;
pub mod momentum;
pub mod optimizer;
pub mod oracle;
pub mod scorer;
pub mod store;
pub mod synthetic;
pub mod threshold;
pub mod trainer;

pub use config::{AdaptConfig, EmptyMaskPolicy, StoreRefresh};
pub use data::{Batch, DataLoader, InMemoryLoader};
pub use ensemble::{AdaptSummary, CandidateScore, GradualEnsemble};
pub use error::{AdaptError, Result};
pub use model::{AdaptModel, MlpClassifier, MlpConfig};
pub use momentum::{MomentumEstimate, MomentumEstimator};
pub use scorer::{ImScorer, Scorer, ScorerInput};
pub use store::PseudoLabelStore;
