//! Per-domain sweep orchestration.
//!
//! [`GradualEnsemble`] owns the current model and the pseudo-label store. For
//! each new domain, [`adapt`](GradualEnsemble::adapt) refreshes the store,
//! trains one candidate per confidence quantile, and replaces the current model
//! with a deep copy of the best-scoring candidate.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::{AdaptConfig, StoreRefresh};
use crate::data::DataLoader;
use crate::error::{AdaptError, Result};
use crate::metrics::{MetricsSink, RunId};
use crate::model::AdaptModel;
use crate::momentum::{MomentumEstimate, MomentumEstimator};
use crate::scorer::{ImScorer, Scorer, ScorerInput};
use crate::store::PseudoLabelStore;
use crate::threshold::calc_alpha;
use crate::trainer::AdaptationTrainer;

/// Score of one sweep value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    /// Confidence quantile of the run.
    pub confidence_q: f64,
    /// Threshold derived from it.
    pub alpha: f64,
    /// Final train score.
    pub score: f64,
}

/// What [`GradualEnsemble::adapt`] did for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptSummary {
    /// Domain adapted to.
    pub domain: usize,
    /// Last store refresh of the call.
    pub momentum: MomentumEstimate,
    /// Every candidate, in sweep order.
    pub candidates: Vec<CandidateScore>,
    /// Position of the committed candidate in `candidates`.
    pub selected: usize,
}

impl AdaptSummary {
    /// The committed candidate.
    #[must_use]
    pub fn best(&self) -> &CandidateScore {
        &self.candidates[self.selected]
    }
}

/// Position of the strictly highest score; the first wins ties and NaN never
/// wins.
#[must_use]
pub fn select_best(scores: &[f64]) -> Option<usize> {
    let mut best_score = f64::NEG_INFINITY;
    let mut best = None;
    for (i, &score) in scores.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best = Some(i);
        }
    }
    best
}

/// Gradual domain adaptation with an uncertainty-aware pseudo-label ensemble.
///
/// # Example
///
/// ```no_run
/// use std::collections::BTreeMap;
///
/// use candle_core::Device;
/// use gradual_ensemble_rs::data::InMemoryLoader;
/// use gradual_ensemble_rs::metrics::NullSink;
/// use gradual_ensemble_rs::model::{MlpClassifier, MlpConfig};
/// use gradual_ensemble_rs::store::PseudoLabelStore;
/// use gradual_ensemble_rs::{AdaptConfig, GradualEnsemble};
///
/// # fn run(loaders: BTreeMap<usize, InMemoryLoader>, total: usize) -> gradual_ensemble_rs::Result<()> {
/// let device = Device::Cpu;
/// let config = AdaptConfig::default();
/// let model = MlpClassifier::new(&MlpConfig::default(), &device)?;
/// let store = PseudoLabelStore::zeros(total, 2, &device)?;
/// let mut ensemble = GradualEnsemble::new(model, store, config.slope);
///
/// let domains: Vec<usize> = loaders.keys().copied().collect();
/// for domain in domains {
///     let summary = ensemble.adapt(
///         domain,
///         &loaders,
///         &config.confidence_q_list,
///         &config,
///         &mut NullSink,
///         None,
///     )?;
///     println!("domain {domain}: q = {}", summary.best().confidence_q);
/// }
/// # Ok(())
/// # }
/// ```
pub struct GradualEnsemble<M: AdaptModel, S: Scorer = ImScorer> {
    model: M,
    store: PseudoLabelStore,
    estimator: MomentumEstimator,
    scorer: S,
    pl_acc_history: Vec<f64>,
}

impl<M: AdaptModel> GradualEnsemble<M, ImScorer> {
    /// Create an ensemble scored by [`ImScorer`].
    pub fn new(model: M, store: PseudoLabelStore, slope: f64) -> Self {
        Self::with_scorer(model, store, slope, ImScorer)
    }
}

impl<M: AdaptModel, S: Scorer> GradualEnsemble<M, S> {
    /// Create an ensemble with a custom scorer.
    pub fn with_scorer(model: M, store: PseudoLabelStore, slope: f64, scorer: S) -> Self {
        Self {
            model,
            store,
            estimator: MomentumEstimator::new(slope),
            scorer,
            pl_acc_history: Vec::new(),
        }
    }

    /// The current model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Take the current model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// The pseudo-label store.
    pub fn store(&self) -> &PseudoLabelStore {
        &self.store
    }

    /// Slope of the momentum map.
    pub fn slope(&self) -> f64 {
        self.estimator.slope()
    }

    /// Last pseudo-label accuracy of every run so far (labelled domains only).
    pub fn pseudo_label_accuracies(&self) -> &[f64] {
        &self.pl_acc_history
    }

    /// Refresh the store with the current model for `domain_idx` and later
    /// domains. See [`PseudoLabelStore::update`].
    ///
    /// # Errors
    ///
    /// Propagates store update errors.
    pub fn update_store<L: DataLoader>(
        &mut self,
        domain_idx: usize,
        loaders: &BTreeMap<usize, L>,
    ) -> Result<MomentumEstimate> {
        self.store
            .update(&self.model, loaders, domain_idx, &self.estimator)
    }

    /// Confidence threshold of `loader` at `confidence_q` on the current store.
    ///
    /// # Errors
    ///
    /// See [`calc_alpha`].
    pub fn calc_alpha<L: DataLoader + ?Sized>(&self, loader: &L, confidence_q: f64) -> Result<f64> {
        calc_alpha(&self.store, loader, confidence_q)
    }

    /// Adapt to `domain_idx`, sweeping over `confidence_q_list`.
    ///
    /// The store is refreshed once before the sweep, or before every sweep
    /// value under [`StoreRefresh::PerSweep`]. Each value trains an independent
    /// copy of the current model; the copy with the strictly highest score
    /// (first on ties) replaces the current model.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] for an empty sweep or a missing
    /// domain, [`AdaptError::Training`] if no candidate has a comparable
    /// score, and propagates store, threshold and training errors.
    pub fn adapt<L: DataLoader>(
        &mut self,
        domain_idx: usize,
        loaders: &BTreeMap<usize, L>,
        confidence_q_list: &[f64],
        config: &AdaptConfig,
        sink: &mut dyn MetricsSink,
        val_loader: Option<&L>,
    ) -> Result<AdaptSummary> {
        if confidence_q_list.is_empty() {
            return Err(AdaptError::InvalidInput("empty confidence_q_list".into()));
        }
        let loader = loaders.get(&domain_idx).ok_or_else(|| {
            AdaptError::InvalidInput(format!("no loader for domain {domain_idx}"))
        })?;

        let mut momentum = match config.store_refresh {
            StoreRefresh::Once => Some(self.update_store(domain_idx, loaders)?),
            StoreRefresh::PerSweep => None,
        };

        let mut models = Vec::with_capacity(confidence_q_list.len());
        let mut candidates = Vec::with_capacity(confidence_q_list.len());
        for &confidence_q in confidence_q_list {
            if config.store_refresh == StoreRefresh::PerSweep {
                momentum = Some(self.update_store(domain_idx, loaders)?);
            }
            sink.begin_run(&RunId::new(config, domain_idx, confidence_q));

            let alpha = calc_alpha(&self.store, loader, confidence_q)?;
            let trainer = AdaptationTrainer::new(&self.store, &self.scorer, config.empty_mask);
            let output = trainer.run(
                &self.model,
                loader,
                alpha,
                confidence_q,
                config,
                sink,
                val_loader,
            )?;
            if let Some(acc) = output.pseudo_label_accuracy {
                self.pl_acc_history.push(acc);
            }

            candidates.push(CandidateScore {
                confidence_q,
                alpha,
                score: output.score,
            });
            models.push(output.model);
        }

        let scores: Vec<f64> = candidates.iter().map(|c| c.score).collect();
        let selected = select_best(&scores).ok_or_else(|| {
            AdaptError::Training(format!(
                "no candidate for domain {domain_idx} produced a comparable score: {scores:?}"
            ))
        })?;
        self.model = models[selected].deep_clone()?;

        let momentum = momentum
            .ok_or_else(|| AdaptError::Training("store was never refreshed".into()))?;
        let best = candidates[selected];
        tracing::info!(
            "Domain {}: selected confidence q {} (alpha {:.4}, score {:.4}) from {} candidates",
            domain_idx,
            best.confidence_q,
            best.alpha,
            best.score,
            candidates.len()
        );

        Ok(AdaptSummary {
            domain: domain_idx,
            momentum,
            candidates,
            selected,
        })
    }

    /// Unsupervised score of the current model on `loader`.
    ///
    /// # Errors
    ///
    /// Returns [`AdaptError::InvalidInput`] for an empty loader, or any forward
    /// or scoring error.
    pub fn target_validate<L: DataLoader + ?Sized>(&self, loader: &L) -> Result<f64> {
        let mut all_logits = Vec::new();
        for batch in loader.batches() {
            let batch = batch?;
            all_logits.push(self.model.forward(&batch.inputs)?.detach());
        }
        if all_logits.is_empty() {
            return Err(AdaptError::InvalidInput(
                "cannot validate on an empty loader".into(),
            ));
        }
        let logits = Tensor::cat(&all_logits, 0)?;
        self.scorer.score(&ScorerInput::from_logits(logits))
    }
}
