//! CLI entry point for gradual-ensemble-rs.

use std::collections::BTreeMap;

use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gradual_ensemble_rs::metrics::JsonlSink;
use gradual_ensemble_rs::optimizer::OptimizerConfig;
use gradual_ensemble_rs::oracle::oracle_eval;
use gradual_ensemble_rs::synthetic::{rotating_gaussians, SyntheticConfig};
use gradual_ensemble_rs::trainer::fit_source;
use gradual_ensemble_rs::{
    AdaptConfig, AdaptModel, GradualEnsemble, MlpClassifier, MlpConfig, PseudoLabelStore, Result,
};

/// Supervised epochs on the source domain before adaptation starts.
const SOURCE_EPOCHS: usize = 40;

#[derive(Parser)]
#[command(name = "gradual-ensemble")]
#[command(about = "Gradual domain adaptation with a pseudo-label ensemble")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "adapt.yaml")]
        output: String,
    },
    /// Adapt across synthetic rotating Gaussians
    Demo {
        /// Path to configuration file (demo preset when omitted)
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = AdaptConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Method: {}", config.method);
            println!("  Dataset: {}", config.dataset);
            println!("  Confidence quantiles: {:?}", config.confidence_q_list);
        }
        Commands::Init { output } => {
            tracing::info!("Generating demo configuration");
            AdaptConfig::demo_preset().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Demo { config } => {
            let config = match config {
                Some(path) => AdaptConfig::from_file(path)?,
                None => AdaptConfig::demo_preset(),
            };
            config.validate()?;
            run_demo(&config)?;
        }
    }

    Ok(())
}

fn select_device() -> Device {
    let force_cpu = std::env::var("GRADUAL_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(0) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Device: CUDA (device 0)");
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU.");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU.");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::warn!("CPU mode forced via GRADUAL_FORCE_CPU=1.");
        } else {
            tracing::warn!("CUDA feature disabled; running on CPU. Enable with --features cuda.");
        }
        Device::Cpu
    }
}

fn run_demo(config: &AdaptConfig) -> Result<()> {
    let device = select_device();
    let data_config = SyntheticConfig {
        seed: config.random_seed,
        ..Default::default()
    };
    let domains = rotating_gaussians(&data_config, &device)?;
    let total: usize = domains.iter().map(|d| d.ids.len()).sum();

    let (source, targets) = domains
        .split_first()
        .ok_or_else(|| gradual_ensemble_rs::AdaptError::Config("no domains generated".into()))?;

    let model = MlpClassifier::new(&MlpConfig::default(), &device)?;
    tracing::info!(
        "Pre-training {} parameters on the source domain for {} epochs",
        model.num_parameters(),
        SOURCE_EPOCHS
    );
    let source_loader = source.loader(config.batch_size, &device)?;
    let mut optimizer = OptimizerConfig::from(config).build_adam(model.vars())?;
    let history = fit_source(&model, &source_loader, SOURCE_EPOCHS, &mut optimizer)?;
    if let Some(loss) = history.last() {
        println!("Source loss after pre-training: {loss:.4}");
    }

    let mut loaders = BTreeMap::new();
    for domain in targets {
        loaders.insert(domain.index, domain.loader(config.batch_size, &device)?);
    }

    let store = PseudoLabelStore::zeros(total, model.num_classes(), &device)?;
    let mut ensemble = GradualEnsemble::new(model, store, config.slope);
    let mut sink = JsonlSink::new(&config.log_dir);

    let pb = ProgressBar::new(loaders.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}/{len:3} {msg}")?
            .progress_chars("#>-"),
    );

    for (&domain, loader) in &loaders {
        pb.set_message(format!("domain {domain}"));
        let summary = ensemble.adapt(
            domain,
            &loaders,
            &config.confidence_q_list,
            config,
            &mut sink,
            None,
        )?;
        let score = ensemble.target_validate(loader)?;
        let report = oracle_eval(ensemble.model(), ensemble.store(), loader)?;

        let angle = targets
            .iter()
            .find(|d| d.index == domain)
            .map_or(0.0, |d| d.angle_deg);
        let accuracy = report.map_or(f64::NAN, |r| r.accuracy);
        pb.println(format!(
            "Domain {domain} ({angle:.0}°): momentum {:.3}, q {}, score {score:.4}, accuracy {accuracy:.4}",
            summary.momentum.momentum,
            summary.best().confidence_q,
        ));
        pb.inc(1);
    }
    pb.finish_with_message("done");

    println!("✓ Metrics written under: {}", config.log_dir);
    Ok(())
}
