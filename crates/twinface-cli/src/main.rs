use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use twinface_core::{
    checkpoint, EmbeddingSpec, InferenceModel, PairSource, Trainer, TwinNetwork,
    VerificationEngine,
};
use twinface_data::{verify_directory, Preprocessor};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "twinface", about = "One-shot face verification with a twin network")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on the anchor/positive/negative folders
    Train {
        /// Continue from a checkpoint written during an earlier run
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Report loss, precision and recall on the test split
    Evaluate {
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Verify a probe image against a folder of reference images
    Verify {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        probe: PathBuf,
        #[arg(long)]
        references: PathBuf,
    },
    /// Print a checkpoint's header
    Inspect {
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Train { resume } => train(&config, resume.as_deref()),
        Commands::Evaluate { checkpoint } => evaluate(&config, &checkpoint),
        Commands::Verify {
            checkpoint,
            probe,
            references,
        } => verify(&config, &checkpoint, &probe, &references),
        Commands::Inspect { checkpoint } => inspect(&checkpoint),
    }
}

fn train(config: &Config, resume: Option<&Path>) -> Result<()> {
    let mut trainer = match resume {
        Some(path) => {
            let saved = checkpoint::load(path)
                .with_context(|| format!("loading checkpoint {}", path.display()))?;
            Trainer::resume(saved, config.training.clone())?
        }
        None => {
            let network = TwinNetwork::new(EmbeddingSpec::default(), config.training.seed)?;
            Trainer::new(network, config.training.clone())?
        }
    };

    let preprocessor = Preprocessor::for_spec(trainer.network().spec())?;
    let (mut train_set, mut test_set) = config
        .dataset
        .load_splits(preprocessor)
        .context("building dataset")?;

    let reports = trainer.fit(&mut train_set)?;
    let last = trainer.epochs_completed();
    let final_checkpoint = match reports.last().and_then(|r| r.checkpoint.clone()) {
        Some(path) => path,
        None => trainer.save_checkpoint(last)?,
    };

    tracing::info!(
        epochs = last,
        steps = trainer.steps(),
        checkpoint = %final_checkpoint.display(),
        "training finished"
    );

    let evaluation = trainer.evaluate(test_set.batches(config.training.batch_size))?;
    let summary = serde_json::json!({
        "epochs": reports,
        "test": evaluation,
        "checkpoint": final_checkpoint,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn evaluate(config: &Config, checkpoint: &Path) -> Result<()> {
    let (model, header) = InferenceModel::from_checkpoint(checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let preprocessor = Preprocessor::for_spec(model.spec())?;
    let (_, mut test_set) = config
        .dataset
        .load_splits(preprocessor)
        .context("building dataset")?;

    let report = model.evaluate(test_set.batches(config.training.batch_size))?;
    let summary = serde_json::json!({
        "checkpoint_epoch": header.epoch,
        "run_id": header.run_id,
        "test": report,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn verify(config: &Config, checkpoint: &Path, probe: &Path, references: &Path) -> Result<()> {
    let (model, _) = InferenceModel::from_checkpoint(checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let preprocessor = Preprocessor::for_spec(model.spec())?;
    let engine = VerificationEngine::new(&model, config.verification);

    let result = verify_directory(&engine, &preprocessor, probe, references)
        .with_context(|| format!("verifying {} against {}", probe.display(), references.display()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn inspect(checkpoint: &Path) -> Result<()> {
    let header = checkpoint::read_header(checkpoint)
        .with_context(|| format!("reading checkpoint {}", checkpoint.display()))?;
    let summary = serde_json::json!({
        "format_version": header.format_version,
        "model_version": header.model_version,
        "epoch": header.epoch,
        "run_id": header.run_id,
        "created_at": header.created_at,
        "architecture": header.architecture,
        "parameters": header.parameter_count()?,
        "tensors": header.tensor_count()?,
        "optimizer_step": header.optimizer.as_ref().map(|o| o.step),
        "weights_sha256": header.weights_sha256,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
