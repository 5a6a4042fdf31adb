//! Training loop: batched forward pass, loss, gradients, Adam update,
//! per-epoch metrics and periodic checkpointing.

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::embedding::NetworkError;
use crate::inference::InferenceModel;
use crate::loss::binary_cross_entropy;
use crate::metrics::BinaryMetrics;
use crate::optimizer::{Adam, AdamConfig};
use crate::source::PairSource;
use crate::tape::Gradients;
use crate::twin::TwinNetwork;
use crate::types::PairBatch;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// --- Named constants ---

/// Pairs per optimizer step.
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_LEARNING_RATE: f32 = 1e-4;
pub const DEFAULT_EPOCHS: usize = 50;
/// A full checkpoint is written after every epoch that is a multiple of this.
pub const DEFAULT_CHECKPOINT_EVERY: usize = 10;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("empty training batch")]
    EmptyBatch,
    #[error("data error: {0}")]
    Data(Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    #[error("checkpoint has no optimizer state to resume from")]
    MissingOptimizerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub learning_rate: f32,
    pub epochs: usize,
    pub checkpoint_every: usize,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let adam = AdamConfig::default();
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            epochs: DEFAULT_EPOCHS,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            checkpoint_dir: crate::default_checkpoint_dir(),
            seed: DEFAULT_SEED,
            beta1: adam.beta1,
            beta2: adam.beta2,
            epsilon: adam.epsilon,
        }
    }
}

impl TrainingConfig {
    pub fn adam(&self) -> AdamConfig {
        AdamConfig {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
        }
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        if self.batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.checkpoint_every == 0 {
            return Err(TrainError::InvalidConfig(
                "checkpoint_every must be positive".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        Ok(())
    }

    /// Path of the checkpoint written after `epoch`.
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(checkpoint::checkpoint_file_name(epoch))
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Batch-mean BCE loss computed before the update.
    pub loss: f32,
    /// Predicted probabilities, in batch order.
    pub probabilities: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    /// 1-based epoch number.
    pub epoch: usize,
    pub steps: usize,
    pub samples: usize,
    /// Sample-weighted mean of the per-batch losses.
    pub loss: f32,
    pub precision: f32,
    pub recall: f32,
    /// Set when any step of the epoch produced a non-finite loss.
    pub diverged: bool,
    pub checkpoint: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub samples: usize,
    pub loss: f32,
    pub precision: f32,
    pub recall: f32,
    pub metrics: BinaryMetrics,
}

/// Training state: the network being trained, its optimizer and config.
pub struct Trainer {
    config: TrainingConfig,
    network: TwinNetwork,
    optimizer: Adam,
    gradients: Gradients,
    epochs_completed: usize,
    run_id: String,
}

impl Trainer {
    pub fn new(network: TwinNetwork, config: TrainingConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let optimizer = Adam::new(
            config.adam(),
            network.parameters().into_iter().map(|(_, p)| p),
        );
        let gradients = network.zero_gradients();
        let run_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            run_id = %run_id,
            parameters = network.parameter_count(),
            batch_size = config.batch_size,
            learning_rate = config.learning_rate,
            epochs = config.epochs,
            "trainer ready"
        );

        Ok(Self {
            config,
            network,
            optimizer,
            gradients,
            epochs_completed: 0,
            run_id,
        })
    }

    /// Continue a run from a checkpoint written with optimizer state.
    ///
    /// Epoch numbering continues from the checkpoint's epoch; `config.epochs`
    /// is the total, so a run checkpointed at epoch 20 of 50 trains 30 more.
    pub fn resume(checkpoint: Checkpoint, config: TrainingConfig) -> Result<Self, TrainError> {
        config.validate()?;
        let Checkpoint {
            header,
            network,
            optimizer,
        } = checkpoint;
        let optimizer = optimizer.ok_or(TrainError::MissingOptimizerState)?;
        let optimizer = Adam::restore(
            config.adam(),
            optimizer.steps(),
            optimizer.first_moments().to_vec(),
            optimizer.second_moments().to_vec(),
        );
        let gradients = network.zero_gradients();

        tracing::info!(
            run_id = %header.run_id,
            epoch = header.epoch,
            optimizer_step = optimizer.steps(),
            "resuming training"
        );

        Ok(Self {
            config,
            network,
            optimizer,
            gradients,
            epochs_completed: header.epoch,
            run_id: header.run_id,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn network(&self) -> &TwinNetwork {
        &self.network
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Optimizer updates applied so far, across resumes.
    pub fn steps(&self) -> u64 {
        self.optimizer.steps()
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// One optimizer step on `batch`.
    ///
    /// Every pair is shape-checked before any computation, so a malformed
    /// batch leaves the parameters untouched.
    pub fn train_step(&mut self, batch: &PairBatch) -> Result<StepOutcome, TrainError> {
        if batch.is_empty() {
            return Err(TrainError::EmptyBatch);
        }
        for pair in batch.pairs() {
            self.network.check_pair(pair)?;
        }

        self.gradients.zero();
        let n = batch.len();
        let mut probabilities = Vec::with_capacity(n);
        for pair in batch.pairs() {
            probabilities.push(self.network.accumulate_pair(pair, n, &mut self.gradients)?);
        }

        let loss = binary_cross_entropy(&probabilities, &batch.targets());
        if !loss.is_finite() || !self.gradients.is_finite() {
            tracing::warn!(
                step = self.optimizer.steps() + 1,
                loss,
                "non-finite loss or gradient, training may be diverging"
            );
        }

        self.optimizer
            .step(self.network.parameters_mut(), &self.gradients);

        tracing::debug!(
            step = self.optimizer.steps(),
            batch = n,
            loss,
            grad_norm = self.gradients.global_norm(),
            "train step"
        );

        Ok(StepOutcome {
            loss,
            probabilities,
        })
    }

    /// Run one pass over `batches` and report loss, precision and recall.
    ///
    /// A data error aborts the epoch; steps already taken are kept.
    pub fn train_epoch<I, E>(&mut self, epoch: usize, batches: I) -> Result<EpochReport, TrainError>
    where
        I: IntoIterator<Item = Result<PairBatch, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut metrics = BinaryMetrics::default();
        let mut loss_sum = 0.0f64;
        let mut samples = 0usize;
        let mut steps = 0usize;
        let mut diverged = false;

        for batch in batches {
            let batch = batch.map_err(|e| TrainError::Data(Box::new(e)))?;
            let outcome = self.train_step(&batch)?;
            diverged |= !outcome.loss.is_finite();
            loss_sum += f64::from(outcome.loss) * batch.len() as f64;
            samples += batch.len();
            steps += 1;
            metrics.update(&outcome.probabilities, &batch.targets());
        }

        let loss = if samples == 0 {
            0.0
        } else {
            (loss_sum / samples as f64) as f32
        };
        self.epochs_completed = epoch;

        let report = EpochReport {
            epoch,
            steps,
            samples,
            loss,
            precision: metrics.precision(),
            recall: metrics.recall(),
            diverged,
            checkpoint: None,
        };
        if diverged {
            tracing::warn!(epoch, "epoch finished with a non-finite loss");
        }
        tracing::info!(
            epoch,
            steps,
            loss = report.loss,
            precision = report.precision,
            recall = report.recall,
            "epoch complete"
        );
        Ok(report)
    }

    /// Train for the remaining epochs of `config.epochs`, checkpointing
    /// after every epoch that is a multiple of `checkpoint_every`.
    pub fn fit<S: PairSource>(&mut self, source: &mut S) -> Result<Vec<EpochReport>, TrainError> {
        let first = self.epochs_completed + 1;
        let mut reports = Vec::new();

        for epoch in first..=self.config.epochs {
            tracing::info!(epoch, total = self.config.epochs, "starting epoch");
            let mut report = self.train_epoch(epoch, source.batches(self.config.batch_size))?;
            if epoch % self.config.checkpoint_every == 0 {
                report.checkpoint = Some(self.save_checkpoint(epoch)?);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Loss, precision and recall on held-out pairs. Parameters are not touched.
    pub fn evaluate<I, E>(&self, batches: I) -> Result<EvaluationReport, TrainError>
    where
        I: IntoIterator<Item = Result<PairBatch, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        evaluate_network(&self.network, batches)
    }

    /// Write a full checkpoint (parameters and optimizer state) for `epoch`.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf, TrainError> {
        let path = self.config.checkpoint_path(epoch);
        checkpoint::save(
            &path,
            &self.network,
            Some(&self.optimizer),
            epoch,
            &self.run_id,
        )?;
        Ok(path)
    }

    /// End training and freeze the model for inference.
    pub fn into_inference(self) -> InferenceModel {
        InferenceModel::new(self.network)
    }
}

/// Shared by [`Trainer::evaluate`] and [`InferenceModel::evaluate`].
pub(crate) fn evaluate_network<I, E>(
    network: &TwinNetwork,
    batches: I,
) -> Result<EvaluationReport, TrainError>
where
    I: IntoIterator<Item = Result<PairBatch, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut metrics = BinaryMetrics::default();
    let mut loss_sum = 0.0f64;
    let mut samples = 0usize;

    for batch in batches {
        let batch = batch.map_err(|e| TrainError::Data(Box::new(e)))?;
        let targets = batch.targets();
        let probabilities = network.predict_batch(&batch)?;
        loss_sum += f64::from(binary_cross_entropy(&probabilities, &targets)) * batch.len() as f64;
        samples += batch.len();
        metrics.update(&probabilities, &targets);
    }

    let loss = if samples == 0 {
        0.0
    } else {
        (loss_sum / samples as f64) as f32
    };
    tracing::info!(
        samples,
        loss,
        precision = metrics.precision(),
        recall = metrics.recall(),
        "evaluation complete"
    );
    Ok(EvaluationReport {
        samples,
        loss,
        precision: metrics.precision(),
        recall: metrics.recall(),
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{ConvBlockSpec, EmbeddingSpec};
    use crate::embedding::tests::ramp_image;
    use crate::source::InMemoryPairs;
    use crate::twin::tests::tiny_twin;
    use crate::types::{Image, Label, Pair};
    use std::convert::Infallible;
    use std::sync::Arc;

    fn config(dir: &std::path::Path) -> TrainingConfig {
        TrainingConfig {
            batch_size: 4,
            learning_rate: 1e-3,
            epochs: 2,
            checkpoint_dir: dir.to_path_buf(),
            ..TrainingConfig::default()
        }
    }

    fn toy_pairs(net: &TwinNetwork, n: usize) -> Vec<Pair> {
        let a = Arc::new(ramp_image(net.spec(), 0.1));
        let b = Arc::new(ramp_image(net.spec(), 0.45));
        let c = Arc::new(ramp_image(net.spec(), 0.9));
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Pair::new(a.clone(), b.clone(), Label::Same)
                } else {
                    Pair::new(a.clone(), c.clone(), Label::Different)
                }
            })
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert_eq!(config.batch_size, 16);
        assert!((config.learning_rate - 1e-4).abs() < 1e-12);
        assert_eq!(config.checkpoint_every, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let config = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn test_step_updates_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(21);
        let before = net.parameters()[10].1.clone();
        let batch = PairBatch::new(toy_pairs(&net, 4));
        let mut trainer = Trainer::new(net, config(dir.path())).unwrap();

        let outcome = trainer.train_step(&batch).unwrap();
        assert_eq!(outcome.probabilities.len(), 4);
        assert!(outcome.loss.is_finite());
        assert_eq!(trainer.steps(), 1);
        assert_ne!(trainer.network().parameters()[10].1, &before);
    }

    #[test]
    fn test_bad_shape_aborts_before_update() {
        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(22);
        let mut pairs = toy_pairs(&net, 3);
        let good = pairs[0].anchor.clone();
        pairs.push(Pair::new(good, Arc::new(Image::filled(8, 8, 3, 0.0)), Label::Same));
        let snapshot = net.clone();
        let mut trainer = Trainer::new(net, config(dir.path())).unwrap();

        let result = trainer.train_step(&PairBatch::new(pairs));
        assert!(matches!(result, Err(TrainError::Network(NetworkError::Shape { .. }))));
        assert_eq!(trainer.steps(), 0);
        for ((_, a), (_, b)) in trainer.network().parameters().iter().zip(snapshot.parameters()) {
            assert_eq!(*a, b);
        }
    }

    #[test]
    fn test_empty_batch_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_twin(23), config(dir.path())).unwrap();
        assert!(matches!(
            trainer.train_step(&PairBatch::default()),
            Err(TrainError::EmptyBatch)
        ));
    }

    /// One wide block straight into the projection: 8 → 6 → 3, 144 features.
    /// Sixteen filters keep some ReLUs alive for any seed.
    fn learning_twin(seed: u64) -> TwinNetwork {
        let spec = EmbeddingSpec {
            input_height: 8,
            input_width: 8,
            input_channels: 3,
            blocks: vec![ConvBlockSpec { filters: 16, kernel: 3, pool: true }],
            embedding_dim: 8,
        };
        TwinNetwork::new(spec, seed).unwrap()
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let net = learning_twin(24);
        let pairs = InMemoryPairs::new(toy_pairs(&net, 8));

        // Distinct embeddings give non-zero distances, so gradient reaches
        // the embedding network and the head kernel.
        let embed = |offset| net.embed(&ramp_image(net.spec(), offset)).unwrap();
        let (a, b, c) = (embed(0.1), embed(0.45), embed(0.9));
        assert_ne!(a, b);
        assert_ne!(a, c);

        let config = TrainingConfig {
            learning_rate: 1e-2,
            ..config(dir.path())
        };
        let mut trainer = Trainer::new(net, config).unwrap();

        let initial = trainer
            .evaluate(pairs.pairs().chunks(4).map(|c| Ok::<_, Infallible>(PairBatch::new(c.to_vec()))))
            .unwrap()
            .loss;
        let mut source = pairs.clone();
        for epoch in 1..=30 {
            trainer.train_epoch(epoch, source.batches(4)).unwrap();
        }
        let after = trainer.evaluate(source.batches(4)).unwrap().loss;
        assert!(after < initial, "loss {initial} -> {after}");
    }

    #[test]
    fn test_epoch_report_counts() {
        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(25);
        let mut source = InMemoryPairs::new(toy_pairs(&net, 10));
        let mut trainer = Trainer::new(net, config(dir.path())).unwrap();

        let report = trainer.train_epoch(1, source.batches(4)).unwrap();
        assert_eq!(report.steps, 3);
        assert_eq!(report.samples, 10);
        assert!(!report.diverged);
        assert!(report.checkpoint.is_none());
        assert_eq!(trainer.steps(), 3);
    }

    #[test]
    fn test_data_error_aborts_epoch() {
        #[derive(Debug, thiserror::Error)]
        #[error("decode failed")]
        struct Broken;

        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(26);
        let good = PairBatch::new(toy_pairs(&net, 2));
        let mut trainer = Trainer::new(net, config(dir.path())).unwrap();

        let batches = vec![Ok(good.clone()), Err(Broken), Ok(good)];
        let result = trainer.train_epoch(1, batches);
        assert!(matches!(result, Err(TrainError::Data(_))));
        assert_eq!(trainer.steps(), 1);
    }

    #[test]
    fn test_evaluate_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(27);
        let mut source = InMemoryPairs::new(toy_pairs(&net, 6));
        let trainer = Trainer::new(net.clone(), config(dir.path())).unwrap();

        let report = trainer.evaluate(source.batches(4)).unwrap();
        assert_eq!(report.samples, 6);
        assert_eq!(report.metrics.total(), 6);
        for ((_, a), (_, b)) in trainer.network().parameters().iter().zip(net.parameters()) {
            assert_eq!(*a, b);
        }
    }

    #[test]
    fn test_resume_continues_step_count_and_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let net = tiny_twin(28);
        let mut source = InMemoryPairs::new(toy_pairs(&net, 8));
        let mut trainer = Trainer::new(net, config(dir.path())).unwrap();
        trainer.train_epoch(1, source.batches(4)).unwrap();
        let path = trainer.save_checkpoint(1).unwrap();

        let checkpoint = checkpoint::load(&path).unwrap();
        let resumed = Trainer::resume(checkpoint, config(dir.path())).unwrap();
        assert_eq!(resumed.steps(), 2);
        assert_eq!(resumed.epochs_completed(), 1);
        assert_eq!(resumed.run_id(), trainer.run_id());
        assert_eq!(
            resumed.optimizer().first_moments(),
            trainer.optimizer().first_moments()
        );
    }

    #[test]
    fn test_resume_requires_optimizer_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        checkpoint::save(&path, &tiny_twin(29), None, 5, "run").unwrap();
        let checkpoint = checkpoint::load(&path).unwrap();
        assert!(matches!(
            Trainer::resume(checkpoint, config(dir.path())),
            Err(TrainError::MissingOptimizerState)
        ));
    }
}
