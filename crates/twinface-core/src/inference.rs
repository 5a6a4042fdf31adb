//! Frozen model for prediction and verification.

use crate::architecture::EmbeddingSpec;
use crate::checkpoint::{self, CheckpointError, CheckpointHeader};
use crate::embedding::NetworkError;
use crate::trainer::{evaluate_network, EvaluationReport, TrainError};
use crate::twin::TwinNetwork;
use crate::types::{Embedding, Image, PairBatch};
use std::path::Path;

/// A trained twin network that can no longer change.
///
/// Every method takes `&self`, so an `InferenceModel` can be shared across
/// threads (e.g. behind an `Arc`) without locking.
#[derive(Debug, Clone)]
pub struct InferenceModel {
    network: TwinNetwork,
}

impl InferenceModel {
    pub fn new(network: TwinNetwork) -> Self {
        Self { network }
    }

    /// Load parameters from a checkpoint; optimizer state, if present, is dropped.
    pub fn from_checkpoint(path: &Path) -> Result<(Self, CheckpointHeader), CheckpointError> {
        let checkpoint = checkpoint::load(path)?;
        Ok((Self::new(checkpoint.network), checkpoint.header))
    }

    pub fn spec(&self) -> &EmbeddingSpec {
        self.network.spec()
    }

    pub fn network(&self) -> &TwinNetwork {
        &self.network
    }

    pub fn embed(&self, image: &Image) -> Result<Embedding, NetworkError> {
        self.network.embed(image)
    }

    pub fn predict(&self, a: &Image, b: &Image) -> Result<f32, NetworkError> {
        self.network.predict(a, b)
    }

    /// Similarity of `probe` against each reference, embedding the probe once.
    pub fn predict_many(&self, probe: &Image, references: &[Image]) -> Result<Vec<f32>, NetworkError> {
        let probe = self.network.embed(probe)?;
        references
            .iter()
            .map(|reference| {
                let embedding = self.network.embed(reference)?;
                self.network.predict_embeddings(&probe, &embedding)
            })
            .collect()
    }

    /// Loss, precision and recall over held-out pairs.
    pub fn evaluate<I, E>(&self, batches: I) -> Result<EvaluationReport, TrainError>
    where
        I: IntoIterator<Item = Result<PairBatch, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        evaluate_network(&self.network, batches)
    }
}

impl From<TwinNetwork> for InferenceModel {
    fn from(network: TwinNetwork) -> Self {
        Self::new(network)
    }
}
