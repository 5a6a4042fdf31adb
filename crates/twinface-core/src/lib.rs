//! twinface-core — twin-network face verification engine.
//!
//! A shared convolutional embedding network, an L1 distance layer and a
//! logistic classifier head, trained end-to-end with binary cross-entropy
//! and Adam. Gradients come from a per-sample recording tape replayed in
//! reverse; trained models are frozen into an [`InferenceModel`] and used
//! by the [`VerificationEngine`].

pub mod architecture;
pub mod checkpoint;
pub mod distance;
pub mod embedding;
pub mod head;
pub mod inference;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod source;
pub mod tape;
pub mod trainer;
pub mod twin;
pub mod types;
pub mod verification;

use std::path::PathBuf;

pub use architecture::{ConvBlockSpec, EmbeddingSpec};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointHeader};
pub use embedding::{EmbeddingNetwork, NetworkError};
pub use inference::InferenceModel;
pub use metrics::BinaryMetrics;
pub use optimizer::{Adam, AdamConfig};
pub use source::{InMemoryPairs, PairSource};
pub use trainer::{EpochReport, EvaluationReport, StepOutcome, TrainError, Trainer, TrainingConfig};
pub use twin::TwinNetwork;
pub use types::{Embedding, Image, Label, Pair, PairBatch};
pub use verification::{
    decide, VerificationConfig, VerificationEngine, VerificationResult, VerifyError,
};

/// `$XDG_DATA_HOME/twinface/checkpoints`, falling back to `~/.local/share`.
pub fn default_checkpoint_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("twinface")
        .join("checkpoints")
}
