//! Verification: one probe against a fixed reference set, reduced to a
//! single accept/reject decision.

use crate::embedding::NetworkError;
use crate::inference::InferenceModel;
use crate::types::Image;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants ---

/// A reference counts as a match when its probability is strictly above this.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.5;
/// Identity is verified when the matched fraction is strictly above this.
pub const DEFAULT_VERIFICATION_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("reference set is empty")]
    EmptyReferenceSet,
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub detection_threshold: f32,
    pub verification_threshold: f32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    /// One probability per reference, in reference order.
    pub probabilities: Vec<f32>,
    pub detections: usize,
    pub ratio: f32,
    pub verified: bool,
}

/// Reduce per-reference probabilities to a decision.
///
/// Both comparisons are strict: with four references and thresholds of 0.5,
/// two matches give a ratio of exactly 0.5, which is *not* verified.
pub fn decide(
    probabilities: Vec<f32>,
    config: &VerificationConfig,
) -> Result<VerificationResult, VerifyError> {
    if probabilities.is_empty() {
        return Err(VerifyError::EmptyReferenceSet);
    }
    let detections = probabilities
        .iter()
        .filter(|&&p| p > config.detection_threshold)
        .count();
    let ratio = detections as f32 / probabilities.len() as f32;
    Ok(VerificationResult {
        verified: ratio > config.verification_threshold,
        probabilities,
        detections,
        ratio,
    })
}

pub struct VerificationEngine<'m> {
    model: &'m InferenceModel,
    config: VerificationConfig,
}

impl<'m> VerificationEngine<'m> {
    pub fn new(model: &'m InferenceModel, config: VerificationConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Compare `probe` against every reference and decide.
    ///
    /// An empty reference set fails before the probe is embedded.
    pub fn verify(
        &self,
        probe: &Image,
        references: &[Image],
    ) -> Result<VerificationResult, VerifyError> {
        if references.is_empty() {
            return Err(VerifyError::EmptyReferenceSet);
        }
        let probabilities = self.model.predict_many(probe, references)?;
        for (index, p) in probabilities.iter().enumerate() {
            tracing::debug!(reference = index, probability = p, "reference compared");
        }

        let result = decide(probabilities, &self.config)?;
        tracing::info!(
            references = references.len(),
            detections = result.detections,
            ratio = result.ratio,
            verified = result.verified,
            "verification decision"
        );
        Ok(result)
    }
}
