//! Running precision and recall for binary predictions.

use serde::Serialize;

/// Probability above which a prediction counts as "same identity".
pub const DEFAULT_DECISION_THRESHOLD: f32 = 0.5;

/// Confusion counts accumulated over an epoch (or an evaluation pass).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinaryMetrics {
    threshold: f32,
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl Default for BinaryMetrics {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_DECISION_THRESHOLD)
    }
}

impl BinaryMetrics {
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
            true_negatives: 0,
        }
    }

    /// Fold one batch of predictions into the counts.
    pub fn update(&mut self, probabilities: &[f32], targets: &[f32]) {
        for (&p, &y) in probabilities.iter().zip(targets) {
            let predicted = p > self.threshold;
            let actual = y > 0.5;
            match (predicted, actual) {
                (true, true) => self.true_positives += 1,
                (true, false) => self.false_positives += 1,
                (false, true) => self.false_negatives += 1,
                (false, false) => self.true_negatives += 1,
            }
        }
    }

    /// tp / (tp + fp), or 0.0 when nothing was predicted positive.
    pub fn precision(&self) -> f32 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// tp / (tp + fn), or 0.0 when there were no positives.
    pub fn recall(&self) -> f32 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }

    pub fn reset(&mut self) {
        *self = Self::with_threshold(self.threshold);
    }
}

fn ratio(num: u64, den: u64) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}
