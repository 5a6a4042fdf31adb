//! Binary cross-entropy over predicted similarity probabilities.

/// Probabilities are clipped to `[ε, 1 - ε]` before taking logarithms.
pub const PROBABILITY_EPSILON: f32 = 1e-7;

/// `-mean(y·ln(p) + (1 - y)·ln(1 - p))`. Returns 0.0 for an empty batch.
pub fn binary_cross_entropy(probabilities: &[f32], targets: &[f32]) -> f32 {
    let n = probabilities.len().min(targets.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f32 = probabilities
        .iter()
        .zip(targets)
        .map(|(&p, &y)| {
            let p = p.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
            y * p.ln() + (1.0 - y) * (1.0 - p).ln()
        })
        .sum();
    -sum / n as f32
}

/// Gradient of the batch-mean loss with respect to one sample's logit.
///
/// Sigmoid and cross-entropy are differentiated together, which reduces to
/// `(p - y) / n`.
pub fn logit_gradient(probability: f32, target: f32, batch_len: usize) -> f32 {
    (probability - target) / batch_len as f32
}
