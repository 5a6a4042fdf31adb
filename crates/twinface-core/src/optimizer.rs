//! Adam optimizer over the model's parameter tensors.

use crate::tape::Gradients;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }
}

/// Adam with bias-corrected step size.
///
/// Moment buffers are kept in parameter order and have the same shapes as
/// the parameters they track.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    step: u64,
    m: Vec<Array2<f32>>,
    v: Vec<Array2<f32>>,
}

impl Adam {
    pub fn new<'a>(config: AdamConfig, params: impl IntoIterator<Item = &'a Array2<f32>>) -> Self {
        let (m, v): (Vec<_>, Vec<_>) = params
            .into_iter()
            .map(|p| (Array2::zeros(p.dim()), Array2::zeros(p.dim())))
            .unzip();
        Self {
            config,
            step: 0,
            m,
            v,
        }
    }

    /// Rebuild from stored moments, e.g. when resuming from a checkpoint.
    pub(crate) fn restore(
        config: AdamConfig,
        step: u64,
        m: Vec<Array2<f32>>,
        v: Vec<Array2<f32>>,
    ) -> Self {
        Self { config, step, m, v }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn first_moments(&self) -> &[Array2<f32>] {
        &self.m
    }

    pub fn second_moments(&self) -> &[Array2<f32>] {
        &self.v
    }

    /// Apply one update: `p -= lr_t · m / (sqrt(v) + ε)` with
    /// `lr_t = lr · sqrt(1 - β2^t) / (1 - β1^t)`.
    pub fn step(&mut self, params: Vec<&mut Array2<f32>>, grads: &Gradients) {
        self.step += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let t = self.step as f32;
        let lr_t = learning_rate * (1.0 - beta2.powf(t)).sqrt() / (1.0 - beta1.powf(t));

        for (((param, grad), m), v) in params
            .into_iter()
            .zip(grads.tensors())
            .zip(&mut self.m)
            .zip(&mut self.v)
        {
            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + epsilon);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // With bias correction the first update has magnitude ≈ lr regardless of |g|.
        let mut p = array![[1.0f32, -1.0]];
        let mut adam = Adam::new(AdamConfig::default(), [&p]);
        let mut grads = Gradients::zeros_like([&p]);
        grads_fill(&mut grads, array![[50.0, -0.02]]);

        adam.step(vec![&mut p], &grads);

        assert_eq!(adam.steps(), 1);
        assert!((p[[0, 0]] - (1.0 - 1e-4)).abs() < 1e-6);
        assert!((p[[0, 1]] - (-1.0 + 1e-4)).abs() < 1e-5);
    }

    #[test]
    fn test_zero_gradient_leaves_parameters() {
        let mut p = array![[0.3f32]];
        let mut adam = Adam::new(AdamConfig::default(), [&p]);
        let grads = Gradients::zeros_like([&p]);
        adam.step(vec![&mut p], &grads);
        assert_eq!(p[[0, 0]], 0.3);
    }

    #[test]
    fn test_minimises_quadratic() {
        // f(p) = p², gradient 2p
        let mut p = array![[2.0f32]];
        let config = AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        };
        let mut adam = Adam::new(config, [&p]);
        let mut grads = Gradients::zeros_like([&p]);
        for _ in 0..300 {
            grads_fill(&mut grads, &p * 2.0);
            adam.step(vec![&mut p], &grads);
        }
        assert!(p[[0, 0]].abs() < 0.5, "p = {}", p[[0, 0]]);
    }

    fn grads_fill(grads: &mut Gradients, value: Array2<f32>) {
        grads.tensors_mut()[0].assign(&value);
    }
}
