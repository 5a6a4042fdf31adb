//! Classifier head: one dense unit plus sigmoid over the distance vector.

use crate::architecture::ParameterShape;
use crate::embedding::NetworkError;
use crate::layers::{glorot_uniform, sigmoid, Dense};
use crate::loss::PROBABILITY_EPSILON;
use crate::tape::Gradients;
use ndarray::{array, Array1, Array2};
use rand::Rng;

const HEAD_KERNEL: &str = "head.kernel";
const HEAD_BIAS: &str = "head.bias";

/// Affine projection `distance → logit` followed by a sigmoid.
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    dense: Dense,
}

impl ClassifierHead {
    pub fn new<R: Rng + ?Sized>(inputs: usize, rng: &mut R) -> Self {
        Self {
            dense: Dense::new(glorot_uniform(rng, inputs, 1, (inputs, 1))),
        }
    }

    pub(crate) fn zeroed(inputs: usize) -> Self {
        Self {
            dense: Dense::new(Array2::zeros((inputs, 1))),
        }
    }

    pub fn inputs(&self) -> usize {
        self.dense.inputs()
    }

    /// Raw pre-sigmoid score.
    pub fn logit(&self, distance: &Array1<f32>) -> Result<f32, NetworkError> {
        Ok(self.dense.forward(distance)?[0])
    }

    /// Similarity probability, strictly inside (0, 1).
    pub fn forward(&self, distance: &Array1<f32>) -> Result<f32, NetworkError> {
        Ok(sigmoid(self.logit(distance)?).clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON))
    }

    /// Accumulate head gradients for `grad_logit` and return the gradient
    /// with respect to the distance vector.
    pub(crate) fn backward(
        &self,
        distance: &Array1<f32>,
        grad_logit: f32,
        grads: &mut Gradients,
        slot: usize,
    ) -> Array1<f32> {
        let (grad_kernel, grad_bias) = grads.pair_mut(slot);
        self.dense
            .backward(distance, &array![grad_logit], grad_kernel, grad_bias, true)
            .unwrap_or_else(|| Array1::zeros(distance.len()))
    }

    pub fn parameters(&self) -> Vec<(String, &Array2<f32>)> {
        vec![
            (HEAD_KERNEL.to_string(), self.dense.kernel()),
            (HEAD_BIAS.to_string(), self.dense.bias()),
        ]
    }

    /// Shapes of [`parameters`](Self::parameters) for a head over `inputs` distances.
    pub fn parameter_shapes(inputs: usize) -> [ParameterShape; 2] {
        [
            (HEAD_KERNEL.to_string(), [inputs, 1]),
            (HEAD_BIAS.to_string(), [1, 1]),
        ]
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.dense.params_mut().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_output_strictly_inside_unit_interval() {
        let mut head = ClassifierHead::zeroed(3);
        head.parameters_mut()[0].fill(1000.0);
        let p = head.forward(&array![1.0, 1.0, 1.0]).unwrap();
        assert!(p < 1.0 && p > 0.0);

        head.parameters_mut()[0].fill(-1000.0);
        let p = head.forward(&array![1.0, 1.0, 1.0]).unwrap();
        assert!(p > 0.0 && p < 1.0);
    }

    #[test]
    fn test_zero_weights_give_one_half() {
        let head = ClassifierHead::zeroed(4);
        let p = head.forward(&Array1::ones(4)).unwrap();
        assert!((p - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_backward_scales_kernel_by_distance() {
        let head = ClassifierHead::new(3, &mut StdRng::seed_from_u64(1));
        let mut grads = Gradients::zeros_like(head.parameters().into_iter().map(|(_, p)| p));
        let distance = array![0.5, 0.0, 2.0];
        let grad_distance = head.backward(&distance, 0.25, &mut grads, 0);

        assert_eq!(grads.tensors()[0], array![[0.125], [0.0], [0.5]]);
        assert_eq!(grads.tensors()[1], array![[0.25]]);
        let kernel = head.parameters()[0].1.column(0).to_owned();
        assert_eq!(grad_distance, kernel * 0.25);
    }

    #[test]
    fn test_rejects_wrong_distance_length() {
        let head = ClassifierHead::zeroed(4);
        assert!(head.forward(&Array1::ones(3)).is_err());
    }
}
