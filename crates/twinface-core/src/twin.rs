//! Twin (Siamese) network: one shared embedding network, the L1 distance
//! layer and the classifier head.

use crate::architecture::{element_count, EmbeddingSpec, ParameterShape};
use crate::distance::L1Distance;
use crate::embedding::{EmbeddingNetwork, NetworkError};
use crate::head::ClassifierHead;
use crate::loss::logit_gradient;
use crate::tape::{Gradients, Tape};
use crate::types::{Embedding, Image, Pair, PairBatch};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// `predict(a, b) = head(|embed(a) - embed(b)|)`.
///
/// There is exactly one [`EmbeddingNetwork`]; both inputs of a pair go
/// through it, and during training the gradients from both branches land
/// in the same buffers.
#[derive(Debug, Clone)]
pub struct TwinNetwork {
    embedding: EmbeddingNetwork,
    head: ClassifierHead,
}

impl TwinNetwork {
    /// Randomly initialised network; the same seed always yields the same weights.
    pub fn new(spec: EmbeddingSpec, seed: u64) -> Result<Self, NetworkError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let embedding = EmbeddingNetwork::new(spec, &mut rng)?;
        let head = ClassifierHead::new(embedding.embedding_dim(), &mut rng);

        tracing::info!(
            seed,
            parameters = embedding.spec().parameter_count()? + head.inputs() + 1,
            "twin network initialised"
        );

        Ok(Self { embedding, head })
    }

    /// All-zero network with the given architecture, ready to be filled
    /// from a checkpoint.
    pub(crate) fn zeroed(spec: EmbeddingSpec) -> Result<Self, NetworkError> {
        let embedding = EmbeddingNetwork::zeroed(spec)?;
        let head = ClassifierHead::zeroed(embedding.embedding_dim());
        Ok(Self { embedding, head })
    }

    pub fn spec(&self) -> &EmbeddingSpec {
        self.embedding.spec()
    }

    pub fn embedding_network(&self) -> &EmbeddingNetwork {
        &self.embedding
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn embed(&self, image: &Image) -> Result<Embedding, NetworkError> {
        self.embedding.embed(image)
    }

    /// Similarity probability of two precomputed embeddings.
    pub fn predict_embeddings(&self, a: &Embedding, b: &Embedding) -> Result<f32, NetworkError> {
        self.head.forward(&L1Distance::forward(a, b)?)
    }

    /// Similarity probability that `a` and `b` show the same identity.
    pub fn predict(&self, a: &Image, b: &Image) -> Result<f32, NetworkError> {
        let ea = self.embedding.embed(a)?;
        let eb = self.embedding.embed(b)?;
        self.predict_embeddings(&ea, &eb)
    }

    /// Probabilities for every pair, in batch order.
    pub fn predict_batch(&self, batch: &PairBatch) -> Result<Vec<f32>, NetworkError> {
        batch
            .pairs()
            .iter()
            .map(|pair| self.predict(&pair.anchor, &pair.other))
            .collect()
    }

    /// Fail with a shape error if either image of `pair` violates the input contract.
    pub fn check_pair(&self, pair: &Pair) -> Result<(), NetworkError> {
        self.embedding.check_input(&pair.anchor)?;
        self.embedding.check_input(&pair.other)
    }

    /// Recorded forward pass and reverse replay for one pair.
    ///
    /// Adds this pair's contribution to the gradient of the mean loss over
    /// a batch of `batch_len` pairs and returns its predicted probability.
    pub(crate) fn accumulate_pair(
        &self,
        pair: &Pair,
        batch_len: usize,
        grads: &mut Gradients,
    ) -> Result<f32, NetworkError> {
        let mut tape_a = Tape::new();
        let mut tape_b = Tape::new();
        let ea = self.embedding.embed_recorded(&pair.anchor, &mut tape_a)?;
        let eb = self.embedding.embed_recorded(&pair.other, &mut tape_b)?;

        let distance = L1Distance::forward(&ea, &eb)?;
        let probability = self.head.forward(&distance)?;

        let grad_logit = logit_gradient(probability, pair.label.target(), batch_len);
        let grad_distance = self.head.backward(&distance, grad_logit, grads, self.head_slot());
        let (grad_a, grad_b) = L1Distance::backward(&ea, &eb, &grad_distance);

        self.embedding.backward(tape_a, grad_a, grads)?;
        self.embedding.backward(tape_b, grad_b, grads)?;

        Ok(probability)
    }

    fn head_slot(&self) -> usize {
        self.embedding.parameter_tensors()
    }

    /// Named parameters: embedding tensors first, then the head.
    pub fn parameters(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = self.embedding.parameters();
        params.extend(self.head.parameters());
        params
    }

    pub(crate) fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        let mut params = self.embedding.parameters_mut();
        params.extend(self.head.parameters_mut());
        params
    }

    /// Expected name and shape of every parameter tensor of a network built
    /// from `spec`, in [`parameters`](Self::parameters) order. Nothing is allocated.
    pub fn parameter_shapes(spec: &EmbeddingSpec) -> Result<Vec<ParameterShape>, NetworkError> {
        let mut shapes = spec.parameter_shapes()?;
        shapes.extend(ClassifierHead::parameter_shapes(spec.embedding_dim));
        Ok(shapes)
    }

    /// Scalar parameter count of a network built from `spec`.
    pub fn parameter_count_for(spec: &EmbeddingSpec) -> Result<usize, NetworkError> {
        element_count(&Self::parameter_shapes(spec)?)
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }

    /// Zeroed gradient buffers matching this network.
    pub fn zero_gradients(&self) -> Gradients {
        Gradients::zeros_like(self.parameters().into_iter().map(|(_, p)| p))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::tests::{ramp_image, tiny_spec};
    use crate::types::Label;
    use std::sync::Arc;

    pub(crate) fn tiny_twin(seed: u64) -> TwinNetwork {
        TwinNetwork::new(tiny_spec(), seed).unwrap()
    }

    #[test]
    fn test_predict_in_unit_interval() {
        let net = tiny_twin(1);
        let a = ramp_image(net.spec(), 0.1);
        let b = ramp_image(net.spec(), 0.6);
        let p = net.predict(&a, &b).unwrap();
        assert!(p > 0.0 && p < 1.0);
    }

    #[test]
    fn test_predict_is_symmetric() {
        let net = tiny_twin(2);
        let a = ramp_image(net.spec(), 0.1);
        let b = ramp_image(net.spec(), 0.6);
        assert_eq!(net.predict(&a, &b).unwrap(), net.predict(&b, &a).unwrap());
    }

    #[test]
    fn test_predict_rejects_bad_shape() {
        let net = tiny_twin(3);
        let a = ramp_image(net.spec(), 0.1);
        let bad = Image::filled(16, 16, 1, 0.5);
        assert!(matches!(net.predict(&a, &bad), Err(NetworkError::Shape { .. })));
    }

    #[test]
    fn test_parameter_order_and_count() {
        let net = tiny_twin(4);
        let names: Vec<_> = net.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 12);
        assert_eq!(names[10], "head.kernel");
        assert_eq!(names[11], "head.bias");
        // convs: 3*3*3*4+4, 2*2*4*4+4, 2*2*4*4+4, 1*1*4*6+6; dense 6*8+8; head 8+1
        assert_eq!(net.parameter_count(), 112 + 68 + 68 + 30 + 56 + 9);
    }

    #[test]
    fn test_parameter_shapes_match_built_network() {
        let net = tiny_twin(4);
        let expected = TwinNetwork::parameter_shapes(net.spec()).unwrap();
        let actual: Vec<_> = net
            .parameters()
            .into_iter()
            .map(|(name, p)| (name, [p.nrows(), p.ncols()]))
            .collect();
        assert_eq!(expected, actual);
        assert_eq!(
            TwinNetwork::parameter_count_for(net.spec()).unwrap(),
            net.parameter_count()
        );
    }

    #[test]
    fn test_identical_pair_gradient_skips_embedding() {
        // |e - e| = 0 everywhere, so the zero subgradient stops the signal at
        // the distance layer: only the head bias receives gradient.
        let net = tiny_twin(5);
        let img = Arc::new(ramp_image(net.spec(), 0.3));
        let pair = Pair::new(img.clone(), img, Label::Same);
        let mut grads = net.zero_gradients();
        net.accumulate_pair(&pair, 1, &mut grads).unwrap();

        let tensors = grads.tensors();
        assert!(tensors[..10].iter().all(|t| t.iter().all(|&g| g == 0.0)));
        assert!(tensors[11][[0, 0]] < 0.0);
    }

    #[test]
    fn test_branch_gradients_accumulate_on_shared_weights() {
        let net = tiny_twin(6);
        let a = Arc::new(ramp_image(net.spec(), 0.1));
        let b = Arc::new(ramp_image(net.spec(), 0.55));
        let forward = Pair::new(a.clone(), b.clone(), Label::Different);
        let swapped = Pair::new(b, a, Label::Different);

        let mut g1 = net.zero_gradients();
        let mut g2 = net.zero_gradients();
        net.accumulate_pair(&forward, 1, &mut g1).unwrap();
        net.accumulate_pair(&swapped, 1, &mut g2).unwrap();

        // Swapping branches must not change the shared-weight gradient.
        for (t1, t2) in g1.tensors().iter().zip(g2.tensors()) {
            for (x, y) in t1.iter().zip(t2.iter()) {
                assert!((x - y).abs() <= 1e-5 * (1.0 + x.abs()), "{x} vs {y}");
            }
        }
        assert!(g1.global_norm() > 0.0);
    }

    #[test]
    fn test_head_gradient_matches_finite_difference() {
        let mut net = tiny_twin(7);
        let a = Arc::new(ramp_image(net.spec(), 0.15));
        let b = Arc::new(ramp_image(net.spec(), 0.85));
        let pair = Pair::new(a.clone(), b.clone(), Label::Same);

        let mut grads = net.zero_gradients();
        net.accumulate_pair(&pair, 1, &mut grads).unwrap();

        let loss = |net: &TwinNetwork| {
            let p = net.predict(&a, &b).unwrap();
            crate::loss::binary_cross_entropy(&[p], &[1.0])
        };
        let eps = 1e-2;
        let base = loss(&net);
        net.parameters_mut()[10][[0, 0]] += eps;
        let numeric = (loss(&net) - base) / eps;
        let analytic = grads.tensors()[10][[0, 0]];
        assert!((numeric - analytic).abs() < 1e-2, "numeric {numeric}, analytic {analytic}");
    }
}
