//! Embedding network: stacked convolution blocks and a sigmoid projection.
//!
//! The network is an explicit, ordered `Vec<Layer>` built from an
//! [`EmbeddingSpec`]. Both branches of the twin network call into the same
//! `EmbeddingNetwork` value, so weight sharing holds by construction.

use crate::architecture::EmbeddingSpec;
use crate::layers::{glorot_uniform, Activation, Conv2d, Dense, Layer};
use crate::tape::{Gradients, Tape};
use crate::types::{Embedding, Image};
use ndarray::{Array1, Array2};
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{layer} expects a {expected}, got a {actual}")]
    LayerInput {
        layer: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid architecture: {0}")]
    Architecture(String),
    #[error("tape record does not match layer {0}")]
    TapeMismatch(usize),
    #[error("reshape failed: {0}")]
    Reshape(#[from] ndarray::ShapeError),
}

/// Convolutional embedding network.
#[derive(Debug, Clone)]
pub struct EmbeddingNetwork {
    spec: EmbeddingSpec,
    layers: Vec<Layer>,
    /// Gradient slot of each layer's kernel; `None` for parameter-free layers.
    slots: Vec<Option<usize>>,
}

impl EmbeddingNetwork {
    /// Build with Glorot-uniform kernels and zero biases.
    pub fn new<R: Rng + ?Sized>(spec: EmbeddingSpec, rng: &mut R) -> Result<Self, NetworkError> {
        Self::build(spec, |fan_in, fan_out| {
            glorot_uniform(rng, fan_in, fan_out, (fan_in, fan_out))
        })
    }

    /// Build with all-zero parameters; used by the checkpoint loader
    /// before it writes the stored tensors in.
    pub(crate) fn zeroed(spec: EmbeddingSpec) -> Result<Self, NetworkError> {
        Self::build(spec, |fan_in, fan_out| Array2::zeros((fan_in, fan_out)))
    }

    fn build(
        spec: EmbeddingSpec,
        mut init: impl FnMut(usize, usize) -> Array2<f32>,
    ) -> Result<Self, NetworkError> {
        spec.validate()?;

        let mut layers = Vec::with_capacity(spec.blocks.len() * 3 + 3);
        let mut channels = spec.input_channels;

        for block in &spec.blocks {
            let fan_in = block.kernel * block.kernel * channels;
            let kernel = init(fan_in, block.filters);
            layers.push(Layer::Conv(Conv2d::new(block.kernel, channels, kernel)));
            layers.push(Layer::Relu);
            if block.pool {
                layers.push(Layer::MaxPool);
            }
            channels = block.filters;
        }

        let flattened = spec.flattened_len()?;
        layers.push(Layer::Flatten);
        layers.push(Layer::Dense(Dense::new(init(flattened, spec.embedding_dim))));
        layers.push(Layer::Sigmoid);

        let mut next_slot = 0;
        let slots = layers
            .iter()
            .map(|layer| match layer {
                Layer::Conv(_) | Layer::Dense(_) => {
                    let slot = next_slot;
                    next_slot += 2;
                    Some(slot)
                }
                _ => None,
            })
            .collect();

        tracing::debug!(
            layers = layers.len(),
            flattened,
            embedding_dim = spec.embedding_dim,
            "embedding network built"
        );

        Ok(Self {
            spec,
            layers,
            slots,
        })
    }

    pub fn spec(&self) -> &EmbeddingSpec {
        &self.spec
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn embedding_dim(&self) -> usize {
        self.spec.embedding_dim
    }

    /// Fail with a shape error unless `image` matches the input contract.
    pub fn check_input(&self, image: &Image) -> Result<(), NetworkError> {
        let (h, w, c) = image.shape();
        let (eh, ew, ec) = self.spec.input_shape();
        if (h, w, c) != (eh, ew, ec) {
            return Err(NetworkError::Shape {
                expected: vec![eh, ew, ec],
                actual: vec![h, w, c],
            });
        }
        Ok(())
    }

    /// Map one image to its embedding.
    pub fn embed(&self, image: &Image) -> Result<Embedding, NetworkError> {
        self.forward(image, None)
    }

    /// Same as [`embed`](Self::embed), recording onto `tape` for a later backward pass.
    pub(crate) fn embed_recorded(&self, image: &Image, tape: &mut Tape) -> Result<Embedding, NetworkError> {
        self.forward(image, Some(tape))
    }

    fn forward(&self, image: &Image, mut tape: Option<&mut Tape>) -> Result<Embedding, NetworkError> {
        self.check_input(image)?;

        let mut x = Activation::Spatial(image.pixels.clone());
        for (index, layer) in self.layers.iter().enumerate() {
            x = layer.forward(index, x, tape.as_deref_mut())?;
        }

        Ok(Embedding::new(x.into_flat("embedding output")?))
    }

    /// Replay `tape` against the gradient of the embedding.
    pub(crate) fn backward(
        &self,
        tape: Tape,
        grad_embedding: Array1<f32>,
        grads: &mut Gradients,
    ) -> Result<(), NetworkError> {
        tape.backward(&self.layers, &self.slots, Activation::Flat(grad_embedding), grads)
    }

    /// Named parameters in slot order.
    pub fn parameters(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = Vec::new();
        let mut conv_index = 0;
        for layer in &self.layers {
            match layer {
                Layer::Conv(conv) => {
                    conv_index += 1;
                    params.push((format!("embedding.conv{conv_index}.kernel"), conv.kernel()));
                    params.push((format!("embedding.conv{conv_index}.bias"), conv.bias()));
                }
                Layer::Dense(dense) => {
                    params.push(("embedding.dense.kernel".to_string(), dense.kernel()));
                    params.push(("embedding.dense.bias".to_string(), dense.bias()));
                }
                _ => {}
            }
        }
        params
    }

    /// Mutable parameters in the same order as [`parameters`](Self::parameters).
    pub(crate) fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        let mut params = Vec::new();
        for layer in &mut self.layers {
            match layer {
                Layer::Conv(conv) => params.extend(conv.params_mut()),
                Layer::Dense(dense) => params.extend(dense.params_mut()),
                _ => {}
            }
        }
        params
    }

    /// Number of parameter tensors (kernels and biases).
    pub fn parameter_tensors(&self) -> usize {
        self.slots.iter().flatten().count() * 2
    }
}
