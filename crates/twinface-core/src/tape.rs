//! Recording tape for reverse-mode differentiation.
//!
//! A forward pass run with a [`Tape`] pushes one [`Record`] per layer,
//! holding exactly what that layer's backward step needs. Replaying the
//! records in reverse yields the parameter gradients. [`Tape::backward`]
//! consumes the tape, so its buffers are released when the replay ends.

use crate::embedding::NetworkError;
use crate::layers::{max_pool_backward, Activation, Layer};
use ndarray::{Array1, Array2, Array3};

/// Saved state for one layer of a recorded forward pass.
#[derive(Debug)]
pub(crate) enum Record {
    Conv {
        layer: usize,
        patches: Array2<f32>,
        input_dim: (usize, usize, usize),
    },
    Relu {
        output: Activation,
    },
    MaxPool {
        argmax: Vec<(usize, usize)>,
        input_dim: (usize, usize, usize),
    },
    Flatten {
        input_dim: (usize, usize, usize),
    },
    Dense {
        layer: usize,
        input: Array1<f32>,
    },
    Sigmoid {
        output: Activation,
    },
}

/// Ordered log of a single forward pass.
#[derive(Debug, Default)]
pub struct Tape {
    records: Vec<Record>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Replay the recorded pass in reverse, accumulating into `grads`.
    ///
    /// `slots[i]` is the gradient slot of layer `i`'s kernel (its bias uses
    /// the next slot). The input gradient of the first recorded layer is
    /// never computed.
    pub(crate) fn backward(
        self,
        layers: &[Layer],
        slots: &[Option<usize>],
        grad_output: Activation,
        grads: &mut Gradients,
    ) -> Result<(), NetworkError> {
        let mut grad = grad_output;

        for (position, record) in self.records.into_iter().enumerate().rev() {
            let propagate = position > 0;
            grad = match record {
                Record::Conv {
                    layer,
                    patches,
                    input_dim,
                } => {
                    let Layer::Conv(conv) = &layers[layer] else {
                        return Err(NetworkError::TapeMismatch(layer));
                    };
                    let slot = slots[layer].ok_or(NetworkError::TapeMismatch(layer))?;
                    let (grad_kernel, grad_bias) = grads.pair_mut(slot);
                    let grad_out = grad.into_spatial("conv backward")?;
                    match conv.backward(&patches, input_dim, &grad_out, grad_kernel, grad_bias, propagate)? {
                        Some(grad_in) => Activation::Spatial(grad_in),
                        None => return Ok(()),
                    }
                }
                Record::Relu { output } => grad.zip_with(&output, |g, y| if y > 0.0 { g } else { 0.0 })?,
                Record::MaxPool { argmax, input_dim } => {
                    let grad_out = grad.into_spatial("max_pool backward")?;
                    Activation::Spatial(max_pool_backward(&grad_out, &argmax, input_dim))
                }
                Record::Flatten { input_dim } => {
                    let grad_out = grad.into_flat("flatten backward")?;
                    Activation::Spatial(Array3::from_shape_vec(input_dim, grad_out.to_vec())?)
                }
                Record::Dense { layer, input } => {
                    let Layer::Dense(dense) = &layers[layer] else {
                        return Err(NetworkError::TapeMismatch(layer));
                    };
                    let slot = slots[layer].ok_or(NetworkError::TapeMismatch(layer))?;
                    let (grad_kernel, grad_bias) = grads.pair_mut(slot);
                    let grad_out = grad.into_flat("dense backward")?;
                    match dense.backward(&input, &grad_out, grad_kernel, grad_bias, propagate) {
                        Some(grad_in) => Activation::Flat(grad_in),
                        None => return Ok(()),
                    }
                }
                Record::Sigmoid { output } => grad.zip_with(&output, |g, y| g * y * (1.0 - y))?,
            };
        }

        Ok(())
    }
}

/// Gradient buffers shaped like the model parameters, in parameter order.
#[derive(Debug, Clone)]
pub struct Gradients {
    tensors: Vec<Array2<f32>>,
}

impl Gradients {
    /// Zero-filled gradients matching `params`.
    pub fn zeros_like<'a>(params: impl IntoIterator<Item = &'a Array2<f32>>) -> Self {
        Self {
            tensors: params
                .into_iter()
                .map(|p| Array2::zeros(p.dim()))
                .collect(),
        }
    }

    pub fn tensors(&self) -> &[Array2<f32>] {
        &self.tensors
    }

    pub(crate) fn tensors_mut(&mut self) -> &mut [Array2<f32>] {
        &mut self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Reset every buffer to zero, keeping allocations.
    pub fn zero(&mut self) {
        for t in &mut self.tensors {
            t.fill(0.0);
        }
    }

    /// L2 norm over all buffers.
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .iter()
            .flat_map(|t| t.iter())
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(|t| t.iter().all(|g| g.is_finite()))
    }

    /// Kernel and bias buffers of the layer whose kernel sits at `slot`.
    pub(crate) fn pair_mut(&mut self, slot: usize) -> (&mut Array2<f32>, &mut Array2<f32>) {
        let (kernel, rest) = self.tensors[slot..].split_at_mut(1);
        (&mut kernel[0], &mut rest[0])
    }
}
