//! Layer primitives for the embedding network and classifier head.
//!
//! Activations flow in HWC layout. Convolutions are lowered to one matrix
//! product via im2col, so the forward pass and the recorded backward pass
//! both reduce to `dot` / `general_mat_mul` calls on contiguous buffers.
//!
//! Kernels are stored as 2-D matrices (`fan_in × fan_out`) and biases as
//! `1 × fan_out` rows that broadcast over the patch/sample axis.

use crate::architecture::POOL_SIZE;
use crate::embedding::NetworkError;
use crate::tape::{Record, Tape};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Value passed between layers.
#[derive(Debug, Clone)]
pub(crate) enum Activation {
    /// Feature map, (height, width, channels).
    Spatial(Array3<f32>),
    /// Feature vector.
    Flat(Array1<f32>),
}

impl Activation {
    pub(crate) fn shape(&self) -> Vec<usize> {
        match self {
            Activation::Spatial(a) => a.shape().to_vec(),
            Activation::Flat(a) => a.shape().to_vec(),
        }
    }

    pub(crate) fn into_spatial(self, layer: &'static str) -> Result<Array3<f32>, NetworkError> {
        match self {
            Activation::Spatial(a) => Ok(a),
            Activation::Flat(_) => Err(NetworkError::LayerInput {
                layer,
                expected: "feature map",
                actual: "feature vector",
            }),
        }
    }

    pub(crate) fn into_flat(self, layer: &'static str) -> Result<Array1<f32>, NetworkError> {
        match self {
            Activation::Flat(a) => Ok(a),
            Activation::Spatial(_) => Err(NetworkError::LayerInput {
                layer,
                expected: "feature vector",
                actual: "feature map",
            }),
        }
    }

    fn map(self, f: impl Fn(f32) -> f32) -> Self {
        match self {
            Activation::Spatial(mut a) => {
                a.mapv_inplace(&f);
                Activation::Spatial(a)
            }
            Activation::Flat(mut a) => {
                a.mapv_inplace(&f);
                Activation::Flat(a)
            }
        }
    }

    /// Elementwise combine with a same-shaped activation, writing into `self`.
    pub(crate) fn zip_with(
        mut self,
        other: &Activation,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Self, NetworkError> {
        let (expected, actual) = (other.shape(), self.shape());
        if expected != actual {
            return Err(NetworkError::Shape { expected, actual });
        }
        match (&mut self, other) {
            (Activation::Spatial(a), Activation::Spatial(b)) => {
                a.zip_mut_with(b, |x, &y| *x = f(*x, y))
            }
            (Activation::Flat(a), Activation::Flat(b)) => a.zip_mut_with(b, |x, &y| *x = f(*x, y)),
            _ => return Err(NetworkError::Shape { expected, actual }),
        }
        Ok(self)
    }
}

/// Glorot-uniform initialisation: U(-l, l) with l = sqrt(6 / (fan_in + fan_out)).
pub(crate) fn glorot_uniform<R: Rng + ?Sized>(
    rng: &mut R,
    fan_in: usize,
    fan_out: usize,
    shape: (usize, usize),
) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let dist = Uniform::new(-limit, limit);
    Array2::from_shape_fn(shape, |_| dist.sample(rng))
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Stride-1 valid convolution.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// (kernel * kernel * in_channels, filters), rows ordered (ky, kx, channel).
    kernel: Array2<f32>,
    /// (1, filters)
    bias: Array2<f32>,
    size: usize,
    in_channels: usize,
}

impl Conv2d {
    pub(crate) fn new(size: usize, in_channels: usize, kernel: Array2<f32>) -> Self {
        let filters = kernel.ncols();
        Self {
            kernel,
            bias: Array2::zeros((1, filters)),
            size,
            in_channels,
        }
    }

    pub fn kernel(&self) -> &Array2<f32> {
        &self.kernel
    }

    pub fn bias(&self) -> &Array2<f32> {
        &self.bias
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn filters(&self) -> usize {
        self.kernel.ncols()
    }

    pub(crate) fn params_mut(&mut self) -> [&mut Array2<f32>; 2] {
        [&mut self.kernel, &mut self.bias]
    }

    /// Returns the output feature map and the im2col patch matrix.
    pub(crate) fn forward(&self, x: &Array3<f32>) -> Result<(Array3<f32>, Array2<f32>), NetworkError> {
        let (h, w, c) = x.dim();
        if c != self.in_channels || h < self.size || w < self.size {
            return Err(NetworkError::Shape {
                expected: vec![self.size, self.size, self.in_channels],
                actual: vec![h, w, c],
            });
        }
        let (oh, ow) = (h - self.size + 1, w - self.size + 1);

        let patches = im2col(x, self.size);
        let mut out = patches.dot(&self.kernel);
        out += &self.bias;
        let out = out.into_shape_with_order((oh, ow, self.filters()))?;

        Ok((out, patches))
    }

    /// Accumulates kernel/bias gradients and, when `propagate` is set,
    /// returns the gradient with respect to the layer input.
    pub(crate) fn backward(
        &self,
        patches: &Array2<f32>,
        input_dim: (usize, usize, usize),
        grad_out: &Array3<f32>,
        grad_kernel: &mut Array2<f32>,
        grad_bias: &mut Array2<f32>,
        propagate: bool,
    ) -> Result<Option<Array3<f32>>, NetworkError> {
        let (oh, ow, f) = grad_out.dim();
        let grad_rows = grad_out.to_shape((oh * ow, f))?;

        general_mat_mul(1.0, &patches.t(), &grad_rows, 1.0, grad_kernel);
        *grad_bias += &grad_rows.sum_axis(Axis(0)).insert_axis(Axis(0));

        if !propagate {
            return Ok(None);
        }
        let grad_patches = grad_rows.dot(&self.kernel.t());
        Ok(Some(col2im(&grad_patches, input_dim, self.size)))
    }
}

/// Unfold every k×k×c window of `x` into one row.
fn im2col(x: &Array3<f32>, k: usize) -> Array2<f32> {
    let (h, w, c) = x.dim();
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut cols = Array2::<f32>::zeros((oh * ow, k * k * c));

    for oy in 0..oh {
        for ox in 0..ow {
            let window = x.slice(s![oy..oy + k, ox..ox + k, ..]);
            let mut row = cols.row_mut(oy * ow + ox);
            for (dst, &src) in row.iter_mut().zip(window.iter()) {
                *dst = src;
            }
        }
    }
    cols
}

/// Inverse of [`im2col`]: scatter-add rows back onto overlapping windows.
fn col2im(cols: &Array2<f32>, (h, w, c): (usize, usize, usize), k: usize) -> Array3<f32> {
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut x = Array3::<f32>::zeros((h, w, c));

    for oy in 0..oh {
        for ox in 0..ow {
            let row = cols.row(oy * ow + ox);
            let mut window = x.slice_mut(s![oy..oy + k, ox..ox + k, ..]);
            for (dst, &src) in window.iter_mut().zip(row.iter()) {
                *dst += src;
            }
        }
    }
    x
}

/// 2×2 stride-2 max pooling with "same" padding.
///
/// Returns the pooled map and, for each output element in (y, x, channel)
/// order, the input coordinates of the selected maximum.
pub(crate) fn max_pool(x: &Array3<f32>) -> (Array3<f32>, Vec<(usize, usize)>) {
    let (h, w, c) = x.dim();
    let (oh, ow) = (h.div_ceil(POOL_SIZE), w.div_ceil(POOL_SIZE));
    let mut out = Array3::<f32>::zeros((oh, ow, c));
    let mut argmax = Vec::with_capacity(oh * ow * c);

    for oy in 0..oh {
        let ys = oy * POOL_SIZE..(oy * POOL_SIZE + POOL_SIZE).min(h);
        for ox in 0..ow {
            let xs = ox * POOL_SIZE..(ox * POOL_SIZE + POOL_SIZE).min(w);
            for ch in 0..c {
                let mut best = (ys.start, xs.start);
                let mut best_val = x[[ys.start, xs.start, ch]];
                for y in ys.clone() {
                    for xi in xs.clone() {
                        let v = x[[y, xi, ch]];
                        if v > best_val {
                            best_val = v;
                            best = (y, xi);
                        }
                    }
                }
                out[[oy, ox, ch]] = best_val;
                argmax.push(best);
            }
        }
    }

    (out, argmax)
}

/// Route each pooled gradient back to the element that won the max.
pub(crate) fn max_pool_backward(
    grad_out: &Array3<f32>,
    argmax: &[(usize, usize)],
    input_dim: (usize, usize, usize),
) -> Array3<f32> {
    let (_, ow, c) = grad_out.dim();
    let mut grad_in = Array3::<f32>::zeros(input_dim);
    for ((oy, ox, ch), &g) in grad_out.indexed_iter() {
        let (y, x) = argmax[(oy * ow + ox) * c + ch];
        grad_in[[y, x, ch]] += g;
    }
    grad_in
}

/// Fully connected layer: `y = x · W + b`.
#[derive(Debug, Clone)]
pub struct Dense {
    /// (inputs, outputs)
    kernel: Array2<f32>,
    /// (1, outputs)
    bias: Array2<f32>,
}

impl Dense {
    pub(crate) fn new(kernel: Array2<f32>) -> Self {
        let outputs = kernel.ncols();
        Self {
            kernel,
            bias: Array2::zeros((1, outputs)),
        }
    }

    pub fn kernel(&self) -> &Array2<f32> {
        &self.kernel
    }

    pub fn bias(&self) -> &Array2<f32> {
        &self.bias
    }

    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.kernel.ncols()
    }

    pub(crate) fn params_mut(&mut self) -> [&mut Array2<f32>; 2] {
        [&mut self.kernel, &mut self.bias]
    }

    pub(crate) fn forward(&self, x: &Array1<f32>) -> Result<Array1<f32>, NetworkError> {
        if x.len() != self.inputs() {
            return Err(NetworkError::Shape {
                expected: vec![self.inputs()],
                actual: vec![x.len()],
            });
        }
        let mut out = x.view().insert_axis(Axis(0)).dot(&self.kernel);
        out += &self.bias;
        Ok(out.index_axis_move(Axis(0), 0))
    }

    pub(crate) fn backward(
        &self,
        input: &Array1<f32>,
        grad_out: &Array1<f32>,
        grad_kernel: &mut Array2<f32>,
        grad_bias: &mut Array2<f32>,
        propagate: bool,
    ) -> Option<Array1<f32>> {
        let input_col = input.view().insert_axis(Axis(1));
        let grad_row = grad_out.view().insert_axis(Axis(0));

        general_mat_mul(1.0, &input_col, &grad_row, 1.0, grad_kernel);
        *grad_bias += &grad_row;

        propagate.then(|| self.kernel.dot(grad_out))
    }
}

/// One step of the embedding network's layer sequence.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv(Conv2d),
    Relu,
    MaxPool,
    Flatten,
    Dense(Dense),
    Sigmoid,
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Conv(_) => "conv",
            Layer::Relu => "relu",
            Layer::MaxPool => "max_pool",
            Layer::Flatten => "flatten",
            Layer::Dense(_) => "dense",
            Layer::Sigmoid => "sigmoid",
        }
    }

    /// Apply the layer. When a tape is supplied, push the record the
    /// backward replay needs for this layer.
    pub(crate) fn forward(
        &self,
        index: usize,
        x: Activation,
        tape: Option<&mut Tape>,
    ) -> Result<Activation, NetworkError> {
        match self {
            Layer::Conv(conv) => {
                let x = x.into_spatial("conv")?;
                let input_dim = x.dim();
                let (out, patches) = conv.forward(&x)?;
                if let Some(tape) = tape {
                    tape.push(Record::Conv {
                        layer: index,
                        patches,
                        input_dim,
                    });
                }
                Ok(Activation::Spatial(out))
            }
            Layer::Relu => {
                let out = x.map(|v| v.max(0.0));
                if let Some(tape) = tape {
                    tape.push(Record::Relu {
                        output: out.clone(),
                    });
                }
                Ok(out)
            }
            Layer::MaxPool => {
                let x = x.into_spatial("max_pool")?;
                let (out, argmax) = max_pool(&x);
                if let Some(tape) = tape {
                    tape.push(Record::MaxPool {
                        argmax,
                        input_dim: x.dim(),
                    });
                }
                Ok(Activation::Spatial(out))
            }
            Layer::Flatten => {
                let x = x.into_spatial("flatten")?;
                let input_dim = x.dim();
                let flat = Array1::from_iter(x.iter().copied());
                if let Some(tape) = tape {
                    tape.push(Record::Flatten { input_dim });
                }
                Ok(Activation::Flat(flat))
            }
            Layer::Dense(dense) => {
                let x = x.into_flat("dense")?;
                let out = dense.forward(&x)?;
                if let Some(tape) = tape {
                    tape.push(Record::Dense {
                        layer: index,
                        input: x,
                    });
                }
                Ok(Activation::Flat(out))
            }
            Layer::Sigmoid => {
                let out = x.map(sigmoid);
                if let Some(tape) = tape {
                    tape.push(Record::Sigmoid {
                        output: out.clone(),
                    });
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_im2col_col2im_counts_overlaps() {
        // col2im(ones) counts how many windows cover each pixel.
        let x = Array3::<f32>::ones((3, 3, 1));
        let cols = im2col(&x, 2);
        assert_eq!(cols.dim(), (4, 4));
        let back = col2im(&Array2::ones(cols.dim()), (3, 3, 1), 2);
        assert_eq!(back[[0, 0, 0]], 1.0);
        assert_eq!(back[[1, 1, 0]], 4.0);
        assert_eq!(back[[0, 1, 0]], 2.0);
    }

    #[test]
    fn test_conv_matches_direct_sum() {
        // 2x2 kernel of ones over a 3x3 single-channel ramp.
        let x = Array3::from_shape_vec((3, 3, 1), (0..9).map(|v| v as f32).collect()).unwrap();
        let conv = Conv2d::new(2, 1, Array2::ones((4, 1)));
        let (out, _) = conv.forward(&x).unwrap();
        assert_eq!(out.dim(), (2, 2, 1));
        assert_eq!(out[[0, 0, 0]], 0.0 + 1.0 + 3.0 + 4.0);
        assert_eq!(out[[1, 1, 0]], 4.0 + 5.0 + 7.0 + 8.0);
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::new(2, 3, Array2::ones((12, 1)));
        let x = Array3::<f32>::zeros((4, 4, 1));
        assert!(matches!(conv.forward(&x), Err(NetworkError::Shape { .. })));
    }

    #[test]
    fn test_conv_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = Array3::from_shape_fn((4, 4, 2), |(y, x, c)| (y * 7 + x * 3 + c) as f32 * 0.05);
        let mut conv = Conv2d::new(3, 2, glorot_uniform(&mut rng, 18, 2, (18, 2)));

        // loss = sum(output)
        let (out, patches) = conv.forward(&x).unwrap();
        let mut gk = Array2::zeros(conv.kernel.dim());
        let mut gb = Array2::zeros(conv.bias.dim());
        conv.backward(&patches, x.dim(), &Array3::ones(out.dim()), &mut gk, &mut gb, false)
            .unwrap();

        let eps = 1e-2;
        let base: f32 = out.sum();
        conv.kernel[[5, 1]] += eps;
        let bumped: f32 = conv.forward(&x).unwrap().0.sum();
        let numeric = (bumped - base) / eps;
        assert!((numeric - gk[[5, 1]]).abs() < 1e-2, "numeric {numeric}, analytic {}", gk[[5, 1]]);
        assert_eq!(gb[[0, 0]], 4.0);
    }

    #[test]
    fn test_max_pool_same_padding_and_routing() {
        let x = Array3::from_shape_vec((3, 3, 1), vec![1., 5., 2., 3., 4., 9., 0., 8., 7.]).unwrap();
        let (out, argmax) = max_pool(&x);
        assert_eq!(out.dim(), (2, 2, 1));
        assert_eq!(out[[0, 0, 0]], 5.0);
        assert_eq!(out[[0, 1, 0]], 9.0);
        assert_eq!(out[[1, 0, 0]], 8.0);
        assert_eq!(out[[1, 1, 0]], 7.0);

        let grad = max_pool_backward(&Array3::ones(out.dim()), &argmax, x.dim());
        assert_eq!(grad[[0, 1, 0]], 1.0);
        assert_eq!(grad[[1, 2, 0]], 1.0);
        assert_eq!(grad[[0, 0, 0]], 0.0);
        assert_eq!(grad.sum(), 4.0);
    }

    #[test]
    fn test_dense_forward_backward() {
        let mut dense = Dense::new(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        dense.bias = array![[0.5, -0.5]];
        let x = array![1.0, 0.0, -1.0];
        let y = dense.forward(&x).unwrap();
        assert_eq!(y, array![-3.5, -4.5]);

        let mut gk = Array2::zeros((3, 2));
        let mut gb = Array2::zeros((1, 2));
        let gx = dense
            .backward(&x, &array![1.0, 2.0], &mut gk, &mut gb, true)
            .unwrap();
        assert_eq!(gx, array![5.0, 11.0, 17.0]);
        assert_eq!(gk.row(0), array![1.0, 2.0]);
        assert_eq!(gk.row(2), array![-1.0, -2.0]);
        assert_eq!(gb, array![[1.0, 2.0]]);
    }

    #[test]
    fn test_dense_rejects_wrong_length() {
        let dense = Dense::new(Array2::zeros((3, 2)));
        assert!(dense.forward(&array![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_glorot_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let w = glorot_uniform(&mut rng, 10, 14, (10, 14));
        let limit = (6.0f32 / 24.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(20.0) <= 1.0 && sigmoid(-20.0) >= 0.0);
    }
}
