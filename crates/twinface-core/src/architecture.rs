//! Serialisable description of the embedding network.
//!
//! The description is stored in every checkpoint header so the loader can
//! rebuild the exact layer sequence before filling in parameters.

use crate::embedding::NetworkError;
use serde::{Deserialize, Serialize};

/// Version of the model description schema written into checkpoints.
pub const MODEL_DESCRIPTION_VERSION: u32 = 1;

// --- Canonical architecture ---
const INPUT_SIZE: usize = 100;
const INPUT_CHANNELS: usize = 3;
const EMBEDDING_DIM: usize = 4096;

/// Pooling window and stride.
pub const POOL_SIZE: usize = 2;

/// Parameter tensor name and `[rows, cols]` shape.
pub type ParameterShape = (String, [usize; 2]);

/// One convolution block: valid stride-1 convolution, ReLU, optional 2×2 max-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvBlockSpec {
    pub filters: usize,
    pub kernel: usize,
    pub pool: bool,
}

/// Layer-by-layer description of the embedding network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpec {
    pub input_height: usize,
    pub input_width: usize,
    pub input_channels: usize,
    pub blocks: Vec<ConvBlockSpec>,
    pub embedding_dim: usize,
}

impl Default for EmbeddingSpec {
    /// 100×100×3 input, filters 64 → 128 → 128 → 256 with kernels
    /// 10 → 7 → 4 → 4, pooling after the first three blocks, 4096-d output.
    fn default() -> Self {
        Self {
            input_height: INPUT_SIZE,
            input_width: INPUT_SIZE,
            input_channels: INPUT_CHANNELS,
            blocks: vec![
                ConvBlockSpec { filters: 64, kernel: 10, pool: true },
                ConvBlockSpec { filters: 128, kernel: 7, pool: true },
                ConvBlockSpec { filters: 128, kernel: 4, pool: true },
                ConvBlockSpec { filters: 256, kernel: 4, pool: false },
            ],
            embedding_dim: EMBEDDING_DIM,
        }
    }
}

impl EmbeddingSpec {
    /// (height, width, channels) every input image must have.
    pub fn input_shape(&self) -> (usize, usize, usize) {
        (self.input_height, self.input_width, self.input_channels)
    }

    /// Output shape (height, width, channels) after each block, in order.
    pub fn block_output_shapes(&self) -> Result<Vec<(usize, usize, usize)>, NetworkError> {
        if self.input_height == 0 || self.input_width == 0 || self.input_channels == 0 {
            return Err(NetworkError::Architecture(
                "input dimensions must be non-zero".into(),
            ));
        }
        if self.blocks.is_empty() {
            return Err(NetworkError::Architecture(
                "at least one convolution block is required".into(),
            ));
        }

        let (mut h, mut w) = (self.input_height, self.input_width);
        let mut shapes = Vec::with_capacity(self.blocks.len());

        for (i, block) in self.blocks.iter().enumerate() {
            if block.filters == 0 || block.kernel == 0 {
                return Err(NetworkError::Architecture(format!(
                    "block {i}: filters and kernel must be non-zero"
                )));
            }
            h = conv_output(h, block.kernel).ok_or_else(|| collapsed(i, h, block.kernel))?;
            w = conv_output(w, block.kernel).ok_or_else(|| collapsed(i, w, block.kernel))?;
            if block.pool {
                h = pool_output(h);
                w = pool_output(w);
            }
            shapes.push((h, w, block.filters));
        }

        Ok(shapes)
    }

    /// Length of the flattened feature map fed into the projection layer.
    pub fn flattened_len(&self) -> Result<usize, NetworkError> {
        let shapes = self.block_output_shapes()?;
        let (h, w, c) = shapes[shapes.len() - 1];
        h.checked_mul(w)
            .and_then(|hw| hw.checked_mul(c))
            .ok_or_else(|| NetworkError::Architecture("flattened feature map overflows".into()))
    }

    /// Reject descriptions that cannot produce a network.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.embedding_dim == 0 {
            return Err(NetworkError::Architecture(
                "embedding_dim must be non-zero".into(),
            ));
        }
        self.block_output_shapes().map(|_| ())
    }

    /// Name and shape of every embedding parameter tensor, in slot order.
    ///
    /// Computed from the description alone, with checked arithmetic, so a
    /// description read from an untrusted file can be compared against
    /// stored tensors before anything is allocated.
    pub fn parameter_shapes(&self) -> Result<Vec<ParameterShape>, NetworkError> {
        self.validate()?;

        let mut shapes = Vec::with_capacity(self.blocks.len() * 2 + 2);
        let mut channels = self.input_channels;
        for (i, block) in self.blocks.iter().enumerate() {
            let fan_in = block
                .kernel
                .checked_mul(block.kernel)
                .and_then(|k| k.checked_mul(channels))
                .ok_or_else(|| NetworkError::Architecture(format!("block {i}: kernel overflows")))?;
            shapes.push((format!("embedding.conv{}.kernel", i + 1), [fan_in, block.filters]));
            shapes.push((format!("embedding.conv{}.bias", i + 1), [1, block.filters]));
            channels = block.filters;
        }
        shapes.push((
            "embedding.dense.kernel".to_string(),
            [self.flattened_len()?, self.embedding_dim],
        ));
        shapes.push(("embedding.dense.bias".to_string(), [1, self.embedding_dim]));
        Ok(shapes)
    }

    /// Total trainable parameters of the embedding network (head excluded).
    pub fn parameter_count(&self) -> Result<usize, NetworkError> {
        element_count(&self.parameter_shapes()?)
    }
}

/// Scalar count over `shapes`; an overflow is an architecture error.
pub(crate) fn element_count(shapes: &[ParameterShape]) -> Result<usize, NetworkError> {
    shapes
        .iter()
        .try_fold(0usize, |total, (_, [rows, cols])| {
            rows.checked_mul(*cols).and_then(|n| total.checked_add(n))
        })
        .ok_or_else(|| NetworkError::Architecture("parameter count overflows".into()))
}

/// Valid (unpadded) stride-1 convolution output size.
pub(crate) fn conv_output(size: usize, kernel: usize) -> Option<usize> {
    (size >= kernel).then(|| size - kernel + 1)
}

/// 2×2 stride-2 pooling with "same" padding.
pub(crate) fn pool_output(size: usize) -> usize {
    size.div_ceil(POOL_SIZE)
}

fn collapsed(block: usize, size: usize, kernel: usize) -> NetworkError {
    NetworkError::Architecture(format!(
        "block {block}: kernel {kernel} does not fit spatial size {size}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_resolution_strictly_decreases() {
        let shapes = EmbeddingSpec::default().block_output_shapes().unwrap();
        assert_eq!(
            shapes,
            vec![(46, 46, 64), (20, 20, 128), (9, 9, 128), (6, 6, 256)]
        );
    }

    #[test]
    fn test_canonical_flattened_len() {
        assert_eq!(EmbeddingSpec::default().flattened_len().unwrap(), 9216);
    }

    #[test]
    fn test_canonical_parameter_count() {
        // 19264 + 401536 + 262272 + 524544 + 37752832
        assert_eq!(EmbeddingSpec::default().parameter_count().unwrap(), 38_960_448);
    }

    #[test]
    fn test_pool_rounds_up() {
        assert_eq!(pool_output(91), 46);
        assert_eq!(pool_output(40), 20);
        assert_eq!(pool_output(17), 9);
        assert_eq!(pool_output(1), 1);
    }

    #[test]
    fn test_kernel_too_large_rejected() {
        let spec = EmbeddingSpec {
            input_height: 8,
            input_width: 8,
            input_channels: 3,
            blocks: vec![ConvBlockSpec { filters: 2, kernel: 9, pool: false }],
            embedding_dim: 4,
        };
        assert!(matches!(spec.validate(), Err(NetworkError::Architecture(_))));
    }

    #[test]
    fn test_zero_embedding_dim_rejected() {
        let spec = EmbeddingSpec {
            embedding_dim: 0,
            ..EmbeddingSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_canonical_parameter_shapes() {
        let shapes = EmbeddingSpec::default().parameter_shapes().unwrap();
        assert_eq!(shapes.len(), 10);
        assert_eq!(shapes[0], ("embedding.conv1.kernel".to_string(), [300, 64]));
        assert_eq!(shapes[7], ("embedding.conv4.bias".to_string(), [1, 256]));
        assert_eq!(shapes[8], ("embedding.dense.kernel".to_string(), [9216, 4096]));
    }

    #[test]
    fn test_oversized_description_is_error_not_overflow() {
        let spec = EmbeddingSpec {
            input_height: usize::MAX / 2,
            input_width: usize::MAX / 2,
            input_channels: 1,
            blocks: vec![ConvBlockSpec { filters: 4, kernel: 1, pool: false }],
            embedding_dim: usize::MAX / 4,
        };
        assert!(matches!(spec.flattened_len(), Err(NetworkError::Architecture(_))));
        assert!(matches!(spec.parameter_count(), Err(NetworkError::Architecture(_))));

        let wide = EmbeddingSpec {
            embedding_dim: usize::MAX / 4,
            ..EmbeddingSpec::default()
        };
        let shapes = wide.parameter_shapes().unwrap();
        assert_eq!(shapes[8].1, [9216, usize::MAX / 4]);
        assert!(matches!(wide.parameter_count(), Err(NetworkError::Architecture(_))));
    }

    #[test]
    fn test_spec_json_roundtrip() {
        let spec = EmbeddingSpec::default();
        let json = serde_json::to_string(&spec).unwrap();
        let back: EmbeddingSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
