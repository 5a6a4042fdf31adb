//! L1 distance layer: elementwise `|a - b|` between two embeddings.

use crate::embedding::NetworkError;
use crate::types::Embedding;
use ndarray::{Array1, Zip};

/// Stateless, parameter-free distance between the two branch embeddings.
///
/// The output keeps one entry per embedding dimension so the classifier
/// head can weight dimensions independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Distance;

impl L1Distance {
    pub fn forward(a: &Embedding, b: &Embedding) -> Result<Array1<f32>, NetworkError> {
        check_lengths(a, b)?;
        Ok(Zip::from(&a.values)
            .and(&b.values)
            .map_collect(|&x, &y| (x - y).abs()))
    }

    /// Gradients with respect to `a` and `b` given the gradient of the distance.
    ///
    /// The subgradient at `a == b` is taken as zero.
    pub(crate) fn backward(
        a: &Embedding,
        b: &Embedding,
        grad: &Array1<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let grad_a = Zip::from(&a.values)
            .and(&b.values)
            .and(grad)
            .map_collect(|&x, &y, &g| {
                if x > y {
                    g
                } else if x < y {
                    -g
                } else {
                    0.0
                }
            });
        let grad_b = grad_a.mapv(|g| -g);
        (grad_a, grad_b)
    }
}

fn check_lengths(a: &Embedding, b: &Embedding) -> Result<(), NetworkError> {
    if a.len() != b.len() {
        return Err(NetworkError::Shape {
            expected: vec![a.len()],
            actual: vec![b.len()],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn emb(values: Array1<f32>) -> Embedding {
        Embedding::new(values)
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = emb(array![0.1, 0.9, 0.5, 0.0]);
        let b = emb(array![0.4, 0.2, 0.5, 1.0]);
        assert_eq!(
            L1Distance::forward(&a, &b).unwrap(),
            L1Distance::forward(&b, &a).unwrap()
        );
    }

    #[test]
    fn test_self_distance_is_zero_vector() {
        let a = emb(array![0.3, 0.7, 0.25]);
        let d = L1Distance::forward(&a, &a).unwrap();
        assert_eq!(d.len(), 3);
        assert!(d.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_distance_keeps_dimensionality() {
        let a = emb(Array1::zeros(4096));
        let b = emb(Array1::ones(4096));
        let d = L1Distance::forward(&a, &b).unwrap();
        assert_eq!(d.len(), 4096);
        assert!(d.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_length_mismatch_is_shape_error() {
        let a = emb(Array1::zeros(3));
        let b = emb(Array1::zeros(4));
        assert!(matches!(L1Distance::forward(&a, &b), Err(NetworkError::Shape { .. })));
    }

    #[test]
    fn test_backward_signs_and_zero_at_equality() {
        let a = emb(array![0.9, 0.1, 0.5]);
        let b = emb(array![0.2, 0.6, 0.5]);
        let (ga, gb) = L1Distance::backward(&a, &b, &array![2.0, 3.0, 4.0]);
        assert_eq!(ga, array![2.0, -3.0, 0.0]);
        assert_eq!(gb, array![-2.0, 3.0, -0.0]);
    }
}
