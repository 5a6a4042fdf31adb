use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A preprocessed image in HWC layout with values scaled to [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub pixels: Array3<f32>,
}

impl Image {
    pub fn new(pixels: Array3<f32>) -> Self {
        Self { pixels }
    }

    /// Uniform image filled with a single value.
    pub fn filled(height: usize, width: usize, channels: usize, value: f32) -> Self {
        Self {
            pixels: Array3::from_elem((height, width, channels), value),
        }
    }

    /// (height, width, channels)
    pub fn shape(&self) -> (usize, usize, usize) {
        self.pixels.dim()
    }
}

/// Embedding vector produced by the embedding network.
///
/// Every entry lies in [0, 1] because the projection layer is sigmoid-bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Array1<f32>,
}

impl Embedding {
    pub fn new(values: Array1<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Identity label of a training pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Anchor paired with a negative sample (label 0).
    Different,
    /// Anchor paired with a positive sample (label 1).
    Same,
}

impl Label {
    /// Regression target used by the loss: 1.0 for same identity, 0.0 otherwise.
    pub fn target(self) -> f32 {
        match self {
            Label::Same => 1.0,
            Label::Different => 0.0,
        }
    }
}

impl From<bool> for Label {
    fn from(same: bool) -> Self {
        if same {
            Label::Same
        } else {
            Label::Different
        }
    }
}

/// An (anchor, other, label) training triplet.
///
/// Images are reference-counted so a decoded image can be shared between
/// the pairs that use it and the dataset cache.
#[derive(Debug, Clone)]
pub struct Pair {
    pub anchor: Arc<Image>,
    pub other: Arc<Image>,
    pub label: Label,
}

impl Pair {
    pub fn new(anchor: Arc<Image>, other: Arc<Image>, label: Label) -> Self {
        Self {
            anchor,
            other,
            label,
        }
    }
}

/// A mini-batch of pairs.
#[derive(Debug, Clone, Default)]
pub struct PairBatch {
    pairs: Vec<Pair>,
}

impl PairBatch {
    pub fn new(pairs: Vec<Pair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Loss targets in batch order.
    pub fn targets(&self) -> Vec<f32> {
        self.pairs.iter().map(|p| p.label.target()).collect()
    }
}

impl FromIterator<Pair> for PairBatch {
    fn from_iter<T: IntoIterator<Item = Pair>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_targets() {
        assert_eq!(Label::Same.target(), 1.0);
        assert_eq!(Label::Different.target(), 0.0);
        assert_eq!(Label::from(true), Label::Same);
        assert_eq!(Label::from(false), Label::Different);
    }

    #[test]
    fn test_batch_targets_follow_pair_order() {
        let img = Arc::new(Image::filled(2, 2, 3, 0.5));
        let batch: PairBatch = [Label::Same, Label::Different, Label::Same]
            .into_iter()
            .map(|label| Pair::new(img.clone(), img.clone(), label))
            .collect();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.targets(), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_label_serde_snake_case() {
        let json = serde_json::to_string(&Label::Different).unwrap();
        assert_eq!(json, "\"different\"");
    }
}
