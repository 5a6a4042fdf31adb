//! Where training and evaluation pairs come from.

use crate::types::{Pair, PairBatch};
use std::convert::Infallible;

/// A re-iterable supply of labelled pairs.
///
/// Every call to [`PairSource::batches`] starts a fresh pass over the same
/// pairs in the same order. The last batch may be shorter than `batch_size`.
pub trait PairSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Total number of pairs in one pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(
        &mut self,
        batch_size: usize,
    ) -> Box<dyn Iterator<Item = Result<PairBatch, Self::Error>> + '_>;
}

/// Pairs that are already decoded and held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPairs {
    pairs: Vec<Pair>,
}

impl InMemoryPairs {
    pub fn new(pairs: Vec<Pair>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }
}

impl FromIterator<Pair> for InMemoryPairs {
    fn from_iter<T: IntoIterator<Item = Pair>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl PairSource for InMemoryPairs {
    type Error = Infallible;

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn batches(
        &mut self,
        batch_size: usize,
    ) -> Box<dyn Iterator<Item = Result<PairBatch, Infallible>> + '_> {
        let size = batch_size.max(1);
        Box::new(
            self.pairs
                .chunks(size)
                .map(|chunk| Ok(PairBatch::new(chunk.to_vec()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Image, Label};
    use std::sync::Arc;

    fn pairs(n: usize) -> InMemoryPairs {
        let img = Arc::new(Image::filled(2, 2, 1, 0.0));
        (0..n)
            .map(|i| Pair::new(img.clone(), img.clone(), Label::from(i % 2 == 0)))
            .collect()
    }

    #[test]
    fn test_last_batch_is_short() {
        let mut source = pairs(37);
        let sizes: Vec<_> = source
            .batches(16)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![16, 16, 5]);
    }

    #[test]
    fn test_repeated_passes_are_identical() {
        let mut source = pairs(5);
        let first: Vec<_> = source.batches(2).map(|b| b.unwrap().targets()).collect();
        let second: Vec<_> = source.batches(2).map(|b| b.unwrap().targets()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        let mut source = InMemoryPairs::default();
        assert!(source.is_empty());
        assert_eq!(source.batches(16).count(), 0);
    }
}
