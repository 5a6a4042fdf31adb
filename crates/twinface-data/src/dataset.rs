//! Lazily decoded, cached pair dataset.
//!
//! The first pass over a [`PairDataset`] decodes every referenced image
//! once and keeps the result; later passes only read the cache.

use crate::pairs::{label_pairs, list_images, split_pairs, PairPaths};
use crate::preprocess::{PreprocessError, Preprocessor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use twinface_core::{Image, Pair, PairBatch, PairSource};

// --- Named constants ---
pub const DEFAULT_SAMPLES_PER_CLASS: usize = 300;
pub const DEFAULT_TRAIN_FRACTION: f32 = 0.7;
pub const DEFAULT_SPLIT_SEED: u64 = 42;

const ANCHOR_DIR: &str = "anchor";
const POSITIVE_DIR: &str = "positive";
const NEGATIVE_DIR: &str = "negative";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to preprocess {path}")]
    Preprocess {
        path: PathBuf,
        #[source]
        source: PreprocessError,
    },
    #[error("no labeled pairs could be built from {0}")]
    NoPairs(PathBuf),
}

/// Where the three image folders live and how pairs are drawn from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub anchor_dir: PathBuf,
    pub positive_dir: PathBuf,
    pub negative_dir: PathBuf,
    pub samples_per_class: usize,
    pub train_fraction: f32,
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self::with_root(Path::new("data"))
    }
}

impl DatasetConfig {
    /// `root/anchor`, `root/positive` and `root/negative`, other fields default.
    pub fn with_root(root: &Path) -> Self {
        Self {
            anchor_dir: root.join(ANCHOR_DIR),
            positive_dir: root.join(POSITIVE_DIR),
            negative_dir: root.join(NEGATIVE_DIR),
            samples_per_class: DEFAULT_SAMPLES_PER_CLASS,
            train_fraction: DEFAULT_TRAIN_FRACTION,
            seed: DEFAULT_SPLIT_SEED,
        }
    }

    /// List, label and split the configured folders into train and test sets.
    pub fn load_splits(
        &self,
        preprocessor: Preprocessor,
    ) -> Result<(PairDataset, PairDataset), DatasetError> {
        let list = |dir: &Path| {
            list_images(dir).map_err(|source| DatasetError::Io {
                path: dir.to_path_buf(),
                source,
            })
        };
        let anchors = list(&self.anchor_dir)?;
        let positives = list(&self.positive_dir)?;
        let negatives = list(&self.negative_dir)?;

        let pairs = label_pairs(&anchors, &positives, &negatives, self.samples_per_class);
        if pairs.is_empty() {
            return Err(DatasetError::NoPairs(self.anchor_dir.clone()));
        }
        let (train, test) = split_pairs(pairs, self.train_fraction, self.seed);
        tracing::info!(train = train.len(), test = test.len(), "dataset split");

        Ok((
            PairDataset::new(train, preprocessor),
            PairDataset::new(test, preprocessor),
        ))
    }
}

/// Labeled image pairs, decoded on first use.
#[derive(Debug)]
pub struct PairDataset {
    pairs: Vec<PairPaths>,
    preprocessor: Preprocessor,
    cache: HashMap<PathBuf, Arc<Image>>,
    decodes: usize,
}

impl PairDataset {
    pub fn new(pairs: Vec<PairPaths>, preprocessor: Preprocessor) -> Self {
        Self {
            pairs,
            preprocessor,
            cache: HashMap::new(),
            decodes: 0,
        }
    }

    pub fn pairs(&self) -> &[PairPaths] {
        &self.pairs
    }

    /// Number of images decoded from disk so far.
    pub fn decode_count(&self) -> usize {
        self.decodes
    }

    /// Number of distinct images held in memory.
    pub fn cached_images(&self) -> usize {
        self.cache.len()
    }

    /// One pass over the pairs in order, `batch_size` at a time.
    pub fn iter_batches(&mut self, batch_size: usize) -> Batches<'_> {
        Batches {
            dataset: self,
            batch_size: batch_size.max(1),
            next: 0,
        }
    }

    fn image(&mut self, path: &Path) -> Result<Arc<Image>, DatasetError> {
        if let Some(image) = self.cache.get(path) {
            return Ok(image.clone());
        }
        let image = self
            .preprocessor
            .load(path)
            .map(Arc::new)
            .map_err(|source| DatasetError::Preprocess {
                path: path.to_path_buf(),
                source,
            })?;
        self.decodes += 1;
        self.cache.insert(path.to_path_buf(), image.clone());
        Ok(image)
    }

    fn batch(&mut self, range: std::ops::Range<usize>) -> Result<PairBatch, DatasetError> {
        let mut pairs = Vec::with_capacity(range.len());
        for index in range {
            let PairPaths {
                anchor,
                other,
                label,
            } = self.pairs[index].clone();
            pairs.push(Pair::new(self.image(&anchor)?, self.image(&other)?, label));
        }
        Ok(PairBatch::new(pairs))
    }
}

/// Batches of one pass; yields the trailing short batch too.
///
/// After a decode error the iterator is exhausted.
pub struct Batches<'a> {
    dataset: &'a mut PairDataset,
    batch_size: usize,
    next: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<PairBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.dataset.pairs.len();
        if self.next >= len {
            return None;
        }
        let start = self.next;
        let end = (start + self.batch_size).min(len);
        let batch = self.dataset.batch(start..end);
        self.next = if batch.is_ok() { end } else { len };
        tracing::debug!(start, end, ok = batch.is_ok(), "batch assembled");
        Some(batch)
    }
}

impl PairSource for PairDataset {
    type Error = DatasetError;

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn batches(
        &mut self,
        batch_size: usize,
    ) -> Box<dyn Iterator<Item = Result<PairBatch, DatasetError>> + '_> {
        Box::new(self.iter_batches(batch_size))
    }
}
