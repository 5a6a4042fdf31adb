//! twinface-data — turning image folders into training pairs and
//! verification inputs.
//!
//! Images are decoded with the `image` crate, resized to the network's
//! input size and cached after their first use.

pub mod dataset;
pub mod pairs;
pub mod preprocess;
pub mod reference;

pub use dataset::{Batches, DatasetConfig, DatasetError, PairDataset};
pub use pairs::{label_pairs, list_images, split_pairs, PairPaths};
pub use preprocess::{PreprocessError, Preprocessor};
pub use reference::{load_reference_set, verify_directory, ReferenceError};
