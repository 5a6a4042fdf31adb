//! Image enumeration, pair labelling and the train/test split.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use twinface_core::Label;

/// Extensions (lowercase) treated as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Two image paths and the label the pair was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairPaths {
    pub anchor: PathBuf,
    pub other: PathBuf,
    pub label: Label,
}

/// Image files directly inside `dir`, sorted by path.
///
/// Subdirectories are ignored; regular files without an image extension
/// are skipped with a warning.
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if is_image(&path) {
            images.push(path);
        } else {
            tracing::warn!(path = %path.display(), "skipping non-image file");
        }
    }
    images.sort();
    tracing::debug!(dir = %dir.display(), count = images.len(), "images listed");
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Anchors zipped with positives (label [`Label::Same`]) followed by
/// anchors zipped with negatives ([`Label::Different`]).
///
/// Each list is first capped at `samples_per_class`; zipping then stops
/// at the shorter side.
pub fn label_pairs(
    anchors: &[PathBuf],
    positives: &[PathBuf],
    negatives: &[PathBuf],
    samples_per_class: usize,
) -> Vec<PairPaths> {
    let anchors = &anchors[..anchors.len().min(samples_per_class)];
    let pairs: Vec<_> = zip_labeled(anchors, positives, samples_per_class, Label::Same)
        .chain(zip_labeled(anchors, negatives, samples_per_class, Label::Different))
        .collect();
    tracing::info!(
        anchors = anchors.len(),
        positives = positives.len().min(samples_per_class),
        negatives = negatives.len().min(samples_per_class),
        pairs = pairs.len(),
        "pairs labeled"
    );
    pairs
}

fn zip_labeled<'a>(
    anchors: &'a [PathBuf],
    others: &'a [PathBuf],
    samples_per_class: usize,
    label: Label,
) -> impl Iterator<Item = PairPaths> + 'a {
    anchors
        .iter()
        .zip(others.iter().take(samples_per_class))
        .map(move |(a, o)| PairPaths {
            anchor: a.clone(),
            other: o.clone(),
            label,
        })
}

/// Shuffle once with `seed`, then put the first `round(len × train_fraction)`
/// pairs in the training split and the rest in the test split.
pub fn split_pairs(
    mut pairs: Vec<PairPaths>,
    train_fraction: f32,
    seed: u64,
) -> (Vec<PairPaths>, Vec<PairPaths>) {
    let mut rng = StdRng::seed_from_u64(seed);
    pairs.shuffle(&mut rng);

    let train_len = (pairs.len() as f32 * train_fraction.clamp(0.0, 1.0)).round() as usize;
    let test = pairs.split_off(train_len.min(pairs.len()));
    (pairs, test)
}
