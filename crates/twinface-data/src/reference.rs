//! Verification folders: a probe image checked against a fixed set of
//! reference images of one identity.

use crate::pairs::list_images;
use crate::preprocess::{PreprocessError, Preprocessor};
use std::path::{Path, PathBuf};
use thiserror::Error;
use twinface_core::{Image, VerificationEngine, VerificationResult, VerifyError};

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("failed to read reference folder {path}: {source}")]
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
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Every image in `dir`, preprocessed, in sorted path order.
///
/// A folder without images is an [`VerifyError::EmptyReferenceSet`].
pub fn load_reference_set(
    dir: &Path,
    preprocessor: &Preprocessor,
) -> Result<Vec<Image>, ReferenceError> {
    let paths = list_images(dir).map_err(|source| ReferenceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    if paths.is_empty() {
        return Err(VerifyError::EmptyReferenceSet.into());
    }
    let images = paths
        .iter()
        .map(|path| load(preprocessor, path))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(dir = %dir.display(), references = images.len(), "reference set loaded");
    Ok(images)
}

/// Load `probe` and the folder `references`, then run the engine.
///
/// The reference folder is read first so an empty set fails before the
/// probe is decoded.
pub fn verify_directory(
    engine: &VerificationEngine<'_>,
    preprocessor: &Preprocessor,
    probe: &Path,
    references: &Path,
) -> Result<VerificationResult, ReferenceError> {
    let references = load_reference_set(references, preprocessor)?;
    let probe = load(preprocessor, probe)?;
    Ok(engine.verify(&probe, &references)?)
}

fn load(preprocessor: &Preprocessor, path: &Path) -> Result<Image, ReferenceError> {
    preprocessor
        .load(path)
        .map_err(|source| ReferenceError::Preprocess {
            path: path.to_path_buf(),
            source,
        })
}
