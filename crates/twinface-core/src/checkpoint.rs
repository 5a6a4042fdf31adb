//! Checkpoint codec for the twin network and (optionally) Adam state.
//!
//! A checkpoint is a safetensors file. Model tensors are stored under their
//! parameter names (`embedding.conv1.kernel`, ..., `head.bias`), Adam
//! moments under `adam.m.<name>` / `adam.v.<name>`, all as `F32` with their
//! `[rows, cols]` shapes. The safetensors metadata map carries one entry,
//! `twinface`, holding the [`CheckpointHeader`] as JSON.
//!
//! The distance layer has no parameters and is not stored; the loader
//! always rebuilds it as L1.

use crate::architecture::{EmbeddingSpec, ParameterShape, MODEL_DESCRIPTION_VERSION};
use crate::embedding::NetworkError;
use crate::optimizer::{Adam, AdamConfig};
use crate::twin::TwinNetwork;
use chrono::{DateTime, Utc};
use ndarray::Array2;
use safetensors::tensor::{SafeTensorError, TensorView};
use safetensors::{Dtype, SafeTensors};
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;
/// File extension used for checkpoints written by the trainer.
pub const CHECKPOINT_EXTENSION: &str = "safetensors";
/// Metadata key under which the JSON header is stored.
pub const METADATA_KEY: &str = "twinface";

/// Width of the little-endian header length that opens a safetensors file.
const HEADER_LEN_BYTES: usize = 8;
const ADAM_M_PREFIX: &str = "adam.m.";
const ADAM_V_PREFIX: &str = "adam.v.";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed safetensors container: {0}")]
    Format(#[from] SafeTensorError),
    #[error("checkpoint has no `twinface` metadata entry")]
    MissingMetadata,
    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported model description version {0}")]
    UnsupportedModelVersion(u32),
    #[error("malformed checkpoint header: {0}")]
    Header(#[from] serde_json::Error),
    #[error("checkpoint truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("checkpoint weights checksum mismatch")]
    ChecksumMismatch,
    #[error("checkpoint is missing tensor {0}")]
    MissingTensor(String),
    #[error("checkpoint tensor {name} has shape {actual:?}, expected {expected:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("checkpoint tensor {name} has dtype {dtype}, expected F32")]
    TensorDtype { name: String, dtype: String },
    #[error("checkpoint contains unknown tensor {0}")]
    UnexpectedTensor(String),
    #[error("checkpoint names tensor {0} more than once")]
    DuplicateTensor(String),
    #[error("checkpoint architecture is invalid: {0}")]
    Architecture(#[from] NetworkError),
}

/// Optimizer metadata; the moment tensors themselves are stored as tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerHeader {
    pub config: AdamConfig,
    pub step: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub format_version: u32,
    pub model_version: u32,
    pub architecture: EmbeddingSpec,
    pub optimizer: Option<OptimizerHeader>,
    /// Last completed epoch (1-based); 0 for an untrained model.
    pub epoch: usize,
    /// SHA-256 (hex) over the tensor bytes in [`expected_tensors`] order.
    pub weights_sha256: String,
    pub created_at: DateTime<Utc>,
    pub run_id: String,
}

impl CheckpointHeader {
    /// Scalar parameter count of the stored model (optimizer state excluded).
    pub fn parameter_count(&self) -> Result<usize, NetworkError> {
        TwinNetwork::parameter_count_for(&self.architecture)
    }

    /// Number of tensors the file must contain.
    pub fn tensor_count(&self) -> Result<usize, NetworkError> {
        Ok(expected_tensors(self)?.len())
    }
}

/// A decoded checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub network: TwinNetwork,
    pub optimizer: Option<Adam>,
}

/// Name and shape of every tensor a checkpoint with `header` holds: the
/// model parameters, then the first moments, then the second moments.
pub fn expected_tensors(header: &CheckpointHeader) -> Result<Vec<ParameterShape>, NetworkError> {
    let params = TwinNetwork::parameter_shapes(&header.architecture)?;
    if header.optimizer.is_none() {
        return Ok(params);
    }
    let moments = |prefix: &str| {
        params
            .iter()
            .map(move |(name, shape)| (format!("{prefix}{name}"), *shape))
            .collect::<Vec<_>>()
    };
    let first = moments(ADAM_M_PREFIX);
    let second = moments(ADAM_V_PREFIX);
    Ok(params.into_iter().chain(first).chain(second).collect())
}

/// Serialise `network` (and optimizer state, if given) into checkpoint bytes.
pub fn encode(
    network: &TwinNetwork,
    optimizer: Option<&Adam>,
    epoch: usize,
    run_id: &str,
) -> Result<Vec<u8>, CheckpointError> {
    let params = network.parameters();
    let mut tensors: Vec<(String, &Array2<f32>)> = params
        .iter()
        .map(|(name, tensor)| (name.clone(), *tensor))
        .collect();
    if let Some(adam) = optimizer {
        for ((name, _), m) in params.iter().zip(adam.first_moments()) {
            tensors.push((format!("{ADAM_M_PREFIX}{name}"), m));
        }
        for ((name, _), v) in params.iter().zip(adam.second_moments()) {
            tensors.push((format!("{ADAM_V_PREFIX}{name}"), v));
        }
    }

    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .into_iter()
        .map(|(name, tensor)| {
            let bytes: Vec<u8> = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut hasher = Sha256::new();
    for (_, _, bytes) in &buffers {
        hasher.update(bytes);
    }

    let header = CheckpointHeader {
        format_version: CHECKPOINT_FORMAT_VERSION,
        model_version: MODEL_DESCRIPTION_VERSION,
        architecture: network.spec().clone(),
        optimizer: optimizer.map(|adam| OptimizerHeader {
            config: *adam.config(),
            step: adam.steps(),
        }),
        epoch,
        weights_sha256: format!("{:x}", hasher.finalize()),
        created_at: Utc::now(),
        run_id: run_id.to_string(),
    };
    let metadata = HashMap::from([(METADATA_KEY.to_string(), serde_json::to_string(&header)?)]);

    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| {
            Ok((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?))
        })
        .collect::<Result<Vec<_>, SafeTensorError>>()?;
    Ok(safetensors::serialize(views, &Some(metadata))?)
}

/// Parse checkpoint bytes back into a network, failing on any structural mismatch.
///
/// Every stored tensor is checked against the shapes the header's
/// architecture implies before any parameter memory is allocated.
pub fn decode(bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
    if let Some(name) = duplicate_tensor_name(bytes) {
        return Err(CheckpointError::DuplicateTensor(name));
    }
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let header = parse_header(metadata.metadata())?;
    let tensors = SafeTensors::deserialize(bytes)?;

    let expected = expected_tensors(&header)?;
    let known: HashSet<&str> = expected.iter().map(|(name, _)| name.as_str()).collect();
    let mut stored = tensors.names();
    stored.sort();
    if let Some(extra) = stored.into_iter().find(|name| !known.contains(name.as_str())) {
        return Err(CheckpointError::UnexpectedTensor(extra.clone()));
    }

    let views = expected
        .iter()
        .map(|(name, shape)| checked_view(&tensors, name, *shape))
        .collect::<Result<Vec<_>, _>>()?;

    let mut hasher = Sha256::new();
    for view in &views {
        hasher.update(view.data());
    }
    if format!("{:x}", hasher.finalize()) != header.weights_sha256 {
        return Err(CheckpointError::ChecksumMismatch);
    }

    let mut arrays: Vec<Array2<f32>> = views
        .iter()
        .zip(&expected)
        .map(|(view, (name, shape))| to_array(view, name, *shape))
        .collect::<Result<_, _>>()?;

    let model_tensors = TwinNetwork::parameter_shapes(&header.architecture)?.len();
    let mut moments = arrays.split_off(model_tensors);

    let mut network = TwinNetwork::zeroed(header.architecture.clone())?;
    for (param, stored) in network.parameters_mut().into_iter().zip(arrays) {
        *param = stored;
    }

    let optimizer = header.optimizer.as_ref().map(|opt| {
        let second = moments.split_off(model_tensors);
        Adam::restore(opt.config, opt.step, moments, second)
    });

    Ok(Checkpoint {
        header,
        network,
        optimizer,
    })
}

/// Write a checkpoint to `path`, going through a temporary file so a
/// crash mid-write never leaves a truncated checkpoint behind.
pub fn save(
    path: &Path,
    network: &TwinNetwork,
    optimizer: Option<&Adam>,
    epoch: usize,
    run_id: &str,
) -> Result<(), CheckpointError> {
    let bytes = encode(network, optimizer, epoch, run_id)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{CHECKPOINT_EXTENSION}.tmp"));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, path)?;

    tracing::info!(
        path = %path.display(),
        epoch,
        bytes = bytes.len(),
        with_optimizer = optimizer.is_some(),
        "checkpoint written"
    );
    Ok(())
}

/// Load and validate a checkpoint from `path`.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let bytes = std::fs::read(path)?;
    let checkpoint = decode(&bytes)?;
    tracing::info!(
        path = %path.display(),
        epoch = checkpoint.header.epoch,
        run_id = %checkpoint.header.run_id,
        "checkpoint loaded"
    );
    Ok(checkpoint)
}

/// Read only the header, without touching the tensor data.
pub fn read_header(path: &Path) -> Result<CheckpointHeader, CheckpointError> {
    let mut file = std::fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN_BYTES as u64 {
        return Err(CheckpointError::Truncated {
            expected: HEADER_LEN_BYTES as u64,
            actual: file_len,
        });
    }

    let mut prefix = [0u8; HEADER_LEN_BYTES];
    file.read_exact(&mut prefix)?;
    let header_len = u64::from_le_bytes(prefix);
    let truncated = CheckpointError::Truncated {
        expected: header_len.saturating_add(HEADER_LEN_BYTES as u64),
        actual: file_len,
    };
    if header_len > file_len - HEADER_LEN_BYTES as u64 {
        return Err(truncated);
    }
    let header_len = usize::try_from(header_len).map_err(|_| truncated)?;

    let mut raw = vec![0u8; header_len];
    file.read_exact(&mut raw)?;
    let raw: RawHeader = serde_json::from_slice(&raw)?;
    parse_header(&raw.metadata)
}

/// Conventional file name for the checkpoint written after `epoch`.
pub fn checkpoint_file_name(epoch: usize) -> String {
    format!("checkpoint_epoch_{epoch}.{CHECKPOINT_EXTENSION}")
}

/// The `__metadata__` entry of a safetensors JSON header; tensor entries
/// are skipped.
#[derive(Deserialize)]
struct RawHeader {
    #[serde(rename = "__metadata__", default)]
    metadata: Option<HashMap<String, String>>,
}

/// Keys of a safetensors JSON header in file order, repeats included.
struct HeaderKeys(Vec<String>);

impl<'de> Deserialize<'de> for HeaderKeys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeysVisitor;

        impl<'de> Visitor<'de> for KeysVisitor {
            type Value = HeaderKeys;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a safetensors header object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<HeaderKeys, A::Error> {
                let mut keys = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    map.next_value::<IgnoredAny>()?;
                    keys.push(key);
                }
                Ok(HeaderKeys(keys))
            }
        }

        deserializer.deserialize_map(KeysVisitor)
    }
}

/// First tensor name that appears twice in the raw header, if any.
///
/// Parsed headers are maps, so a repeated name would otherwise collapse
/// into one entry. Unparseable input is left for the safetensors reader
/// to reject.
fn duplicate_tensor_name(bytes: &[u8]) -> Option<String> {
    let prefix: [u8; HEADER_LEN_BYTES] = bytes.get(..HEADER_LEN_BYTES)?.try_into().ok()?;
    let end = usize::try_from(u64::from_le_bytes(prefix))
        .ok()?
        .checked_add(HEADER_LEN_BYTES)?;
    let HeaderKeys(keys) = serde_json::from_slice(bytes.get(HEADER_LEN_BYTES..end)?).ok()?;
    let mut seen = HashSet::new();
    keys.into_iter().find(|key| !seen.insert(key.clone()))
}

fn parse_header(
    metadata: &Option<HashMap<String, String>>,
) -> Result<CheckpointHeader, CheckpointError> {
    let json = metadata
        .as_ref()
        .and_then(|m| m.get(METADATA_KEY))
        .ok_or(CheckpointError::MissingMetadata)?;
    let header: CheckpointHeader = serde_json::from_str(json)?;
    if header.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(header.format_version));
    }
    if header.model_version != MODEL_DESCRIPTION_VERSION {
        return Err(CheckpointError::UnsupportedModelVersion(header.model_version));
    }
    Ok(header)
}

fn checked_view<'a>(
    tensors: &SafeTensors<'a>,
    name: &str,
    [rows, cols]: [usize; 2],
) -> Result<TensorView<'a>, CheckpointError> {
    let view = tensors
        .tensor(name)
        .map_err(|_| CheckpointError::MissingTensor(name.to_string()))?;
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointError::TensorDtype {
            name: name.to_string(),
            dtype: format!("{:?}", view.dtype()),
        });
    }
    if view.shape() != [rows, cols] {
        return Err(CheckpointError::TensorShape {
            name: name.to_string(),
            expected: vec![rows, cols],
            actual: view.shape().to_vec(),
        });
    }
    Ok(view)
}

fn to_array(
    view: &TensorView<'_>,
    name: &str,
    [rows, cols]: [usize; 2],
) -> Result<Array2<f32>, CheckpointError> {
    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let actual = vec![values.len()];
    Array2::from_shape_vec((rows, cols), values).map_err(|_| CheckpointError::TensorShape {
        name: name.to_string(),
        expected: vec![rows, cols],
        actual,
    })
}
