//! Model bundle loading: parsed config plus raw weight bytes
//!
//! The weights are opaque to this crate; they are handed verbatim to the
//! session builder. Local files are memory-mapped so large models never get
//! copied through the heap; remote fetchers can hand over owned bytes
//! instead via [`ModelBundle::new`].

use super::ModelConfig;
use crate::{Error, Result};
use memmap2::Mmap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw bytes backed either by a memory map or an owned buffer.
enum Blob {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Blob {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Blob::Mapped(mmap) => mmap,
            Blob::Owned(bytes) => bytes,
        }
    }

    fn map_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Load(format!("failed to open {:?}: {}", path, e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Load(format!("failed to map {:?}: {}", path, e)))?;
        Ok(Blob::Mapped(mmap))
    }
}

/// A loaded model: parsed configuration plus session weights.
pub struct ModelBundle {
    /// Parsed model configuration
    pub config: ModelConfig,
    weights: Blob,
    external_data: Option<Blob>,
}

impl ModelBundle {
    /// Build a bundle from already-fetched weight bytes
    pub fn new(config: ModelConfig, weights: Vec<u8>) -> Self {
        Self {
            config,
            weights: Blob::Owned(weights),
            external_data: None,
        }
    }

    /// Attach an auxiliary external-data blob (weights stored out-of-file)
    pub fn with_external_data(mut self, bytes: Vec<u8>) -> Self {
        self.external_data = Some(Blob::Owned(bytes));
        self
    }

    /// Load config.json and memory-map the weights from a model directory
    pub fn from_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let config = ModelConfig::from_dir(model_dir)?;

        let weights_path = find_weights_file(model_dir)?;
        info!("Mapping weights from {:?}", weights_path);
        let weights = Blob::map_file(&weights_path)?;

        // Large exports keep tensor data in a sidecar `<weights>.data` file.
        let mut data_path = weights_path.into_os_string();
        data_path.push(".data");
        let data_path = PathBuf::from(data_path);
        let external_data = if data_path.exists() {
            debug!("Mapping external data from {:?}", data_path);
            Some(Blob::map_file(&data_path)?)
        } else {
            None
        };

        Ok(Self {
            config,
            weights,
            external_data,
        })
    }

    /// Raw session weight bytes
    pub fn weights(&self) -> &[u8] {
        self.weights.as_bytes()
    }

    /// Auxiliary external-data bytes, if the export carries any
    pub fn external_data(&self) -> Option<&[u8]> {
        self.external_data.as_ref().map(Blob::as_bytes)
    }
}

/// Pick the weights file from a model directory: `model.onnx` if present,
/// otherwise the lexically-first `.onnx` file.
fn find_weights_file(model_dir: &Path) -> Result<PathBuf> {
    let preferred = model_dir.join("model.onnx");
    if preferred.exists() {
        return Ok(preferred);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(model_dir)
        .map_err(|e| Error::Load(format!("failed to read {:?}: {}", model_dir, e)))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "onnx"))
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::Load(format!("no weights file found in {:?}", model_dir)))
}
