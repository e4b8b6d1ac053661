//! Read-only, by-id lookup of persisted region-feature records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use thiserror::Error;

use crate::visual::{RegionFeatureRecord, VisualError};

/// Tensor names a persisted record must carry.
pub const FEATURES_TENSOR: &str = "features";
pub const CLASS_PROBS_TENSOR: &str = "class_probs";
pub const BOXES_TENSOR: &str = "boxes";
pub const SCORES_TENSOR: &str = "scores";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("region features for {id} not found at {}", path.display())]
    Missing { id: u64, path: PathBuf },

    #[error("record {id} is missing the `{name}` tensor")]
    MissingTensor { id: u64, name: &'static str },

    #[error("record {id} is invalid: {source}")]
    Invalid { id: u64, source: VisualError },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// By-id lookup of region-feature records. Strictly read-only: the store
/// never creates or mutates persisted records.
pub trait RegionFeatureStore: Send + Sync {
    fn load(&self, id: u64) -> Result<RegionFeatureRecord, StoreError>;

    /// Cheap existence probe, used at dataset-construction time to filter
    /// evidence references so encode-time loads cannot miss.
    fn contains(&self, id: u64) -> bool;
}

/// One `<root>/<id>.safetensors` file per record, four named tensors each.
pub struct SafetensorsFeatureStore {
    root: PathBuf,
    device: Device,
}

impl SafetensorsFeatureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            device: Device::Cpu,
        }
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{id}.safetensors"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RegionFeatureStore for SafetensorsFeatureStore {
    fn load(&self, id: u64) -> Result<RegionFeatureRecord, StoreError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StoreError::Missing { id, path });
        }
        let mut tensors = candle_core::safetensors::load(&path, &self.device)?;
        let mut take = |name: &'static str| -> Result<Tensor, StoreError> {
            tensors
                .remove(name)
                .ok_or(StoreError::MissingTensor { id, name })
        };
        let features = take(FEATURES_TENSOR)?;
        let class_probs = take(CLASS_PROBS_TENSOR)?;
        let boxes = take(BOXES_TENSOR)?;
        let scores = take(SCORES_TENSOR)?;
        RegionFeatureRecord::new(features, class_probs, boxes, scores)
            .map_err(|source| StoreError::Invalid { id, source })
    }

    fn contains(&self, id: u64) -> bool {
        self.record_path(id).exists()
    }
}

/// In-memory store, primarily for tests and small experiments.
#[derive(Default)]
pub struct MemoryFeatureStore {
    records: HashMap<u64, RegionFeatureRecord>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, record: RegionFeatureRecord) {
        self.records.insert(id, record);
    }
}

impl RegionFeatureStore for MemoryFeatureStore {
    fn load(&self, id: u64) -> Result<RegionFeatureRecord, StoreError> {
        self.records.get(&id).cloned().ok_or(StoreError::Missing {
            id,
            path: PathBuf::from("<memory>"),
        })
    }

    fn contains(&self, id: u64) -> bool {
        self.records.contains_key(&id)
    }
}
