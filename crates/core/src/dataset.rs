//! Dataset JSON loading and epoch iteration.
//!
//! Records are parsed once, tokenized, and cached as [`Instance`]s for the
//! dataset lifetime; encoding happens lazily per draw. Batch collation
//! (stacking per-instance tensors) belongs to the training loader, so a
//! batch here is a plain `Vec<EncodedExample>`.

use std::collections::BTreeMap;
use std::path::Path;

use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::encoder::{EncodeError, InstanceEncoder};
use crate::instance::{EncodedExample, ImageChoice, Instance, QaPair};
use crate::store::RegionFeatureStore;
use crate::tokenizer::TokenizerWrapper;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("gold region features for {id} are missing from the store")]
    MissingGoldFeature { id: u64 },

    #[error("image metadata for {id} is missing")]
    MissingMetadata { id: u64 },

    #[error("tokenize error: {0}")]
    Tokenize(String),
}

/// Which instance shape to build from the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetTask {
    Filter,
    Generation,
}

#[derive(Debug, Deserialize)]
struct RawFact {
    fact: String,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    split: String,
    #[serde(rename = "Q")]
    question: String,
    #[serde(rename = "A")]
    answer: String,
    #[serde(rename = "SupportingFacts", default)]
    supporting_facts: Vec<RawFact>,
    #[serde(rename = "DistractorFacts", default)]
    distractor_facts: Vec<RawFact>,
    #[serde(rename = "GoldIds", default)]
    gold_ids: Vec<u64>,
    #[serde(rename = "DistractorIds", default)]
    distractor_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct RawImageMeta {
    name: String,
    #[serde(default)]
    description: String,
}

/// In-memory instance list for one split of a dataset.
pub struct QaDataset {
    instances: Vec<Instance>,
}

impl QaDataset {
    /// Load text-evidence instances from a dataset JSON keyed by sample id.
    pub fn load_text(
        path: &Path,
        splits: &[String],
        sample_cap: Option<usize>,
        task: DatasetTask,
        tokenizer: &TokenizerWrapper,
    ) -> Result<Self, DatasetError> {
        let records: BTreeMap<String, RawRecord> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;

        let mut instances = Vec::new();
        for record in records.values() {
            if !splits.iter().any(|s| s == &record.split) {
                continue;
            }
            if sample_cap.is_some_and(|cap| instances.len() >= cap) {
                break;
            }
            let qa = tokenize_qa(tokenizer, record)?;
            let gold = tokenize_facts(tokenizer, &record.supporting_facts)?;
            let instance = match task {
                DatasetTask::Filter => Instance::FilterText {
                    gold,
                    distractors: tokenize_facts(tokenizer, &record.distractor_facts)?,
                    qa,
                },
                DatasetTask::Generation => Instance::GenerationText { facts: gold, qa },
            };
            instances.push(instance);
        }
        tracing::info!(
            instances = instances.len(),
            samples = records.len(),
            "loaded text dataset"
        );
        Ok(Self { instances })
    }

    /// Load image-evidence instances. Gold evidence with no persisted
    /// features is fatal; a distractor with no persisted features is skipped
    /// with a warning, keeping captions and features aligned.
    pub fn load_image(
        dataset_path: &Path,
        metadata_path: &Path,
        store: &dyn RegionFeatureStore,
        splits: &[String],
        sample_cap: Option<usize>,
        task: DatasetTask,
        tokenizer: &TokenizerWrapper,
    ) -> Result<Self, DatasetError> {
        let records: BTreeMap<String, RawRecord> =
            serde_json::from_str(&std::fs::read_to_string(dataset_path)?)?;
        let metadata: BTreeMap<String, RawImageMeta> =
            serde_json::from_str(&std::fs::read_to_string(metadata_path)?)?;

        let mut instances = Vec::new();
        for record in records.values() {
            if !splits.iter().any(|s| s == &record.split) {
                continue;
            }
            if sample_cap.is_some_and(|cap| instances.len() >= cap) {
                break;
            }
            let qa = tokenize_qa(tokenizer, record)?;

            for &id in &record.gold_ids {
                if !store.contains(id) {
                    return Err(DatasetError::MissingGoldFeature { id });
                }
            }

            let instance = match task {
                DatasetTask::Filter => {
                    let mut gold = Vec::with_capacity(record.gold_ids.len());
                    for &id in &record.gold_ids {
                        gold.push(ImageChoice {
                            region_id: id,
                            caption: caption_tokens(&metadata, id, tokenizer)?,
                        });
                    }
                    let mut distractors = Vec::new();
                    for &id in &record.distractor_ids {
                        if !store.contains(id) {
                            tracing::warn!(id, "skipping distractor with missing region features");
                            continue;
                        }
                        distractors.push(ImageChoice {
                            region_id: id,
                            caption: caption_tokens(&metadata, id, tokenizer)?,
                        });
                    }
                    Instance::FilterImage {
                        gold,
                        distractors,
                        qa,
                    }
                }
                DatasetTask::Generation => Instance::GenerationImage {
                    regions: record.gold_ids.clone(),
                    qa,
                },
            };
            instances.push(instance);
        }
        tracing::info!(
            instances = instances.len(),
            samples = records.len(),
            "loaded image dataset"
        );
        Ok(Self { instances })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// One epoch of encoded batches: `ceil(len / batch_size)` batches, each
    /// slot drawn through the sampling policy.
    pub fn epoch_iter<'a>(
        &'a self,
        encoder: &'a InstanceEncoder,
        batch_size: usize,
        rng: StdRng,
    ) -> EpochIter<'a> {
        assert!(batch_size > 0, "batch_size must be > 0");
        let remaining_batches = self.len().div_ceil(batch_size);
        EpochIter {
            dataset: self,
            encoder,
            policy: WithReplacementSampler,
            batch_size,
            remaining_batches,
            rng,
        }
    }
}

/// Uniform draw **with replacement** per batch slot.
///
/// This mirrors randomly indexing into the instance list on every draw: an
/// epoch touches `len` slots but is not a permutation, so some instances
/// repeat and others go unseen. Swap the policy to change that.
pub struct WithReplacementSampler;

impl WithReplacementSampler {
    pub fn draw(&self, len: usize, rng: &mut StdRng) -> usize {
        rng.gen_range(0..len)
    }
}

/// Lazy batch iterator over one epoch.
pub struct EpochIter<'a> {
    dataset: &'a QaDataset,
    encoder: &'a InstanceEncoder,
    policy: WithReplacementSampler,
    batch_size: usize,
    remaining_batches: usize,
    rng: StdRng,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Vec<EncodedExample>, EncodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_batches == 0 {
            return None;
        }
        self.remaining_batches -= 1;
        let mut batch = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let idx = self.policy.draw(self.dataset.len(), &mut self.rng);
            match self.encoder.encode(&self.dataset.instances[idx], &mut self.rng) {
                Ok(example) => batch.push(example),
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(batch))
    }
}

fn tokenize(tokenizer: &TokenizerWrapper, text: &str) -> Result<Vec<String>, DatasetError> {
    tokenizer
        .tokenize(text)
        .map_err(|e| DatasetError::Tokenize(e.to_string()))
}

fn tokenize_qa(tokenizer: &TokenizerWrapper, record: &RawRecord) -> Result<QaPair, DatasetError> {
    Ok(QaPair::new(
        tokenize(tokenizer, &record.question)?,
        tokenize(tokenizer, &record.answer)?,
    ))
}

fn tokenize_facts(
    tokenizer: &TokenizerWrapper,
    facts: &[RawFact],
) -> Result<Vec<Vec<String>>, DatasetError> {
    facts
        .iter()
        .map(|f| tokenize(tokenizer, &f.fact))
        .collect()
}

/// Caption for an image id: metadata name + description, underscores
/// replaced by spaces, trimmed, tokenized.
fn caption_tokens(
    metadata: &BTreeMap<String, RawImageMeta>,
    id: u64,
    tokenizer: &TokenizerWrapper,
) -> Result<Vec<String>, DatasetError> {
    let meta = metadata
        .get(&id.to_string())
        .ok_or(DatasetError::MissingMetadata { id })?;
    let caption = format!("{}{}", meta.name, meta.description).replace('_', " ");
    tokenize(tokenizer, caption.trim())
}
