//! Instance-to-tensor encoding.
//!
//! One encoder instance holds read-only configuration and collaborator
//! handles; every stochastic decision flows through the caller's generator,
//! so encoding is a pure function of (instance, rng state) and safe to run
//! from parallel batch workers.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use thiserror::Error;

use crate::attention::AttentionMaskBuilder;
use crate::config::{ConfigError, EncoderConfig};
use crate::instance::{
    EncodedExample, ImageChoice, Instance, QaPair, NO_NEXT_SENTENCE, S2S_TASK_IDX,
};
use crate::mask::SpanMasker;
use crate::sampler::FilterNegativeSampler;
use crate::store::{RegionFeatureStore, StoreError};
use crate::tokenizer::{TokenizerWrapper, CLS_TOKEN, PAD_ID, SEP_TOKEN, UNK_TOKEN};
use crate::truncate::{truncate_token_pair, TruncateStats};
use crate::visual::{normalize_record, pad_regions, NormalizedRegions, VisualError};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("filter instance has no gold or distractor evidence")]
    EmptyChoiceSet,

    #[error("{gold} gold choices exceed the filter width {width}")]
    ChoiceOverflow { gold: usize, width: usize },

    #[error("image-context instance but no region-feature store is configured")]
    NoFeatureStore,

    #[error("image-context generation instance has no regions")]
    EmptyRegionSet,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Visual(#[from] VisualError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub struct InstanceEncoder {
    config: EncoderConfig,
    tokenizer: Arc<TokenizerWrapper>,
    store: Option<Arc<dyn RegionFeatureStore>>,
    masks: AttentionMaskBuilder,
    masker: SpanMasker,
    sampler: FilterNegativeSampler,
    device: Device,
}

impl InstanceEncoder {
    /// Build an encoder for text-only instances. Budget relationships are
    /// validated here; a bad configuration never reaches encode time.
    pub fn new(config: EncoderConfig, tokenizer: Arc<TokenizerWrapper>) -> Result<Self, ConfigError> {
        config.validate()?;
        let masks = AttentionMaskBuilder::new(config.max_len);
        let masker = SpanMasker::new(config.max_pred, config.mask_prob);
        let sampler = FilterNegativeSampler::new(config.filter_num_choices);
        Ok(Self {
            config,
            tokenizer,
            store: None,
            masks,
            masker,
            sampler,
            device: Device::Cpu,
        })
    }

    /// Attach the region-feature store image-context instances load from.
    pub fn with_feature_store(mut self, store: Arc<dyn RegionFeatureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn encode(
        &self,
        instance: &Instance,
        rng: &mut StdRng,
    ) -> Result<EncodedExample, EncodeError> {
        match instance {
            Instance::FilterText {
                gold,
                distractors,
                qa,
            } => self.encode_filter_text(gold, distractors, qa, rng),
            Instance::FilterImage {
                gold,
                distractors,
                qa,
            } => self.encode_filter_image(gold, distractors, qa, rng),
            Instance::GenerationText { facts, qa } => self.encode_generation_text(facts, qa, rng),
            Instance::GenerationImage { regions, qa } => {
                self.encode_generation_image(regions, qa, rng)
            }
        }
    }

    // ─── Filter branches ─────────────────────────────────────────────────

    fn encode_filter_text(
        &self,
        gold: &[Vec<String>],
        distractors: &[Vec<String>],
        qa: &QaPair,
        rng: &mut StdRng,
    ) -> Result<EncodedExample, EncodeError> {
        let set = self.sampler.sample(gold, distractors, rng);
        self.check_choice_set(set.len(), gold.len())?;

        let mut id_rows = Vec::with_capacity(set.len());
        let mut segment_rows = Vec::with_capacity(set.len());
        let mut mask_rows = Vec::with_capacity(set.len());
        for fact in &set.choices {
            let (tokens_a, tokens_b, stats) = truncate_token_pair(
                fact.clone(),
                qa_side(qa),
                self.config.max_len_a,
                self.config.max_len_b,
                &self.config.truncate_config,
                rng,
            );
            let q_len = effective_question_len(qa, &stats, tokens_b.len());
            let tokens = build_tokens(&tokens_a, &tokens_b);

            id_rows.push(self.id_tensor(self.index_and_pad(&tokens))?);
            segment_rows.push(self.id_tensor(self.segment_ids(tokens_a.len(), tokens_b.len()))?);
            mask_rows.push(
                self.masks
                    .filter_text(tokens_a.len() + 2 + q_len, &self.device)?,
            );
        }

        let logit_mask = self.sampler.logit_mask(id_rows.len());
        let labels = self.sampler.pad_labels(&set.labels);
        let width = self.sampler.num_choices();
        pad_with_last(&mut id_rows, width);
        pad_with_last(&mut segment_rows, width);
        pad_with_last(&mut mask_rows, width);

        Ok(EncodedExample {
            input_ids: Tensor::stack(&id_rows, 0)?,
            segment_ids: Tensor::stack(&segment_rows, 0)?,
            attention_mask: Tensor::stack(&mask_rows, 0)?,
            masked_ids: None,
            masked_pos: None,
            masked_weights: None,
            next_sentence_label: NO_NEXT_SENTENCE,
            is_filter_task: true,
            filter_label: Some(Tensor::from_vec(labels, width, &self.device)?),
            logit_mask: Some(Tensor::from_vec(logit_mask, width, &self.device)?),
            task_idx: S2S_TASK_IDX,
            visual_features: None,
            visual_position: None,
            context_is_image: false,
        })
    }

    fn encode_filter_image(
        &self,
        gold: &[ImageChoice],
        distractors: &[ImageChoice],
        qa: &QaPair,
        rng: &mut StdRng,
    ) -> Result<EncodedExample, EncodeError> {
        let store = self.feature_store()?;
        let set = self.sampler.sample(gold, distractors, rng);
        self.check_choice_set(set.len(), gold.len())?;

        let vis_budget = self.config.max_len_img_cxt;
        let mut id_rows = Vec::with_capacity(set.len());
        let mut segment_rows = Vec::with_capacity(set.len());
        let mut mask_rows = Vec::with_capacity(set.len());
        let mut feature_rows = Vec::with_capacity(set.len());
        let mut position_rows = Vec::with_capacity(set.len());
        for choice in &set.choices {
            let (caption, tokens_b, stats) = truncate_token_pair(
                choice.caption.clone(),
                qa_side(qa),
                self.config.max_len_cxt_meta(),
                self.config.max_len_b,
                &self.config.truncate_config,
                rng,
            );
            // The a side is the fixed block of visual slots followed by the
            // truncated caption.
            let mut tokens_a = vec![UNK_TOKEN.to_string(); vis_budget];
            tokens_a.extend(caption);
            let q_len = effective_question_len(qa, &stats, tokens_b.len());
            let tokens = build_tokens(&tokens_a, &tokens_b);

            id_rows.push(self.id_tensor(self.index_and_pad(&tokens))?);
            segment_rows.push(self.id_tensor(self.segment_ids(tokens_a.len(), tokens_b.len()))?);
            mask_rows.push(self.masks.filter_image(
                vis_budget,
                1 + vis_budget,
                tokens_a.len() + 2 + q_len,
                &self.device,
            )?);

            let record = store.load(choice.region_id)?;
            let normalized = normalize_record(&record)?;
            let (features, position) = pad_regions(&normalized, vis_budget)?;
            feature_rows.push(features);
            position_rows.push(position);
        }

        let logit_mask = self.sampler.logit_mask(id_rows.len());
        let labels = self.sampler.pad_labels(&set.labels);
        let width = self.sampler.num_choices();
        pad_with_last(&mut id_rows, width);
        pad_with_last(&mut segment_rows, width);
        pad_with_last(&mut mask_rows, width);
        pad_with_last(&mut feature_rows, width);
        pad_with_last(&mut position_rows, width);

        Ok(EncodedExample {
            input_ids: Tensor::stack(&id_rows, 0)?,
            segment_ids: Tensor::stack(&segment_rows, 0)?,
            attention_mask: Tensor::stack(&mask_rows, 0)?,
            masked_ids: None,
            masked_pos: None,
            masked_weights: None,
            next_sentence_label: NO_NEXT_SENTENCE,
            is_filter_task: true,
            filter_label: Some(Tensor::from_vec(labels, width, &self.device)?),
            logit_mask: Some(Tensor::from_vec(logit_mask, width, &self.device)?),
            task_idx: S2S_TASK_IDX,
            visual_features: Some(Tensor::stack(&feature_rows, 0)?),
            visual_position: Some(Tensor::stack(&position_rows, 0)?),
            context_is_image: true,
        })
    }

    // ─── Generation branches ─────────────────────────────────────────────

    fn encode_generation_text(
        &self,
        facts: &[Vec<String>],
        qa: &QaPair,
        rng: &mut StdRng,
    ) -> Result<EncodedExample, EncodeError> {
        let (tokens_a, tokens_b, stats) = truncate_token_pair(
            facts.concat(),
            qa_side(qa),
            self.config.max_len_a,
            self.config.max_len_b,
            &self.config.truncate_config,
            rng,
        );
        let q_len = effective_question_len(qa, &stats, tokens_b.len());
        let len_a = tokens_a.len();
        let len_b = tokens_b.len();
        let mut tokens = build_tokens(&tokens_a, &tokens_b);
        let prefix_end = len_a + 2 + q_len;

        let span = self
            .masker
            .apply(&mut tokens, prefix_end, qa.answer.len(), &self.tokenizer, rng);
        let attention_mask = self.masks.generation(prefix_end, tokens.len(), &self.device)?;

        Ok(EncodedExample {
            input_ids: self.id_tensor(self.index_and_pad(&tokens))?,
            segment_ids: self.id_tensor(self.segment_ids(len_a, len_b))?,
            attention_mask,
            masked_ids: Some(Tensor::from_vec(span.ids, self.config.max_pred, &self.device)?),
            masked_pos: Some(Tensor::from_vec(
                span.positions,
                self.config.max_pred,
                &self.device,
            )?),
            masked_weights: Some(Tensor::from_vec(
                span.weights,
                self.config.max_pred,
                &self.device,
            )?),
            next_sentence_label: NO_NEXT_SENTENCE,
            is_filter_task: false,
            filter_label: None,
            logit_mask: None,
            task_idx: S2S_TASK_IDX,
            visual_features: None,
            visual_position: None,
            context_is_image: false,
        })
    }

    fn encode_generation_image(
        &self,
        regions: &[u64],
        qa: &QaPair,
        rng: &mut StdRng,
    ) -> Result<EncodedExample, EncodeError> {
        let store = self.feature_store()?;
        if regions.is_empty() {
            return Err(EncodeError::EmptyRegionSet);
        }

        let vis_budget = self.config.max_len_img_cxt;
        let (tokens_a, tokens_b, stats) = truncate_token_pair(
            vec![UNK_TOKEN.to_string(); vis_budget],
            qa_side(qa),
            vis_budget,
            self.config.max_len_b,
            &self.config.truncate_config,
            rng,
        );
        let q_len = effective_question_len(qa, &stats, tokens_b.len());
        let len_a = tokens_a.len();
        let len_b = tokens_b.len();
        let mut tokens = build_tokens(&tokens_a, &tokens_b);
        let prefix_end = len_a + 2 + q_len;

        let span = self
            .masker
            .apply(&mut tokens, prefix_end, qa.answer.len(), &self.tokenizer, rng);
        let attention_mask = self.masks.generation(prefix_end, tokens.len(), &self.device)?;

        let mut region_sets = Vec::with_capacity(regions.len());
        for &id in regions {
            let record = store.load(id)?;
            region_sets.push(normalize_record(&record)?);
        }
        let merged = NormalizedRegions::concat(&region_sets)?;
        // Generation packs every gold region set into the a-side budget.
        let (features, position) = pad_regions(&merged, self.config.max_len_a)?;

        Ok(EncodedExample {
            input_ids: self.id_tensor(self.index_and_pad(&tokens))?,
            segment_ids: self.id_tensor(self.segment_ids(len_a, len_b))?,
            attention_mask,
            masked_ids: Some(Tensor::from_vec(span.ids, self.config.max_pred, &self.device)?),
            masked_pos: Some(Tensor::from_vec(
                span.positions,
                self.config.max_pred,
                &self.device,
            )?),
            masked_weights: Some(Tensor::from_vec(
                span.weights,
                self.config.max_pred,
                &self.device,
            )?),
            next_sentence_label: NO_NEXT_SENTENCE,
            is_filter_task: false,
            filter_label: None,
            logit_mask: None,
            task_idx: S2S_TASK_IDX,
            visual_features: Some(features),
            visual_position: Some(position),
            context_is_image: true,
        })
    }

    // ─── Shared helpers ──────────────────────────────────────────────────

    fn feature_store(&self) -> Result<&dyn RegionFeatureStore, EncodeError> {
        self.store.as_deref().ok_or(EncodeError::NoFeatureStore)
    }

    fn check_choice_set(&self, realized: usize, gold: usize) -> Result<(), EncodeError> {
        if realized == 0 {
            return Err(EncodeError::EmptyChoiceSet);
        }
        if realized > self.sampler.num_choices() {
            return Err(EncodeError::ChoiceOverflow {
                gold,
                width: self.sampler.num_choices(),
            });
        }
        Ok(())
    }

    fn index_and_pad(&self, tokens: &[String]) -> Vec<u32> {
        let mut ids = self.tokenizer.index(tokens);
        ids.resize(self.config.max_len, PAD_ID);
        ids
    }

    fn segment_ids(&self, len_a: usize, len_b: usize) -> Vec<u32> {
        let (seg_a, seg_b) = self.config.segment_pair();
        let mut segments = vec![seg_a; len_a + 2];
        segments.extend(std::iter::repeat(seg_b).take(len_b + 1));
        segments.resize(self.config.max_len, 0);
        segments
    }

    fn id_tensor(&self, values: Vec<u32>) -> Result<Tensor, EncodeError> {
        Ok(Tensor::from_vec(values, self.config.max_len, &self.device)?)
    }
}

/// `[CLS] a [SEP] b [SEP]`.
fn build_tokens(tokens_a: &[String], tokens_b: &[String]) -> Vec<String> {
    let mut tokens = Vec::with_capacity(tokens_a.len() + tokens_b.len() + 3);
    tokens.push(CLS_TOKEN.to_string());
    tokens.extend_from_slice(tokens_a);
    tokens.push(SEP_TOKEN.to_string());
    tokens.extend_from_slice(tokens_b);
    tokens.push(SEP_TOKEN.to_string());
    tokens
}

fn qa_side(qa: &QaPair) -> Vec<String> {
    let mut side = qa.question.clone();
    side.extend_from_slice(&qa.answer);
    side
}

/// Question tokens surviving truncation: front drops on the b side eat into
/// the question first.
fn effective_question_len(qa: &QaPair, stats: &TruncateStats, len_b: usize) -> usize {
    qa.question.len().saturating_sub(stats.b.front).min(len_b)
}

/// Duplicate the final row into the remaining choice slots; the logit mask
/// marks those slots invalid.
fn pad_with_last<T: Clone>(rows: &mut Vec<T>, width: usize) {
    while rows.len() < width {
        let last = rows.last().expect("choice rows are non-empty").clone();
        rows.push(last);
    }
}
