//! Instance and encoded-example types.

use candle_core::Tensor;

/// Legacy next-sentence label slot carried for schema compatibility.
pub const NO_NEXT_SENTENCE: i64 = -1;

/// Projection-head index for the sequence-to-sequence objective.
pub const S2S_TASK_IDX: i64 = 3;

/// Tokenized question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaPair {
    pub question: Vec<String>,
    pub answer: Vec<String>,
}

impl QaPair {
    pub fn new(question: Vec<String>, answer: Vec<String>) -> Self {
        Self { question, answer }
    }
}

/// One image-evidence candidate: a region-feature reference paired with its
/// caption tokens, so the caption/feature alignment holds by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChoice {
    pub region_id: u64,
    pub caption: Vec<String>,
}

/// A single training instance, tagged by task mode and context type.
///
/// The four variants replace a boolean (do_filter, is_image) pair so every
/// encoder dispatch is exhaustively checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instance {
    /// Filter objective over text facts.
    FilterText {
        gold: Vec<Vec<String>>,
        distractors: Vec<Vec<String>>,
        qa: QaPair,
    },
    /// Filter objective over image regions.
    FilterImage {
        gold: Vec<ImageChoice>,
        distractors: Vec<ImageChoice>,
        qa: QaPair,
    },
    /// Answer generation conditioned on gold text facts.
    GenerationText {
        facts: Vec<Vec<String>>,
        qa: QaPair,
    },
    /// Answer generation conditioned on gold image regions.
    GenerationImage { regions: Vec<u64>, qa: QaPair },
}

impl Instance {
    pub fn is_filter_task(&self) -> bool {
        matches!(self, Self::FilterText { .. } | Self::FilterImage { .. })
    }

    pub fn context_is_image(&self) -> bool {
        matches!(self, Self::FilterImage { .. } | Self::GenerationImage { .. })
    }

    pub fn qa(&self) -> &QaPair {
        match self {
            Self::FilterText { qa, .. }
            | Self::FilterImage { qa, .. }
            | Self::GenerationText { qa, .. }
            | Self::GenerationImage { qa, .. } => qa,
        }
    }
}

/// Fixed-shape output of one encode call.
///
/// Field order is the schema contract with training code: token ids, segment
/// ids, attention mask, masked-target ids/positions/weights, the legacy
/// next-sentence label (always −1), the filter-task flag, filter labels,
/// logit-validity mask, task index, visual features, visual position
/// encodings, and the context-is-image flag. Fields a branch does not
/// produce are `None`, never omitted, so batch assembly can treat every
/// branch uniformly.
///
/// Shapes: id/segment tensors are `(max_len,)` `U32` — `(choices, max_len)`
/// for the filter task; attention masks `(max_len, max_len)` `U8` with a
/// leading choice dimension for the filter task; masked-target tensors
/// `(max_pred,)`; labels and logit mask `(filter_num_choices,)` `F32`;
/// visual tensors carry the configured region budget as their leading
/// region dimension.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    pub input_ids: Tensor,
    pub segment_ids: Tensor,
    pub attention_mask: Tensor,
    pub masked_ids: Option<Tensor>,
    pub masked_pos: Option<Tensor>,
    pub masked_weights: Option<Tensor>,
    pub next_sentence_label: i64,
    pub is_filter_task: bool,
    pub filter_label: Option<Tensor>,
    pub logit_mask: Option<Tensor>,
    pub task_idx: i64,
    pub visual_features: Option<Tensor>,
    pub visual_position: Option<Tensor>,
    pub context_is_image: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qa() -> QaPair {
        QaPair::new(vec!["w0".into()], vec!["w1".into()])
    }

    #[test]
    fn variant_flags_match_the_legacy_boolean_pair() {
        let filter_text = Instance::FilterText {
            gold: vec![],
            distractors: vec![],
            qa: qa(),
        };
        assert!(filter_text.is_filter_task());
        assert!(!filter_text.context_is_image());

        let gen_image = Instance::GenerationImage {
            regions: vec![3],
            qa: qa(),
        };
        assert!(!gen_image.is_filter_task());
        assert!(gen_image.context_is_image());
    }

    #[test]
    fn qa_accessor_reaches_every_variant() {
        let instances = [
            Instance::FilterText {
                gold: vec![],
                distractors: vec![],
                qa: qa(),
            },
            Instance::FilterImage {
                gold: vec![],
                distractors: vec![],
                qa: qa(),
            },
            Instance::GenerationText {
                facts: vec![],
                qa: qa(),
            },
            Instance::GenerationImage {
                regions: vec![],
                qa: qa(),
            },
        ];
        for instance in &instances {
            assert_eq!(instance.qa().question, vec!["w0".to_string()]);
        }
    }
}
