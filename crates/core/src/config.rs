use serde::Deserialize;
use thiserror::Error;

use crate::truncate::TruncateConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "length budgets overflow: max_len_a {max_len_a} + max_len_b {max_len_b} \
         + 3 marker slots > max_len {max_len}"
    )]
    LengthBudget {
        max_len_a: usize,
        max_len_b: usize,
        max_len: usize,
    },

    #[error("visual budget {max_len_img_cxt} exceeds the context budget {max_len_a}")]
    VisualBudget {
        max_len_img_cxt: usize,
        max_len_a: usize,
    },

    #[error("len_vis_input {len_vis_input} exceeds the visual budget {max_len_img_cxt}")]
    VisInput {
        len_vis_input: usize,
        max_len_img_cxt: usize,
    },

    #[error("mask_prob {mask_prob} is outside [0, 1]")]
    MaskProb { mask_prob: f64 },

    #[error("filter_num_choices must be at least 1")]
    FilterWidth,
}

/// Knobs for the instance-to-tensor transformation.
///
/// Budgets are validated eagerly by [`EncoderConfig::validate`]; an invalid
/// relationship is a construction-time error, never a runtime surprise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Maximum number of masked answer positions per example.
    pub max_pred: usize,
    /// Fraction of the answer selected for corruption.
    pub mask_prob: f64,
    /// Total sequence length every id/segment tensor is padded to.
    pub max_len: usize,
    /// Context-side (a) token budget.
    pub max_len_a: usize,
    /// Question+answer-side (b) token budget.
    pub max_len_b: usize,
    /// Visual tokens contributed by a single image region set.
    pub len_vis_input: usize,
    /// Fixed visual-context budget: slots reserved for image regions
    /// regardless of how many real regions an instance has.
    pub max_len_img_cxt: usize,
    /// Segment-id scheme: `true` numbers the pair {4, 5}, `false` {0, 1}.
    pub new_segment_ids: bool,
    /// Choice-set width for the filter task.
    pub filter_num_choices: usize,
    pub truncate_config: TruncateConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_pred: 20,
            mask_prob: 0.15,
            max_len: 512,
            max_len_a: 400,
            max_len_b: 109,
            len_vis_input: 100,
            max_len_img_cxt: 200,
            new_segment_ids: true,
            filter_num_choices: 10,
            truncate_config: TruncateConfig::default(),
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // The assembled sequence is [CLS] a [SEP] b [SEP]; the three marker
        // slots count against max_len.
        if self.max_len_a + self.max_len_b + 3 > self.max_len {
            return Err(ConfigError::LengthBudget {
                max_len_a: self.max_len_a,
                max_len_b: self.max_len_b,
                max_len: self.max_len,
            });
        }
        if self.max_len_img_cxt > self.max_len_a {
            return Err(ConfigError::VisualBudget {
                max_len_img_cxt: self.max_len_img_cxt,
                max_len_a: self.max_len_a,
            });
        }
        // The budget must hold at least one full region set.
        if self.len_vis_input > self.max_len_img_cxt {
            return Err(ConfigError::VisInput {
                len_vis_input: self.len_vis_input,
                max_len_img_cxt: self.max_len_img_cxt,
            });
        }
        if !(0.0..=1.0).contains(&self.mask_prob) {
            return Err(ConfigError::MaskProb {
                mask_prob: self.mask_prob,
            });
        }
        if self.filter_num_choices == 0 {
            return Err(ConfigError::FilterWidth);
        }
        Ok(())
    }

    /// Segment ids assigned to the (a, b) sides.
    pub fn segment_pair(&self) -> (u32, u32) {
        if self.new_segment_ids {
            (4, 5)
        } else {
            (0, 1)
        }
    }

    /// Caption budget left after the visual slots in an image-context a side.
    pub fn max_len_cxt_meta(&self) -> usize {
        self.max_len_a - self.max_len_img_cxt
    }
}
