//! Masked-span selection and corruption over the answer region.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::tokenizer::{TokenizerWrapper, CLS_TOKEN, MASK_TOKEN, SEP_TOKEN};

/// Masked-target record, zero-padded to `max_pred`.
///
/// Ids hold the *original* tokens before corruption; positions index into the
/// assembled sequence in selection order (not sequence order); weights are
/// 1.0 for genuine selections and 0.0 for padding slots, which downstream
/// loss code treats as "ignore".
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedSpan {
    pub ids: Vec<u32>,
    pub positions: Vec<u32>,
    pub weights: Vec<f32>,
    /// Number of genuine selections before padding.
    pub num_real: usize,
}

pub struct SpanMasker {
    max_pred: usize,
    mask_prob: f64,
}

impl SpanMasker {
    pub fn new(max_pred: usize, mask_prob: f64) -> Self {
        Self {
            max_pred,
            mask_prob,
        }
    }

    /// Target number of masked positions for an answer of `answer_len` raw
    /// tokens: `min(max_pred, max(1, round(answer_len * mask_prob)))`.
    pub fn target_count(&self, answer_len: usize) -> usize {
        let rounded = (answer_len as f64 * self.mask_prob).round() as usize;
        rounded.max(1).min(self.max_pred)
    }

    /// Corrupt up to [`Self::target_count`] positions of `tokens` at or after
    /// `answer_start`, skipping boundary markers. Each selected position is
    /// replaced by `[MASK]` with probability 0.8, by a random vocabulary word
    /// with probability 0.1, and left unchanged otherwise.
    ///
    /// An answer span with no maskable candidates (e.g. an empty answer whose
    /// tail is all markers) yields a fully zero-padded record.
    pub fn apply(
        &self,
        tokens: &mut [String],
        answer_start: usize,
        answer_len: usize,
        tokenizer: &TokenizerWrapper,
        rng: &mut StdRng,
    ) -> MaskedSpan {
        let mut candidates: Vec<usize> = (answer_start..tokens.len())
            .filter(|&i| tokens[i] != CLS_TOKEN && tokens[i] != SEP_TOKEN)
            .collect();
        candidates.shuffle(rng);
        candidates.truncate(self.target_count(answer_len));

        let originals: Vec<String> = candidates.iter().map(|&pos| tokens[pos].clone()).collect();
        for &pos in &candidates {
            if rng.gen::<f64>() < 0.8 {
                tokens[pos] = MASK_TOKEN.to_string();
            } else if rng.gen::<f64>() < 0.5 {
                tokens[pos] = tokenizer.random_word(rng);
            }
        }

        let num_real = candidates.len();
        let mut ids = tokenizer.index(&originals);
        let mut positions: Vec<u32> = candidates.into_iter().map(|pos| pos as u32).collect();
        let mut weights = vec![1.0f32; num_real];

        ids.resize(self.max_pred, 0);
        positions.resize(self.max_pred, 0);
        weights.resize(self.max_pred, 0.0);

        MaskedSpan {
            ids,
            positions,
            weights,
            num_real,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn answer_sequence(answer_len: usize) -> (Vec<String>, usize) {
        // [CLS] w0 w1 [SEP] answer... [SEP]
        let mut tokens = vec![
            CLS_TOKEN.to_string(),
            "w0".to_string(),
            "w1".to_string(),
            SEP_TOKEN.to_string(),
        ];
        let answer_start = tokens.len();
        for i in 0..answer_len {
            tokens.push(format!("w{}", 2 + i));
        }
        tokens.push(SEP_TOKEN.to_string());
        (tokens, answer_start)
    }

    #[test]
    fn target_count_rounds_and_clamps() {
        let masker = SpanMasker::new(20, 0.15);
        assert_eq!(masker.target_count(20), 3);
        assert_eq!(masker.target_count(0), 1);
        assert_eq!(masker.target_count(1000), 20);
    }

    #[test]
    fn selects_three_of_twenty_and_pads_the_rest() {
        let tokenizer = TokenizerWrapper::for_testing(64);
        let masker = SpanMasker::new(20, 0.15);
        let (mut tokens, answer_start) = answer_sequence(20);
        let mut rng = StdRng::seed_from_u64(11);

        let span = masker.apply(&mut tokens, answer_start, 20, &tokenizer, &mut rng);
        assert_eq!(span.num_real, 3);
        assert_eq!(span.ids.len(), 20);
        assert_eq!(span.positions.len(), 20);
        assert_eq!(span.weights.len(), 20);
        assert_eq!(span.weights.iter().filter(|&&w| w == 1.0).count(), 3);
        assert!(span.weights[3..].iter().all(|&w| w == 0.0));
        assert!(span.ids[3..].iter().all(|&id| id == 0));
    }

    #[test]
    fn positions_stay_within_the_answer_span_and_skip_markers() {
        let tokenizer = TokenizerWrapper::for_testing(64);
        let masker = SpanMasker::new(8, 1.0);
        let (mut tokens, answer_start) = answer_sequence(6);
        let seq_len = tokens.len();
        let mut rng = StdRng::seed_from_u64(12);

        let span = masker.apply(&mut tokens, answer_start, 6, &tokenizer, &mut rng);
        assert_eq!(span.num_real, 6);
        for &pos in &span.positions[..span.num_real] {
            let pos = pos as usize;
            assert!(pos >= answer_start && pos < seq_len);
            assert_ne!(pos, seq_len - 1, "trailing separator was selected");
        }
    }

    #[test]
    fn ids_record_the_original_tokens() {
        let tokenizer = TokenizerWrapper::for_testing(64);
        let masker = SpanMasker::new(8, 1.0);
        let (mut tokens, answer_start) = answer_sequence(5);
        let before = tokens.clone();
        let mut rng = StdRng::seed_from_u64(13);

        let span = masker.apply(&mut tokens, answer_start, 5, &tokenizer, &mut rng);
        for i in 0..span.num_real {
            let pos = span.positions[i] as usize;
            let original_id = tokenizer.index(&[before[pos].clone()])[0];
            assert_eq!(span.ids[i], original_id);
        }
    }

    #[test]
    fn empty_answer_yields_all_padding() {
        let tokenizer = TokenizerWrapper::for_testing(64);
        let masker = SpanMasker::new(4, 0.15);
        let (mut tokens, answer_start) = answer_sequence(0);
        let mut rng = StdRng::seed_from_u64(14);

        // The only position at or after answer_start is the trailing
        // separator, which is never a candidate.
        let span = masker.apply(&mut tokens, answer_start, 0, &tokenizer, &mut rng);
        assert_eq!(span.num_real, 0);
        assert_eq!(span.ids, vec![0; 4]);
        assert_eq!(span.positions, vec![0; 4]);
        assert_eq!(span.weights, vec![0.0; 4]);
    }

    #[test]
    fn corruption_replaces_most_selected_positions() {
        let tokenizer = TokenizerWrapper::for_testing(64);
        let masker = SpanMasker::new(64, 1.0);
        let (mut tokens, answer_start) = answer_sequence(40);
        let before = tokens.clone();
        let mut rng = StdRng::seed_from_u64(15);

        let span = masker.apply(&mut tokens, answer_start, 40, &tokenizer, &mut rng);
        assert_eq!(span.num_real, 40);
        let masked = tokens.iter().filter(|t| *t == MASK_TOKEN).count();
        let changed = (0..tokens.len()).filter(|&i| tokens[i] != before[i]).count();
        // With 40 draws at 0.8/0.1/0.1 a seeded run lands well inside these
        // loose bounds.
        assert!(masked >= 24, "only {masked} positions carry [MASK]");
        assert!(changed <= 40);
    }
}
