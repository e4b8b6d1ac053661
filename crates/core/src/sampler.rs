//! Negative sampling and placeholder padding for the filter task.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A permuted gold+distractor choice set with per-position labels.
#[derive(Debug, Clone)]
pub struct ChoiceSet<T> {
    pub choices: Vec<T>,
    /// 1.0 where the choice came from the gold set, 0.0 otherwise.
    pub labels: Vec<f32>,
}

impl<T> ChoiceSet<T> {
    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }
}

/// Assembles fixed-width choice sets for the filter objective.
///
/// Distractors are subsampled without replacement down to the width left
/// over by the gold items; the concatenated set is uniformly permuted and
/// labeled by pre-permutation index. When the distractor pool cannot fill
/// the width, the encoder duplicates its last real choice into the empty
/// slots and [`FilterNegativeSampler::logit_mask`] neutralizes them with
/// −inf, so every batch item carries exactly `num_choices` slots.
pub struct FilterNegativeSampler {
    num_choices: usize,
}

impl FilterNegativeSampler {
    pub fn new(num_choices: usize) -> Self {
        Self { num_choices }
    }

    pub fn num_choices(&self) -> usize {
        self.num_choices
    }

    /// Sample distractors, permute gold+distractors, and label positions.
    pub fn sample<T: Clone>(&self, gold: &[T], distractors: &[T], rng: &mut StdRng) -> ChoiceSet<T> {
        let sample_size = self
            .num_choices
            .saturating_sub(gold.len())
            .min(distractors.len());
        let picked = rand::seq::index::sample(rng, distractors.len(), sample_size);

        let mut pool: Vec<T> = gold.to_vec();
        pool.extend(picked.into_iter().map(|i| distractors[i].clone()));

        let mut perm: Vec<usize> = (0..pool.len()).collect();
        perm.shuffle(rng);

        let choices = perm.iter().map(|&p| pool[p].clone()).collect();
        let labels = perm
            .iter()
            .map(|&p| if p < gold.len() { 1.0 } else { 0.0 })
            .collect();
        ChoiceSet { choices, labels }
    }

    /// Logit-validity vector for a realized choice count: 1.0 for real
    /// slots, −inf for placeholder slots.
    pub fn logit_mask(&self, num_real: usize) -> Vec<f32> {
        let mut mask = vec![1.0f32; num_real.min(self.num_choices)];
        mask.resize(self.num_choices, f32::NEG_INFINITY);
        mask
    }

    /// Labels padded to the configured width; placeholder slots are labeled
    /// 0.0 and already neutralized by the logit mask.
    pub fn pad_labels(&self, labels: &[f32]) -> Vec<f32> {
        let mut padded = labels.to_vec();
        padded.resize(self.num_choices, 0.0);
        padded
    }
}
