//! Shared test utilities: a word-level tokenizer, synthetic region records,
//! and deterministic fixtures for encoder tests.

use candle_core::{Device, Tensor};

use crate::tokenizer::TokenizerWrapper;
use crate::visual::{RegionFeatureRecord, CLASS_PROB_WIDTH};

/// Word-level tokenizer over `w0..w63` plus the reserved markers.
pub fn test_tokenizer() -> TokenizerWrapper {
    TokenizerWrapper::for_testing(64)
}

/// Deterministic region record: staggered, well-formed boxes, uniform class
/// probabilities, and features filled per-region so padding is detectable.
pub fn synthetic_record(num_regions: usize, feature_dim: usize) -> RegionFeatureRecord {
    let device = Device::Cpu;

    let mut boxes = Vec::with_capacity(num_regions * 4);
    for i in 0..num_regions {
        let i = i as f32;
        boxes.extend_from_slice(&[10.0 * i, 5.0 * i, 10.0 * i + 40.0, 5.0 * i + 30.0]);
    }
    let boxes = Tensor::from_vec(boxes, (num_regions, 4), &device).expect("boxes tensor");

    let class_probs = Tensor::from_vec(
        vec![1.0 / CLASS_PROB_WIDTH as f32; num_regions * CLASS_PROB_WIDTH],
        (num_regions, CLASS_PROB_WIDTH),
        &device,
    )
    .expect("class probs tensor");

    let mut features = Vec::with_capacity(num_regions * feature_dim);
    for i in 0..num_regions {
        features.extend(std::iter::repeat(0.25 + i as f32 * 0.01).take(feature_dim));
    }
    let features =
        Tensor::from_vec(features, (num_regions, feature_dim), &device).expect("feature tensor");

    let scores: Vec<f32> = (0..num_regions).map(|i| 0.9 - 0.05 * i as f32).collect();
    let scores = Tensor::from_vec(scores, num_regions, &device).expect("score tensor");

    RegionFeatureRecord::new(features, class_probs, boxes, scores).expect("valid record")
}
