//! Region-feature records and geometry normalization.
//!
//! A record holds the detector outputs for one image: pooled features, class
//! probabilities, predicted boxes, detection scores. Normalization scales
//! box coordinates into the image extent estimated from the boxes
//! themselves, derives a clamped relative area, and layer-normalizes the
//! 6-wide geometry vector and the 1601-wide class vector before
//! concatenating them into the per-region position encoding.

use candle_core::{DType, Tensor, D};
use thiserror::Error;

/// Width of the detector's class-probability vector.
pub const CLASS_PROB_WIDTH: usize = 1601;
/// Width of the geometry vector: normalized box (4) + area (1) + score (1).
pub const GEOMETRY_WIDTH: usize = 6;
/// Width of the per-region position encoding.
pub const POSITION_WIDTH: usize = GEOMETRY_WIDTH + CLASS_PROB_WIDTH;

/// Added to the extent estimates so an exactly-zero maximum cannot divide by
/// zero. Estimates that stay non-positive after this are data corruption.
const EXTENT_EPS: f32 = 1e-5;

/// Layer-norm stabilizer.
const NORM_EPS: f64 = 1e-5;

#[derive(Debug, Error)]
pub enum VisualError {
    #[error("degenerate box extent: {axis} estimate {value} must be > 0")]
    DegenerateExtent { axis: &'static str, value: f32 },

    #[error("{field} has {rows} rows, expected {expected}")]
    RowMismatch {
        field: &'static str,
        rows: usize,
        expected: usize,
    },

    #[error("{field} has width {got}, expected {expected}")]
    BadWidth {
        field: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{num_regions} regions exceed the region budget {budget}")]
    RegionOverflow { num_regions: usize, budget: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Detector outputs for one image, validated at construction and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct RegionFeatureRecord {
    /// Pooled features, `(num_regions, feature_dim)`.
    pub features: Tensor,
    /// Class probabilities, `(num_regions, 1601)`.
    pub class_probs: Tensor,
    /// Predicted boxes `(x1, y1, x2, y2)`, `(num_regions, 4)`.
    pub boxes: Tensor,
    /// Detection confidence, `(num_regions,)`.
    pub scores: Tensor,
}

impl RegionFeatureRecord {
    pub fn new(
        features: Tensor,
        class_probs: Tensor,
        boxes: Tensor,
        scores: Tensor,
    ) -> Result<Self, VisualError> {
        let (num_regions, _) = features.dims2()?;
        let (cls_rows, cls_width) = class_probs.dims2()?;
        if cls_rows != num_regions {
            return Err(VisualError::RowMismatch {
                field: "class_probs",
                rows: cls_rows,
                expected: num_regions,
            });
        }
        if cls_width != CLASS_PROB_WIDTH {
            return Err(VisualError::BadWidth {
                field: "class_probs",
                got: cls_width,
                expected: CLASS_PROB_WIDTH,
            });
        }
        let (box_rows, box_width) = boxes.dims2()?;
        if box_rows != num_regions {
            return Err(VisualError::RowMismatch {
                field: "boxes",
                rows: box_rows,
                expected: num_regions,
            });
        }
        if box_width != 4 {
            return Err(VisualError::BadWidth {
                field: "boxes",
                got: box_width,
                expected: 4,
            });
        }
        let score_rows = scores.dims1()?;
        if score_rows != num_regions {
            return Err(VisualError::RowMismatch {
                field: "scores",
                rows: score_rows,
                expected: num_regions,
            });
        }
        Ok(Self {
            features,
            class_probs,
            boxes,
            scores,
        })
    }

    pub fn num_regions(&self) -> usize {
        self.features.dims().first().copied().unwrap_or(0)
    }
}

/// Normalized per-region tensors ready for budget padding.
#[derive(Debug, Clone)]
pub struct NormalizedRegions {
    /// Pooled features cast to f32, `(num_regions, feature_dim)`.
    pub features: Tensor,
    /// Position encodings, `(num_regions, 6 + 1601)`.
    pub position: Tensor,
}

impl NormalizedRegions {
    /// Concatenate several region sets along the region axis.
    pub fn concat(sets: &[NormalizedRegions]) -> Result<Self, VisualError> {
        let features: Vec<&Tensor> = sets.iter().map(|s| &s.features).collect();
        let position: Vec<&Tensor> = sets.iter().map(|s| &s.position).collect();
        Ok(Self {
            features: Tensor::cat(&features, 0)?,
            position: Tensor::cat(&position, 0)?,
        })
    }

    pub fn num_regions(&self) -> Result<usize, VisualError> {
        Ok(self.features.dim(0)?)
    }
}

/// Scale boxes into the extent estimated from their own maxima and derive
/// the clamped relative area.
fn normalized_boxes_and_area(raw_boxes: &Tensor) -> Result<(Tensor, Tensor), VisualError> {
    let device = raw_boxes.device();
    let boxes = raw_boxes.to_dtype(DType::F32)?;

    let x_cols = Tensor::cat(&[&boxes.narrow(1, 0, 1)?, &boxes.narrow(1, 2, 1)?], 1)?;
    let y_cols = Tensor::cat(&[&boxes.narrow(1, 1, 1)?, &boxes.narrow(1, 3, 1)?], 1)?;
    let w_est = x_cols.flatten_all()?.max(0)?.to_scalar::<f32>()? + EXTENT_EPS;
    let h_est = y_cols.flatten_all()?.max(0)?.to_scalar::<f32>()? + EXTENT_EPS;
    if w_est <= 0.0 {
        return Err(VisualError::DegenerateExtent {
            axis: "width",
            value: w_est,
        });
    }
    if h_est <= 0.0 {
        return Err(VisualError::DegenerateExtent {
            axis: "height",
            value: h_est,
        });
    }

    let scale = Tensor::from_vec(
        vec![1.0 / w_est, 1.0 / h_est, 1.0 / w_est, 1.0 / h_est],
        (1, 4),
        device,
    )?;
    let boxes = boxes.broadcast_mul(&scale)?;

    let x1 = boxes.narrow(1, 0, 1)?;
    let y1 = boxes.narrow(1, 1, 1)?;
    let x2 = boxes.narrow(1, 2, 1)?;
    let y2 = boxes.narrow(1, 3, 1)?;
    let area = ((&y2 - &y1)? * (&x2 - &x1)?)?.relu()?;
    Ok((boxes, area))
}

/// Normalize one record into per-region feature and position tensors.
pub fn normalize_record(record: &RegionFeatureRecord) -> Result<NormalizedRegions, VisualError> {
    let (boxes, area) = normalized_boxes_and_area(&record.boxes)?;
    let scores = record.scores.to_dtype(DType::F32)?.unsqueeze(1)?;
    let geometry = Tensor::cat(&[&boxes, &area, &scores], 1)?;

    let class_probs = record.class_probs.to_dtype(DType::F32)?;
    let position = Tensor::cat(&[&layer_norm(&geometry)?, &layer_norm(&class_probs)?], 1)?;

    Ok(NormalizedRegions {
        features: record.features.to_dtype(DType::F32)?,
        position,
    })
}

/// Zero-pad the region axis of both tensors to exactly `budget` rows.
pub fn pad_regions(
    regions: &NormalizedRegions,
    budget: usize,
) -> Result<(Tensor, Tensor), VisualError> {
    let (num_regions, feature_dim) = regions.features.dims2()?;
    let (_, position_dim) = regions.position.dims2()?;
    if num_regions > budget {
        return Err(VisualError::RegionOverflow {
            num_regions,
            budget,
        });
    }
    let device = regions.features.device();
    let (features, position) = if num_regions == budget {
        (regions.features.clone(), regions.position.clone())
    } else {
        let pad = budget - num_regions;
        let feature_pad = Tensor::zeros((pad, feature_dim), DType::F32, device)?;
        let position_pad = Tensor::zeros((pad, position_dim), DType::F32, device)?;
        (
            Tensor::cat(&[&regions.features, &feature_pad], 0)?,
            Tensor::cat(&[&regions.position, &position_pad], 0)?,
        )
    };
    debug_assert_eq!(features.dim(0)?, budget);
    debug_assert_eq!(position.dim(0)?, budget);
    Ok((features, position))
}

/// Parameterless layer normalization over the last dimension.
fn layer_norm(xs: &Tensor) -> Result<Tensor, VisualError> {
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn record(boxes: Vec<f32>, num_regions: usize) -> RegionFeatureRecord {
        let device = Device::Cpu;
        RegionFeatureRecord::new(
            Tensor::from_vec(vec![0.5f32; num_regions * 8], (num_regions, 8), &device).unwrap(),
            Tensor::from_vec(
                vec![1.0 / CLASS_PROB_WIDTH as f32; num_regions * CLASS_PROB_WIDTH],
                (num_regions, CLASS_PROB_WIDTH),
                &device,
            )
            .unwrap(),
            Tensor::from_vec(boxes, (num_regions, 4), &device).unwrap(),
            Tensor::from_vec(vec![0.9f32; num_regions], num_regions, &device).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn normalized_coordinates_land_in_unit_range() {
        let rec = record(vec![0.0, 0.0, 10.0, 20.0, 2.0, 4.0, 8.0, 16.0], 2);
        let (boxes, area) = normalized_boxes_and_area(&rec.boxes).unwrap();
        for row in boxes.to_vec2::<f32>().unwrap() {
            for value in row {
                assert!((0.0..=1.0).contains(&value), "{value}");
            }
        }
        for row in area.to_vec2::<f32>().unwrap() {
            assert!(row[0] >= 0.0);
        }

        let normalized = normalize_record(&rec).unwrap();
        assert_eq!(normalized.position.dims2().unwrap(), (2, POSITION_WIDTH));
    }

    #[test]
    fn inverted_boxes_clamp_area_to_zero() {
        // dx < 0, dy > 0: the raw area is negative and must clamp.
        let rec = record(vec![3.0, 1.0, 1.0, 5.0], 1);
        let (_, area) = normalized_boxes_and_area(&rec.boxes).unwrap();
        assert_eq!(area.to_vec2::<f32>().unwrap()[0][0], 0.0);
    }

    #[test]
    fn negative_extent_is_fatal() {
        let rec = record(vec![-5.0, -5.0, -1.0, -1.0], 1);
        assert!(matches!(
            normalize_record(&rec),
            Err(VisualError::DegenerateExtent { .. })
        ));
    }

    #[test]
    fn padding_reaches_the_budget_exactly() {
        let rec = record(vec![0.0, 0.0, 4.0, 4.0, 1.0, 1.0, 3.0, 3.0], 2);
        let normalized = normalize_record(&rec).unwrap();
        let (features, position) = pad_regions(&normalized, 5).unwrap();
        assert_eq!(features.dims2().unwrap(), (5, 8));
        assert_eq!(position.dims2().unwrap(), (5, POSITION_WIDTH));
        // Padded rows are exactly zero.
        let padded_row = features.narrow(0, 4, 1).unwrap();
        assert!(padded_row
            .to_vec2::<f32>()
            .unwrap()[0]
            .iter()
            .all(|&v| v == 0.0));
    }

    #[test]
    fn region_overflow_is_rejected() {
        let rec = record(vec![0.0, 0.0, 4.0, 4.0, 1.0, 1.0, 3.0, 3.0], 2);
        let normalized = normalize_record(&rec).unwrap();
        assert!(matches!(
            pad_regions(&normalized, 1),
            Err(VisualError::RegionOverflow { .. })
        ));
    }

    #[test]
    fn record_shape_validation_catches_width_errors() {
        let device = Device::Cpu;
        let bad = RegionFeatureRecord::new(
            Tensor::zeros((2, 8), DType::F32, &device).unwrap(),
            Tensor::zeros((2, 7), DType::F32, &device).unwrap(),
            Tensor::zeros((2, 4), DType::F32, &device).unwrap(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
        );
        assert!(matches!(bad, Err(VisualError::BadWidth { .. })));
    }

    #[test]
    fn layer_norm_centers_each_row() {
        let device = Device::Cpu;
        let xs = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0], (2, 3), &device)
            .unwrap();
        let normed = layer_norm(&xs).unwrap();
        for row in normed.to_vec2::<f32>().unwrap() {
            let mean: f32 = row.iter().sum::<f32>() / row.len() as f32;
            assert!(mean.abs() < 1e-5, "row mean {mean}");
        }
    }
}
