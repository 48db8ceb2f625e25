//! YuNet output decoding.
//!
//! YuNet is anchor-free: for each stride (8, 16, 32) it predicts per grid cell
//! - cls: [1, H*W, 1]
//! - obj: [1, H*W, 1]
//! - bbox: [1, H*W, 4] as (dx, dy, dw, dh) in stride units
//! - kps: [1, H*W, 10]
//!
//! Outputs arrive grouped by kind: cls_8, cls_16, cls_32, obj_8, ..., kps_32.
//! A cell at (row i, col j) decodes to
//! cx = (j + dx) * stride, cy = (i + dy) * stride, w = dw * stride, h = dh * stride.

use anyhow::Result;
use ndarray::Array2;

use crate::error::VisionError;
use crate::geometry::Rect;

const STRIDES: [usize; 3] = [8, 16, 32];

/// One decoded head per stride.
#[derive(Debug, Clone)]
pub struct StrideOutputs {
    pub scores: Array2<f32>,
    pub bboxes: Array2<f32>,
}

/// Candidate box in input-canvas pixels, before NMS.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub rect: Rect,
    pub score: f32,
}

fn head(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    columns: usize,
    cells: usize,
) -> Result<Array2<f32>> {
    let (shape, data) = outputs
        .get(index)
        .ok_or_else(|| VisionError::BadModelOutput(format!("missing yunet output {}", index)))?;

    if shape.len() != 3 || shape[0] != 1 || shape[1] as usize != cells || shape[2] as usize != columns
    {
        return Err(VisionError::BadModelOutput(format!(
            "yunet output {} has shape {:?}, expected [1, {}, {}]",
            index, shape, cells, columns
        ))
        .into());
    }

    Ok(Array2::from_shape_vec((cells, columns), data.to_vec())?)
}

/// Split the twelve raw YuNet tensors into per-stride score and box maps.
/// Scores are sqrt(cls * obj), matching OpenCV's FaceDetectorYN.
pub fn parse_outputs(outputs: &[(&[i64], &[f32])], input_size: usize) -> Result<Vec<StrideOutputs>> {
    let mut heads = Vec::with_capacity(STRIDES.len());

    for (k, &stride) in STRIDES.iter().enumerate() {
        let side = input_size / stride;
        let cells = side * side;

        let cls = head(outputs, k, 1, cells)?;
        let obj = head(outputs, k + 3, 1, cells)?;
        let bboxes = head(outputs, k + 6, 4, cells)?;

        let scores = (cls.mapv(|v| v.clamp(0.0, 1.0)) * obj.mapv(|v| v.clamp(0.0, 1.0)))
            .mapv(f32::sqrt);

        heads.push(StrideOutputs { scores, bboxes });
    }

    Ok(heads)
}

/// Turn grid predictions above `score_threshold` into canvas-space boxes.
pub fn decode(heads: &[StrideOutputs], score_threshold: f32, input_size: usize) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (outputs, &stride) in heads.iter().zip(STRIDES.iter()) {
        let side = input_size / stride;
        let stride = stride as f32;

        for i in 0..side {
            for j in 0..side {
                let idx = i * side + j;
                let score = outputs.scores[[idx, 0]];
                if score < score_threshold {
                    continue;
                }

                let b = outputs.bboxes.row(idx);
                let cx = (j as f32 + b[0]) * stride;
                let cy = (i as f32 + b[1]) * stride;
                let w = b[2] * stride;
                let h = b[3] * stride;

                candidates.push(Candidate {
                    rect: Rect::new(cx - w / 2.0, cy - h / 2.0, w, h),
                    score,
                });
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_heads(input_size: usize) -> Vec<StrideOutputs> {
        STRIDES
            .iter()
            .map(|&s| {
                let cells = (input_size / s) * (input_size / s);
                StrideOutputs {
                    scores: Array2::zeros((cells, 1)),
                    bboxes: Array2::zeros((cells, 4)),
                }
            })
            .collect()
    }

    #[test]
    fn test_decode_grid_based() {
        let input_size = 640;
        let mut heads = empty_heads(input_size);

        // One confident cell on the stride-32 grid at row 10, col 10.
        let idx = 10 * 20 + 10;
        heads[2].scores[[idx, 0]] = 0.9;
        heads[2].bboxes[[idx, 0]] = 0.5;
        heads[2].bboxes[[idx, 1]] = 0.3;
        heads[2].bboxes[[idx, 2]] = 4.0;
        heads[2].bboxes[[idx, 3]] = 4.0;

        let found = decode(&heads, 0.5, input_size);
        assert_eq!(found.len(), 1);

        // center (336, 329.6), size 128
        let r = found[0].rect;
        assert!((r.x - 272.0).abs() < 1e-3);
        assert!((r.y - 265.6).abs() < 1e-3);
        assert!((r.width - 128.0).abs() < 1e-3);
        assert!((r.height - 128.0).abs() < 1e-3);
        assert!((found[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_bad_shape() {
        let data = vec![0.0f32; 10];
        let shape = [1i64, 10, 1];
        let outputs = vec![(&shape[..], &data[..])];
        let err = parse_outputs(&outputs, 640).unwrap_err();
        assert!(err.downcast_ref::<VisionError>().is_some());
    }

    #[test]
    fn test_parse_combines_cls_and_obj() {
        let input_size = 64;
        let mut owned: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
        for (columns, fill) in [(1usize, 0.25f32), (1, 1.0), (4, 0.0), (10, 0.0)] {
            for &s in &STRIDES {
                let cells = (input_size / s) * (input_size / s);
                owned.push((vec![1, cells as i64, columns as i64], vec![fill; cells * columns]));
            }
        }
        let outputs: Vec<(&[i64], &[f32])> =
            owned.iter().map(|(s, d)| (s.as_slice(), d.as_slice())).collect();

        let heads = parse_outputs(&outputs, input_size).unwrap();
        assert_eq!(heads.len(), 3);
        assert_eq!(heads[0].scores.shape(), &[64, 1]);
        assert!((heads[0].scores[[0, 0]] - 0.5).abs() < 1e-6);
    }
}
