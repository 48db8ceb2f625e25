use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};

use crate::geometry::Rect;
use crate::yunet;

/// Face found by a detector, in the pixel space of the image it ran on.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub rect: Rect,
    pub score: f32,
}

/// Anything that can find faces in an RGB frame.
pub trait FaceDetector {
    fn detect(&mut self, img: &RgbImage) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            nms_threshold: 0.3,
        }
    }
}

/// YuNet running on a fixed 640x640 letterboxed canvas.
pub struct YuNetDetector {
    session: Session,
    options: DetectionOptions,
}

const CANVAS: u32 = 640;

impl YuNetDetector {
    pub fn new(session: Session, options: DetectionOptions) -> Self {
        Self { session, options }
    }
}

impl FaceDetector for YuNetDetector {
    fn detect(&mut self, img: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Ok(vec![]);
        }

        // Letterbox into the square canvas to avoid distortion.
        let scale = CANVAS as f32 / width.max(height) as f32;
        let new_width = ((width as f32 * scale) as u32).clamp(1, CANVAS);
        let new_height = ((height as f32 * scale) as u32).clamp(1, CANVAS);
        let resized = image::imageops::resize(img, new_width, new_height, FilterType::Triangle);

        let mut canvas = RgbImage::new(CANVAS, CANVAS);
        let offset_x = (CANVAS - new_width) / 2;
        let offset_y = (CANVAS - new_height) / 2;
        image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

        // YuNet wants BGR planes with raw 0..255 values.
        let plane = (CANVAS * CANVAS) as usize;
        let mut input = vec![0.0f32; 3 * plane];
        for (i, px) in canvas.pixels().enumerate() {
            input[i] = px[2] as f32;
            input[plane + i] = px[1] as f32;
            input[2 * plane + i] = px[0] as f32;
        }
        let input = Array4::from_shape_vec((1, 3, CANVAS as usize, CANVAS as usize), input)?;
        let input = Value::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("running face detector")?;

        let mut raw: Vec<(Vec<i64>, Vec<f32>)> = Vec::with_capacity(outputs.len());
        for (_name, output) in outputs.iter() {
            let (shape, data) = output.try_extract_tensor::<f32>()?;
            raw.push((shape.iter().copied().collect(), data.to_vec()));
        }
        let raw: Vec<(&[i64], &[f32])> =
            raw.iter().map(|(s, d)| (s.as_slice(), d.as_slice())).collect();

        let heads = yunet::parse_outputs(&raw, CANVAS as usize)?;
        let candidates = yunet::decode(&heads, self.options.score_threshold, CANVAS as usize);

        let detections: Vec<Detection> = candidates
            .into_iter()
            .map(|c| Detection {
                rect: Rect::new(
                    (c.rect.x - offset_x as f32) / scale,
                    (c.rect.y - offset_y as f32) / scale,
                    c.rect.width / scale,
                    c.rect.height / scale,
                ),
                score: c.score,
            })
            .collect();

        log::debug!("yunet: {} candidate faces", detections.len());

        Ok(nms(&detections, self.options.nms_threshold))
    }
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in sorted {
        if keep.iter().all(|k| k.rect.iou(&det.rect) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Highest score wins; on equal scores the larger face does.
pub fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().max_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.rect.area().total_cmp(&b.rect.area()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, size: f32, score: f32) -> Detection {
        Detection {
            rect: Rect::new(x, y, size, size),
            score,
        }
    }

    #[test]
    fn test_nms() {
        let detections = vec![
            det(10.0, 10.0, 20.0, 0.9),
            det(12.0, 12.0, 20.0, 0.8),
            det(100.0, 100.0, 20.0, 0.85),
        ];

        let result = nms(&detections, 0.3);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.85);
    }

    #[test]
    fn test_best_detection() {
        assert!(best_detection(&[]).is_none());

        let detections = vec![
            det(0.0, 0.0, 10.0, 0.7),
            det(50.0, 50.0, 40.0, 0.9),
            det(100.0, 0.0, 20.0, 0.9),
        ];
        let best = best_detection(&detections).unwrap();
        assert_eq!(best.rect.width, 40.0);
    }
}
