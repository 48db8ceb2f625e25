//! Face box stabilisation across video frames.

use anyhow::Result;
use image::RgbImage;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::detect::{best_detection, Detection, FaceDetector};
use crate::error::VisionError;
use crate::geometry::Rect;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerOptions {
    /// Weight of a new detection in the exponential moving average.
    pub smoothing: f32,
    /// Minimum IoU for a detection to count as the tracked face.
    pub min_iou: f32,
    /// Consecutive misses before falling back to the anchor box.
    pub max_lost: usize,
    /// Run the detector on every n-th frame.
    pub detect_every: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            min_iou: 0.1,
            max_lost: 25,
            detect_every: 1,
        }
    }
}

/// Exponentially smoothed face box.
#[derive(Debug, Clone)]
pub struct FaceTracker {
    options: TrackerOptions,
    anchor: Rect,
    current: Rect,
    lost: usize,
    frame: usize,
}

impl FaceTracker {
    /// Start tracking from `anchor`, usually the best-frame face box.
    pub fn new(anchor: Rect, options: TrackerOptions) -> Self {
        Self {
            options,
            anchor,
            current: anchor,
            lost: 0,
            frame: 0,
        }
    }

    pub fn current(&self) -> Rect {
        self.current
    }

    /// Whether the frame about to be fed should go through the detector.
    pub fn needs_detection(&self) -> bool {
        self.frame % self.options.detect_every.max(1) == 0
    }

    /// Feed detections for a frame the detector ran on.
    pub fn update(&mut self, detections: &[Detection]) -> Rect {
        self.frame += 1;

        let matched = detections
            .iter()
            .map(|d| (d, d.rect.iou(&self.current)))
            .filter(|(_, iou)| *iou >= self.options.min_iou)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(d, _)| d);

        match matched {
            Some(d) => {
                self.lost = 0;
                let factor = self.options.smoothing.clamp(0.0, 1.0);
                self.current = self.current.lerp(&d.rect, factor);
            }
            None => {
                self.lost += 1;
                if self.lost >= self.options.max_lost {
                    debug!("face lost for {} frames, back to anchor", self.lost);
                    self.current = self.anchor;
                    self.lost = 0;
                }
            }
        }

        self.current
    }

    /// Advance over a frame the detector skipped.
    pub fn skip(&mut self) -> Rect {
        self.frame += 1;
        self.current
    }

    /// Run `detector` when due, otherwise keep the current box.
    pub fn track(&mut self, detector: &mut dyn FaceDetector, frame: &RgbImage) -> Result<Rect> {
        if self.needs_detection() {
            let detections = detector.detect(frame)?;
            Ok(self.update(&detections))
        } else {
            Ok(self.skip())
        }
    }
}

/// The frame the driving sequence is anchored on.
#[derive(Debug, Clone)]
pub struct BestFrame {
    pub index: usize,
    pub rect: Rect,
    pub score: f32,
    pub frame: RgbImage,
}

/// Scan every `stride`-th frame and keep the one with the strongest face.
pub fn best_frame<I>(frames: I, detector: &mut dyn FaceDetector, stride: usize) -> Result<BestFrame>
where
    I: IntoIterator<Item = Result<RgbImage>>,
{
    let stride = stride.max(1);
    let mut best: Option<BestFrame> = None;
    let mut scanned = 0usize;

    for (index, frame) in frames.into_iter().enumerate() {
        let frame = frame?;
        if index % stride != 0 {
            continue;
        }
        scanned += 1;

        let detections = detector.detect(&frame)?;
        let Some(candidate) = best_detection(&detections) else {
            continue;
        };

        let better = match &best {
            None => true,
            Some(b) => {
                candidate.score > b.score
                    || (candidate.score == b.score && candidate.rect.area() > b.rect.area())
            }
        };
        if better {
            best = Some(BestFrame {
                index,
                rect: candidate.rect,
                score: candidate.score,
                frame,
            });
        }
    }

    let best = best.ok_or_else(|| {
        VisionError::NoFaceDetected(format!("any of {} scanned video frames", scanned))
    })?;
    info!(
        "best frame: #{} (score {:.3}, face {:.0}x{:.0})",
        best.index, best.score, best.rect.width, best.rect.height
    );
    Ok(best)
}
