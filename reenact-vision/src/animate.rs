use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info};

use crate::crop::to_model_size;
use crate::keypoints::{normalize_kp, Keypoints, NormalizeOptions};
use crate::model::{Generator, KeypointDetector};
use crate::tensor::{image_to_tensor, tensor_to_image};
use crate::video::FrameSink;

#[derive(Debug, Clone)]
pub struct AnimationOptions {
    pub frame_size: u32,
    pub normalize: NormalizeOptions,
    /// Log progress every n frames, 0 disables.
    pub progress_every: usize,
    /// Container frame count, only used for progress messages.
    pub expected_frames: Option<u64>,
}

impl Default for AnimationOptions {
    fn default() -> Self {
        Self {
            frame_size: 256,
            normalize: NormalizeOptions::default(),
            progress_every: 50,
            expected_frames: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationSummary {
    pub frames: usize,
    pub elapsed: Duration,
}

/// Drives the source face with keypoint motion from a sequence of face crops.
pub struct Animator<K, G> {
    kp_detector: K,
    generator: G,
    options: AnimationOptions,
}

impl<K: KeypointDetector, G: Generator> Animator<K, G> {
    pub fn new(kp_detector: K, generator: G, options: AnimationOptions) -> Self {
        Self {
            kp_detector,
            generator,
            options,
        }
    }

    pub fn set_expected_frames(&mut self, frames: Option<u64>) {
        self.options.expected_frames = frames;
    }

    fn keypoints(&mut self, img: &RgbImage) -> Result<Keypoints> {
        let frame = image_to_tensor(&to_model_size(img, self.options.frame_size));
        self.kp_detector.detect(&frame)
    }

    /// `source` and `initial` are face crops of the still image and of the
    /// anchor driving frame; `driving` yields one face crop per video frame.
    pub fn animate<I, S>(
        &mut self,
        source: &RgbImage,
        initial: &RgbImage,
        driving: I,
        sink: &mut S,
    ) -> Result<AnimationSummary>
    where
        I: IntoIterator<Item = Result<RgbImage>>,
        S: FrameSink + ?Sized,
    {
        let started = Instant::now();

        let source = image_to_tensor(&to_model_size(source, self.options.frame_size));
        let kp_source = self
            .kp_detector
            .detect(&source)
            .context("keypoints of source image")?;
        let kp_driving_initial = self
            .keypoints(initial)
            .context("keypoints of initial driving frame")?;
        debug!("source and initial keypoints ready ({} each)", kp_source.len());

        let mut frames = 0usize;
        for crop in driving {
            let crop = crop.with_context(|| format!("reading driving frame {}", frames))?;

            let kp_driving = self.keypoints(&crop)?;
            let kp_norm = normalize_kp(
                &kp_source,
                &kp_driving,
                &kp_driving_initial,
                &self.options.normalize,
            )
            .with_context(|| format!("normalizing keypoints of frame {}", frames))?;

            let prediction = self
                .generator
                .generate(&source, &kp_source, &kp_norm)
                .with_context(|| format!("generating frame {}", frames))?;
            let out = tensor_to_image(prediction.view())?;
            sink.write(&out)?;

            frames += 1;
            self.report(frames, started);
        }

        let summary = AnimationSummary {
            frames,
            elapsed: started.elapsed(),
        };
        info!(
            "animated {} frames in {:.1}s",
            summary.frames,
            summary.elapsed.as_secs_f32()
        );
        Ok(summary)
    }

    fn report(&self, frames: usize, started: Instant) {
        let every = self.options.progress_every;
        if every == 0 || frames % every != 0 {
            return;
        }
        let rate = frames as f32 / started.elapsed().as_secs_f32().max(1e-3);
        match self.options.expected_frames {
            Some(total) if total > 0 => info!(
                "frame {}/{} ({:.0}%), {:.1} fps",
                frames,
                total,
                frames as f64 * 100.0 / total as f64,
                rate
            ),
            _ => info!("frame {}, {:.1} fps", frames, rate),
        }
    }
}
