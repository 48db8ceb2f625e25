use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;
use log::info;

use crate::animate::{AnimationOptions, AnimationSummary, Animator};
use crate::crop::{self, CropMode, CropOptions, FrameCropper};
use crate::detect::{DetectionOptions, FaceDetector, YuNetDetector};
use crate::keypoints::NormalizeOptions;
use crate::model::{self, Generator, KeypointDetector, ModelParams, ModelPaths};
use crate::tracker::{self, TrackerOptions};
use crate::video::{self, EncoderOptions, FrameSink, VideoReader, VideoWriter};

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub model: ModelParams,
    pub detection: DetectionOptions,
    pub crop: CropOptions,
    pub tracking: TrackerOptions,
    /// Only every n-th frame is considered when looking for the best frame.
    pub scan_stride: usize,
    pub normalize: NormalizeOptions,
    pub encoder: EncoderOptions,
    pub progress_every: usize,
}

/// Full pipeline: locate faces → keypoints → generator → video.
pub struct Pipeline<D, K, G> {
    detector: D,
    animator: Animator<K, G>,
    options: PipelineOptions,
}

impl Pipeline<YuNetDetector, model::OnnxKeypointDetector, model::OnnxGenerator> {
    pub fn new(paths: &ModelPaths, options: PipelineOptions) -> Result<Self> {
        let detector = YuNetDetector::new(
            model::detector_session(paths)?,
            options.detection.clone(),
        );
        let checkpoint = model::load_checkpoints(paths, &options.model)?;
        Ok(Self::from_parts(
            detector,
            checkpoint.kp_detector,
            checkpoint.generator,
            options,
        ))
    }
}

impl<D, K, G> Pipeline<D, K, G>
where
    D: FaceDetector,
    K: KeypointDetector,
    G: Generator,
{
    pub fn from_parts(detector: D, kp_detector: K, generator: G, options: PipelineOptions) -> Self {
        let animation = AnimationOptions {
            frame_size: options.model.frame_size,
            normalize: options.normalize.clone(),
            progress_every: options.progress_every,
            expected_frames: None,
        };
        Self {
            detector,
            animator: Animator::new(kp_detector, generator, animation),
            options,
        }
    }

    /// Square face crop of a still image at network resolution.
    pub fn source_face(&mut self, img: &RgbImage) -> Result<RgbImage> {
        let (_, face) = crop::search_face(img, &mut self.detector, self.options.crop.margin)?;
        Ok(crop::to_model_size(&face, self.options.model.frame_size))
    }

    /// Animate `source_img` with frames from `open_driving`, which is called
    /// twice: once to find the anchor frame, once to animate.
    pub fn animate_frames<F, I, S>(
        &mut self,
        source_img: &RgbImage,
        mut open_driving: F,
        sink: &mut S,
    ) -> Result<AnimationSummary>
    where
        F: FnMut() -> Result<I>,
        I: IntoIterator<Item = Result<RgbImage>>,
        S: FrameSink + ?Sized,
    {
        let source = self.source_face(source_img).context("cropping source face")?;

        let best = tracker::best_frame(
            open_driving()?,
            &mut self.detector,
            self.options.scan_stride,
        )
        .context("searching driving video for a face")?;

        let margin = self.options.crop.margin;
        let initial = crop::scale_image(&best.frame, &best.rect, best.rect.width, margin);

        let mut cropper = match self.options.crop.mode {
            CropMode::Fixed => FrameCropper::fixed(best.rect),
            CropMode::Tracked => FrameCropper::tracked(
                best.rect,
                self.options.tracking.clone(),
                &mut self.detector,
            ),
        };

        let driving = open_driving()?
            .into_iter()
            .map(|frame| frame.and_then(|f| cropper.crop(&f, margin)));

        self.animator.animate(&source, &initial, driving, sink)
    }

    /// Read `image`, animate it with `video` and encode the result to `out`.
    pub fn run(&mut self, image: &Path, video: &Path, out: &Path) -> Result<AnimationSummary> {
        let source_img = image::open(image)
            .with_context(|| format!("opening image {}", image.display()))?
            .to_rgb8();

        let info = video::probe(video)?;
        info!(
            "driving video {}: {}x{} @ {:.2} fps, {} frames",
            video.display(),
            info.width,
            info.height,
            info.fps,
            info.frame_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        self.animator.set_expected_frames(info.frame_count);

        let size = self.options.model.frame_size;
        let mut writer = VideoWriter::create(out, size, size, info.fps, &self.options.encoder)?;

        let summary = self.animate_frames(&source_img, || VideoReader::open(video, &info), &mut writer)?;
        let written = writer.finish()?;
        info!("wrote {} frames to {}", written, out.display());

        Ok(summary)
    }
}
