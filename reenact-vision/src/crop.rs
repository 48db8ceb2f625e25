use anyhow::Result;
use image::{imageops::FilterType, RgbImage};
use serde::{Deserialize, Serialize};

use crate::detect::{best_detection, FaceDetector};
use crate::error::VisionError;
use crate::geometry::{CropRegion, Rect};
use crate::tracker::{FaceTracker, TrackerOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    /// Every frame is cut with the best-frame face box.
    Fixed,
    /// Re-detect and smooth the box as the face moves.
    Tracked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CropOptions {
    /// Extra border on each side, as a fraction of the face width.
    pub margin: f32,
    pub mode: CropMode,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            margin: 0.1,
            mode: CropMode::Fixed,
        }
    }
}

/// Cut the square face region of `frame`: side `size * (1 + 2 * margin)`
/// around the centre of `face`, kept inside the frame.
pub fn scale_image(frame: &RgbImage, face: &Rect, size: f32, margin: f32) -> RgbImage {
    let region = CropRegion::around(face, size, margin, frame.width(), frame.height());
    image::imageops::crop_imm(frame, region.x, region.y, region.size, region.size).to_image()
}

/// Bilinear resize to the network's square input.
pub fn to_model_size(img: &RgbImage, frame_size: u32) -> RgbImage {
    if img.dimensions() == (frame_size, frame_size) {
        return img.clone();
    }
    image::imageops::resize(img, frame_size, frame_size, FilterType::Triangle)
}

/// Locate the strongest face in a still image and return its square crop.
pub fn search_face(
    img: &RgbImage,
    detector: &mut dyn FaceDetector,
    margin: f32,
) -> Result<(Rect, RgbImage)> {
    let detections = detector.detect(img)?;
    let face = best_detection(&detections)
        .ok_or_else(|| VisionError::NoFaceDetected("source image".to_string()))?;

    log::debug!(
        "source face at [{:.1}, {:.1}, {:.1}, {:.1}] score {:.3}",
        face.rect.x,
        face.rect.y,
        face.rect.width,
        face.rect.height,
        face.score
    );

    let crop = scale_image(img, &face.rect, face.rect.width, margin);
    Ok((face.rect, crop))
}

/// Chooses the crop for each driving frame.
pub enum FrameCropper<'a> {
    Fixed(Rect),
    Tracked {
        tracker: FaceTracker,
        detector: &'a mut dyn FaceDetector,
    },
}

impl<'a> FrameCropper<'a> {
    pub fn fixed(anchor: Rect) -> Self {
        Self::Fixed(anchor)
    }

    pub fn tracked(anchor: Rect, options: TrackerOptions, detector: &'a mut dyn FaceDetector) -> Self {
        Self::Tracked {
            tracker: FaceTracker::new(anchor, options),
            detector,
        }
    }

    /// Face box to cut `frame` with.
    pub fn face_box(&mut self, frame: &RgbImage) -> Result<Rect> {
        match self {
            Self::Fixed(rect) => Ok(*rect),
            Self::Tracked { tracker, detector } => tracker.track(&mut **detector, frame),
        }
    }

    pub fn crop(&mut self, frame: &RgbImage, margin: f32) -> Result<RgbImage> {
        let face = self.face_box(frame)?;
        Ok(scale_image(frame, &face, face.width, margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;

    struct Fixed(Vec<Detection>);

    impl FaceDetector for Fixed {
        fn detect(&mut self, _img: &RgbImage) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_scale_image_cuts_square() {
        let mut frame = RgbImage::new(200, 100);
        frame.put_pixel(50, 50, image::Rgb([255, 0, 0]));

        let face = Rect::new(40.0, 40.0, 20.0, 20.0);
        let crop = scale_image(&frame, &face, 20.0, 0.5);
        assert_eq!(crop.dimensions(), (40, 40));
        // face centre lands in the middle of the crop
        assert_eq!(crop.get_pixel(20, 20), &image::Rgb([255, 0, 0]));
    }

    #[test]
    fn test_search_face_no_face() {
        let img = RgbImage::new(32, 32);
        let err = search_face(&img, &mut Fixed(vec![]), 0.1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::NoFaceDetected(_))
        ));
    }

    #[test]
    fn test_search_face_uses_best() {
        let img = RgbImage::new(300, 300);
        let mut detector = Fixed(vec![
            Detection {
                rect: Rect::new(0.0, 0.0, 30.0, 30.0),
                score: 0.6,
            },
            Detection {
                rect: Rect::new(100.0, 100.0, 100.0, 100.0),
                score: 0.9,
            },
        ]);
        let (rect, crop) = search_face(&img, &mut detector, 0.1).unwrap();
        assert_eq!(rect.width, 100.0);
        assert_eq!(crop.dimensions(), (120, 120));
    }

    #[test]
    fn test_to_model_size() {
        let img = RgbImage::new(120, 120);
        assert_eq!(to_model_size(&img, 256).dimensions(), (256, 256));
    }

    #[test]
    fn test_fixed_cropper_ignores_frame() {
        let mut cropper = FrameCropper::fixed(Rect::new(10.0, 10.0, 20.0, 20.0));
        let frame = RgbImage::new(100, 100);
        assert_eq!(cropper.crop(&frame, 0.0).unwrap().dimensions(), (20, 20));
    }
}
