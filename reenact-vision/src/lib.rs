pub mod animate;
pub mod crop;
pub mod detect;
pub mod error;
pub mod geometry;
pub mod keypoints;
pub mod model;
pub mod pipeline;
pub mod tensor;
pub mod tracker;
pub mod video;
pub mod yunet;

// Re-export commonly used types
pub use detect::{Detection, FaceDetector};
pub use error::VisionError;
pub use geometry::Rect;
pub use keypoints::{normalize_kp, Keypoints};
pub use model::{Generator, KeypointDetector};
pub use pipeline::{Pipeline, PipelineOptions};
