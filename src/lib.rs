pub mod config;
pub mod output;

// Re-export vision types for convenience
pub use reenact_vision::{
    animate, crop, detect, keypoints, model, pipeline, tracker, video, Pipeline, PipelineOptions,
    VisionError,
};
