use std::path::PathBuf;
use thiserror::Error;

/// Failures callers may want to tell apart. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("no face detected in {0}")]
    NoFaceDetected(String),

    #[error("{0} not found in PATH")]
    ToolNotFound(&'static str),

    #[error("ffmpeg failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("invalid video {path}: {reason}")]
    InvalidVideo { path: PathBuf, reason: String },

    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("unexpected model output: {0}")]
    BadModelOutput(String),

    #[error("keypoint count mismatch: {left} vs {right}")]
    KeypointMismatch { left: usize, right: usize },

    #[error("initial jacobian of keypoint {0} is singular")]
    SingularJacobian(usize),
}
