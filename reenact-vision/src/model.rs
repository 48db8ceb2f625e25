use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, Array4, Axis};
use ort::{
    ep::{self, ExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::{Tensor, Value},
};
use serde::{Deserialize, Serialize};

use crate::error::VisionError;
use crate::keypoints::Keypoints;

/// Where the ONNX exports live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub kp_detector: PathBuf,
    pub generator: PathBuf,
    /// Intra-op threads per session, 0 lets onnxruntime decide.
    pub threads: usize,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            detector: PathBuf::from("data/face_detection_yunet_2023mar.onnx"),
            kp_detector: PathBuf::from("data/vox-kp_detector.onnx"),
            generator: PathBuf::from("data/vox-generator.onnx"),
            threads: 0,
        }
    }
}

/// Shape parameters the networks were exported with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub num_kp: usize,
    pub estimate_jacobian: bool,
    pub frame_size: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            num_kp: 10,
            estimate_jacobian: true,
            frame_size: 256,
        }
    }
}

/// Keypoints for a [1, 3, S, S] frame tensor in [0, 1].
pub trait KeypointDetector {
    fn detect(&mut self, frame: &Array4<f32>) -> Result<Keypoints>;
}

/// Warps `source` so that its keypoints move to `kp_driving`.
pub trait Generator {
    fn generate(
        &mut self,
        source: &Array4<f32>,
        kp_source: &Keypoints,
        kp_driving: &Keypoints,
    ) -> Result<Array4<f32>>;
}

pub fn session_builder(threads: usize) -> Result<SessionBuilder> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if threads > 0 {
        builder = builder.with_intra_threads(threads)?;
    }

    #[cfg(feature = "openvino")]
    {
        let ep = ep::OpenVINO::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("openvino feature is enabled, onnx runtime not compiled with openvino")
        }
    }

    #[cfg(feature = "cuda")]
    {
        let ep = ep::CUDA::default();
        if ep.is_available()? {
            ep.register(&mut builder)?;
        } else {
            log::warn!("cuda feature is enabled, onnx runtime not compiled with cuda")
        }
    }

    Ok(builder)
}

fn open_session(path: &Path, threads: usize, what: &str) -> Result<Session> {
    if !path.exists() {
        return Err(VisionError::ModelNotFound(path.to_path_buf()).into());
    }
    session_builder(threads)?
        .commit_from_file(path)
        .with_context(|| format!("load {} model from {}", what, path.display()))
}

pub fn detector_session(paths: &ModelPaths) -> Result<Session> {
    open_session(&paths.detector, paths.threads, "face detector")
}

/// Pull `[1, K, 2]` values and optional `[1, K, 2, 2]` jacobians out of raw
/// detector outputs.
pub fn keypoints_from_raw(
    value: (&[i64], &[f32]),
    jacobian: Option<(&[i64], &[f32])>,
    num_kp: usize,
) -> Result<Keypoints> {
    let (shape, data) = value;
    if shape != [1, num_kp as i64, 2] {
        return Err(VisionError::BadModelOutput(format!(
            "keypoint values have shape {:?}, expected [1, {}, 2]",
            shape, num_kp
        ))
        .into());
    }
    let value = Array2::from_shape_vec((num_kp, 2), data.to_vec())?;

    let jacobian = match jacobian {
        Some((shape, data)) => {
            if shape != [1, num_kp as i64, 2, 2] {
                return Err(VisionError::BadModelOutput(format!(
                    "keypoint jacobians have shape {:?}, expected [1, {}, 2, 2]",
                    shape, num_kp
                ))
                .into());
            }
            Some(Array3::from_shape_vec((num_kp, 2, 2), data.to_vec())?)
        }
        None => None,
    };

    Ok(Keypoints { value, jacobian })
}

pub struct OnnxKeypointDetector {
    session: Session,
    params: ModelParams,
}

impl OnnxKeypointDetector {
    pub fn new(session: Session, params: ModelParams) -> Self {
        Self { session, params }
    }
}

impl KeypointDetector for OnnxKeypointDetector {
    fn detect(&mut self, frame: &Array4<f32>) -> Result<Keypoints> {
        let input = Value::from_array(frame.clone())?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("running keypoint detector")?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let value_shape: Vec<i64> = shape.iter().copied().collect();
        let value_data = data.to_vec();

        let jacobian = if self.params.estimate_jacobian {
            if outputs.len() < 2 {
                return Err(VisionError::BadModelOutput(
                    "keypoint detector has no jacobian output".to_string(),
                )
                .into());
            }
            let (shape, data) = outputs[1].try_extract_tensor::<f32>()?;
            Some((shape.iter().copied().collect::<Vec<i64>>(), data.to_vec()))
        } else {
            None
        };

        keypoints_from_raw(
            (value_shape.as_slice(), value_data.as_slice()),
            jacobian.as_ref().map(|(s, d)| (s.as_slice(), d.as_slice())),
            self.params.num_kp,
        )
    }
}

pub struct OnnxGenerator {
    session: Session,
    params: ModelParams,
}

impl OnnxGenerator {
    pub fn new(session: Session, params: ModelParams) -> Self {
        Self { session, params }
    }
}

fn batched_value(kp: &Keypoints) -> Result<Tensor<f32>> {
    Ok(Value::from_array(kp.value.clone().insert_axis(Axis(0)))?)
}

fn batched_jacobian(kp: &Keypoints) -> Result<Tensor<f32>> {
    let jacobian = kp.jacobian.as_ref().ok_or_else(|| {
        VisionError::BadModelOutput("generator needs jacobians but keypoints have none".to_string())
    })?;
    Ok(Value::from_array(jacobian.clone().insert_axis(Axis(0)))?)
}

impl Generator for OnnxGenerator {
    fn generate(
        &mut self,
        source: &Array4<f32>,
        kp_source: &Keypoints,
        kp_driving: &Keypoints,
    ) -> Result<Array4<f32>> {
        let source = Value::from_array(source.clone())?;

        // Input order: source, driving value, [driving jacobian], source value, [source jacobian]
        let outputs = if self.params.estimate_jacobian {
            self.session.run(ort::inputs![
                source,
                batched_value(kp_driving)?,
                batched_jacobian(kp_driving)?,
                batched_value(kp_source)?,
                batched_jacobian(kp_source)?
            ])
        } else {
            self.session.run(ort::inputs![
                source,
                batched_value(kp_driving)?,
                batched_value(kp_source)?
            ])
        }
        .context("running generator")?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        if shape.len() != 4 {
            return Err(VisionError::BadModelOutput(format!(
                "generator prediction has shape {:?}",
                &shape[..]
            ))
            .into());
        }
        let dims = (
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
        );
        Ok(Array4::from_shape_vec(dims, data.to_vec())?)
    }
}

/// Both animation networks, ready for inference.
pub struct Checkpoint {
    pub kp_detector: OnnxKeypointDetector,
    pub generator: OnnxGenerator,
}

pub fn load_checkpoints(paths: &ModelPaths, params: &ModelParams) -> Result<Checkpoint> {
    let kp_detector = open_session(&paths.kp_detector, paths.threads, "keypoint detector")?;
    let generator = open_session(&paths.generator, paths.threads, "generator")?;
    log::info!(
        "loaded checkpoints: {} keypoints, jacobians {}",
        params.num_kp,
        if params.estimate_jacobian { "on" } else { "off" }
    );

    Ok(Checkpoint {
        kp_detector: OnnxKeypointDetector::new(kp_detector, params.clone()),
        generator: OnnxGenerator::new(generator, params.clone()),
    })
}
