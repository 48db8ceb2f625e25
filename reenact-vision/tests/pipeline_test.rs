use std::path::{Path, PathBuf};

use anyhow::Result;
use reenact_vision::model::{self, KeypointDetector, ModelParams, ModelPaths};
use reenact_vision::{tensor, Pipeline, PipelineOptions};

fn data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../data")
}

fn model_paths() -> Option<ModelPaths> {
    let defaults = ModelPaths::default();
    let paths = ModelPaths {
        detector: data_dir().join(defaults.detector.file_name()?),
        kp_detector: data_dir().join(defaults.kp_detector.file_name()?),
        generator: data_dir().join(defaults.generator.file_name()?),
        threads: 0,
    };
    for p in [&paths.detector, &paths.kp_detector, &paths.generator] {
        if !p.exists() {
            eprintln!("Skipping: {} not found", p.display());
            return None;
        }
    }
    Some(paths)
}

#[test]
fn test_pipeline_initialization() -> Result<()> {
    env_logger::try_init().ok();
    let Some(paths) = model_paths() else {
        return Ok(());
    };
    let _pipeline = Pipeline::new(&paths, PipelineOptions::default())?;
    println!("✓ Pipeline initialized successfully");
    Ok(())
}

#[test]
fn test_keypoint_detector_output_shape() -> Result<()> {
    let Some(paths) = model_paths() else {
        return Ok(());
    };
    let params = ModelParams::default();
    let mut checkpoint = model::load_checkpoints(&paths, &params)?;

    let gray = image::RgbImage::from_pixel(256, 256, image::Rgb([128, 128, 128]));
    let kp = checkpoint.kp_detector.detect(&tensor::image_to_tensor(&gray))?;

    assert_eq!(kp.len(), params.num_kp);
    assert_eq!(kp.jacobian.is_some(), params.estimate_jacobian);
    assert!(kp.value.iter().all(|v| v.abs() <= 1.5), "keypoints out of range: {:?}", kp.value);
    Ok(())
}
