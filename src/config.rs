use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use reenact_vision::crop::CropOptions;
use reenact_vision::detect::DetectionOptions;
use reenact_vision::keypoints::NormalizeOptions;
use reenact_vision::model::{ModelParams, ModelPaths};
use reenact_vision::tracker::TrackerOptions;
use reenact_vision::video::EncoderOptions;
use reenact_vision::PipelineOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub static CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    if let Some(path) = option_env!("REENACT_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    ProjectDirs::from("", "", "reenact")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("reenact.toml"))
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    #[serde(flatten)]
    pub tracker: TrackerOptions,
    /// Only every n-th frame is scanned when picking the anchor frame.
    pub scan_stride: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerOptions::default(),
            scan_stride: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where numbered outputs go when no path is given.
    pub dir: PathBuf,
    #[serde(flatten)]
    pub encoder: EncoderOptions,
    pub progress_every: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            encoder: EncoderOptions::default(),
            progress_every: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub models: ModelPaths,
    pub model: ModelParams,
    pub detection: DetectionOptions,
    pub crop: CropOptions,
    pub tracking: TrackingConfig,
    pub normalize: NormalizeOptions,
    pub output: OutputConfig,
}

impl Config {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            model: self.model.clone(),
            detection: self.detection.clone(),
            crop: self.crop.clone(),
            tracking: self.tracking.tracker.clone(),
            scan_stride: self.tracking.scan_stride,
            normalize: self.normalize.clone(),
            encoder: self.output.encoder.clone(),
            progress_every: self.output.progress_every,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
