use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use reenact::{config, crop, detect, model, output, video, Pipeline};

#[derive(Parser)]
#[command(name = "reenact")]
#[command(
    version,
    about = "Animate a portrait with the facial motion of a driving video"
)]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Animate the face in an image with the motion of a video
    Animate {
        /// Source portrait
        #[arg(long, default_value = "data/1.jpg")]
        image: PathBuf,
        /// Driving video
        #[arg(long, default_value = "data/1.mp4")]
        video: PathBuf,
        /// Output video (defaults to the next free number in the output dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Save the face crop the animation would use for an image
    Crop {
        #[arg(long, default_value = "data/1.jpg")]
        image: PathBuf,
        #[arg(long, default_value = "face.png")]
        out: PathBuf,
    },
    /// Print size, frame rate and frame count of a video as JSON
    Probe {
        #[arg(long, default_value = "data/1.mp4")]
        video: PathBuf,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Animate { image, video, out } => animate(&cfg, &image, &video, out),
        Commands::Crop { image, out } => crop_face(&cfg, &image, &out),
        Commands::Probe { video } => probe(&video),
        Commands::Config => open_config(cli.config.as_deref()),
    }
}

fn animate(cfg: &config::Config, image: &Path, video: &Path, out: Option<PathBuf>) -> Result<()> {
    let out = match out {
        Some(path) => path,
        None => output::next_output_path(&cfg.output.dir)?,
    };
    info!(
        "Animating {} with {} into {}",
        image.display(),
        video.display(),
        out.display()
    );

    let mut pipeline = Pipeline::new(&cfg.models, cfg.pipeline_options())
        .context("Failed to load models")?;

    let summary = pipeline
        .run(image, video, &out)
        .context("Animation failed")?;

    info!(
        "✓ {} frames written to {} in {:.1}s",
        summary.frames,
        out.display(),
        summary.elapsed.as_secs_f32()
    );
    Ok(())
}

fn crop_face(cfg: &config::Config, image: &Path, out: &Path) -> Result<()> {
    let img = image::open(image)
        .with_context(|| format!("Failed to open {}", image.display()))?
        .to_rgb8();

    let mut detector = detect::YuNetDetector::new(
        model::detector_session(&cfg.models).context("Failed to load face detector")?,
        cfg.detection.clone(),
    );

    let (rect, face) = crop::search_face(&img, &mut detector, cfg.crop.margin)?;
    info!(
        "Face at [{:.0}, {:.0}, {:.0}x{:.0}]",
        rect.x, rect.y, rect.width, rect.height
    );

    let face = crop::to_model_size(&face, cfg.model.frame_size);
    face.save(out)
        .with_context(|| format!("Failed to save {}", out.display()))?;

    info!("✓ Face crop saved to {}", out.display());
    Ok(())
}

fn probe(path: &Path) -> Result<()> {
    let info = video::probe(path)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
