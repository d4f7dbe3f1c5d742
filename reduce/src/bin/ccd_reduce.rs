//! Reduce one observing run of raw CCD spectroscopy frames.
//!
//! Builds master bias, dark and flat frames, calibrates the science frames
//! and writes sky-subtracted nod-pair differences with their error frames.

use anyhow::{Context, Result};
use clap::Parser;
use frames::FitsStore;
use reduce::{CalibrationPipeline, ErrorCombination, PipelineInputs, ReductionConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bias, dark, flat and sky-pair reduction of CCD spectroscopy frames"
)]
struct Args {
    #[arg(
        long,
        required_unless_present = "write_config",
        help = "Directory of raw dark frames"
    )]
    dark: Option<PathBuf>,

    #[arg(
        long,
        required_unless_present = "write_config",
        help = "Directory of raw flat frames"
    )]
    flat: Option<PathBuf>,

    #[arg(
        long,
        required_unless_present = "write_config",
        help = "Directory of raw science frames"
    )]
    science: Option<PathBuf>,

    #[arg(long, help = "Directory of raw bias frames (omit to skip bias subtraction)")]
    bias: Option<PathBuf>,

    #[arg(long, default_value = "object", help = "IMAGETYP of the science frames")]
    science_imagetyp: String,

    #[arg(long, help = "JSON reduction configuration")]
    config: Option<PathBuf>,

    #[arg(long, help = "Detector gain in electrons per ADU")]
    gain: Option<f64>,

    #[arg(long, help = "Read noise in electrons")]
    read_noise: Option<f64>,

    #[arg(long, value_enum, help = "How the errors of a nod pair are combined")]
    error_combination: Option<ErrorCombination>,

    #[arg(long, help = "Do not subtract master darks from science frames")]
    no_science_dark: bool,

    #[arg(long, help = "Abort on the first frame that fails")]
    fail_fast: bool,

    #[arg(
        long,
        value_name = "PATH",
        help = "Write the effective configuration as JSON and exit"
    )]
    write_config: Option<PathBuf>,
}

fn effective_config(args: &Args) -> Result<ReductionConfig> {
    let mut config = match &args.config {
        Some(path) => ReductionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ReductionConfig::default(),
    };

    if let Some(gain) = args.gain {
        config.noise.gain = gain;
    }
    if let Some(read_noise) = args.read_noise {
        config.noise.read_noise = read_noise;
    }
    if let Some(policy) = args.error_combination {
        config.error_combination = policy;
    }
    if args.no_science_dark {
        config.dark_correct_science = false;
    }
    if args.fail_fast {
        config.fail_fast = true;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let config = effective_config(&args)?;

    if let Some(path) = &args.write_config {
        config
            .save_to_file(path)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        info!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    info!("CCD reduction");
    info!("=============");
    info!(
        "Gain {} e-/ADU, read noise {} e-, error combination {:?}",
        config.noise.gain, config.noise.read_noise, config.error_combination
    );

    let (Some(dark), Some(flat), Some(science)) = (&args.dark, &args.flat, &args.science) else {
        anyhow::bail!("--dark, --flat and --science are required to run a reduction");
    };
    let mut inputs = PipelineInputs::new(dark, flat, science)
        .with_science_imagetyp(args.science_imagetyp.clone());
    if let Some(bias) = &args.bias {
        inputs = inputs.with_bias(bias);
    }

    let pipeline = CalibrationPipeline::new(config, FitsStore::new());
    let report = pipeline.run(&inputs).context("Reduction failed")?;

    if !report.is_clean() {
        anyhow::bail!("{} frames could not be reduced", report.failures.len());
    }
    Ok(())
}
