//! Loading the diffusion backend described by the config

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use zstudio_core::system::{detect_gpu, GpuBackend};
use zstudio_core::Config;
use zstudio_runtime_api::DiffusionBackend;
use zstudio_runtime_diffusion::{load_model, resolve_model_path, select_device};

/// Spinner for long model calls
pub fn spinner(message: impl Into<String>) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")?);
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

pub fn print_gpu_banner() {
    let gpu = detect_gpu();
    match gpu.backend {
        GpuBackend::None => println!("GPU: none detected, generation will run on CPU"),
        backend => println!(
            "GPU: {} ({}, {:.1} GB)",
            gpu.name,
            backend,
            gpu.vram_mb as f64 / 1024.0
        ),
    }
    if gpu.is_blackwell() {
        println!("Blackwell GPU detected. Make sure your CUDA toolkit is 12.8 or newer.");
    }
}

/// Resolve, download if needed, and load the base model
pub fn load_backend(config: &Config) -> Result<Box<dyn DiffusionBackend>> {
    let pb = spinner(format!("Resolving {}", config.model.repo_id))?;
    let model_path = resolve_model_path(
        &config.model.repo_id,
        &config.paths.model_cache_dir,
        config.model.hf_token.as_deref(),
    )
    .with_context(|| format!("Failed to resolve model {}", config.model.repo_id))?;

    pb.set_message(format!("Loading model from {}", model_path.display()));
    let device = select_device(config.model.use_gpu)?;
    let pipeline = load_model(&model_path, config.model.precision, &device)
        .with_context(|| format!("Failed to load model from {}", model_path.display()))?;
    pb.finish_and_clear();

    println!("Model loaded: {}", pipeline.name());
    Ok(Box::new(pipeline))
}
