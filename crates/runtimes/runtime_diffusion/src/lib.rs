//! zstudio_runtime_diffusion - Diffusion model inference runtime
//!
//! This crate provides image generation with Z-Image-Turbo (S3-DiT) on
//! candle, including hot-swappable LoRA adapters.

pub mod fetch;
pub mod lora;
mod noise;
mod zimage;

use anyhow::Result;
use candle_core::{DType, Device};
use std::path::Path;
use zstudio_core::Precision;

pub use fetch::resolve_model_path;
pub use noise::seeded_noise;
pub use zimage::ZImagePipeline;

/// Pick the compute device for this build
pub fn select_device(use_gpu: bool) -> Result<Device> {
    if !use_gpu {
        tracing::info!("Using CPU (this will be slow)");
        return Ok(Device::Cpu);
    }

    #[cfg(feature = "metal")]
    {
        tracing::info!("Using Metal device");
        Ok(Device::new_metal(0)?)
    }
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    {
        tracing::info!("Using CUDA device");
        Ok(Device::new_cuda(0)?)
    }
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    {
        tracing::warn!("No GPU acceleration compiled in, using CPU");
        Ok(Device::Cpu)
    }
}

/// Weight dtype for `precision` on `device`. Half types fall back to f32 on CPU.
pub fn dtype_for(precision: Precision, device: &Device) -> DType {
    match precision {
        Precision::Bf16 => device.bf16_default_to_f32(),
        Precision::F16 if device.is_cpu() => DType::F32,
        Precision::F16 => DType::F16,
        Precision::F32 => DType::F32,
    }
}

/// Check the directory looks like a Z-Image snapshot
pub fn ensure_zimage_layout(model_path: &Path) -> Result<()> {
    let transformer_config = model_path.join("transformer").join("config.json");
    if transformer_config.exists() {
        let config_str = std::fs::read_to_string(&transformer_config)?;
        if config_str.contains("ZImage") || config_str.contains("z_image") {
            return Ok(());
        }
    }

    let dir_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    if dir_name.contains("z-image") || dir_name.contains("zimage") {
        return Ok(());
    }

    // hf-hub snapshots are named by commit hash; look at the repo dir
    let repo_name = model_path
        .parent()
        .and_then(Path::parent)
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    if repo_name.contains("z-image") || repo_name.contains("zimage") {
        return Ok(());
    }

    anyhow::bail!("Not a Z-Image model directory: {:?}", model_path)
}

/// Load the Z-Image pipeline from a snapshot directory
pub fn load_model(model_path: &Path, precision: Precision, device: &Device) -> Result<ZImagePipeline> {
    ensure_zimage_layout(model_path)?;
    let dtype = dtype_for(precision, device);
    tracing::info!("Loading Z-Image from {:?} ({:?} on {:?})", model_path, dtype, device);
    ZImagePipeline::load(model_path, device, dtype)
}
