//! zstudio_runtime_api - Model provider contract
//!
//! This crate defines what the generation session needs from a loaded
//! diffusion model. The candle runtime implements it for Z-Image; tests
//! implement it with scripted fakes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Z-Image-Turbo is distilled for guidance-free sampling
pub const GUIDANCE_SCALE: f32 = 0.0;

/// Upper bound on prompt tokens fed to the text encoder
pub const MAX_SEQUENCE_LENGTH: usize = 1024;

/// Everything one inference call needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    pub prompt: String,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub max_sequence_length: usize,
    pub seed: u64,
}

impl InferenceParams {
    /// Params with the fixed guidance scale and sequence length filled in
    pub fn new(prompt: impl Into<String>, steps: u32, width: u32, height: u32, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            steps,
            guidance_scale: GUIDANCE_SCALE,
            width,
            height,
            max_sequence_length: MAX_SEQUENCE_LENGTH,
            seed,
        }
    }
}

/// Raw RGB output of a diffusion model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Raw pixel data (RGB, u8, row-major)
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GeneratedImage {
    pub fn into_rgb_image(self) -> Result<image::RgbImage> {
        let expected = self.width as usize * self.height as usize * 3;
        let actual = self.pixels.len();
        image::RgbImage::from_raw(self.width, self.height, self.pixels).ok_or_else(|| {
            anyhow::anyhow!(
                "Pixel buffer has {} bytes, expected {} for {}x{} RGB",
                actual,
                expected,
                self.width,
                self.height
            )
        })
    }
}

/// A loaded base model with hot-swappable adapter slot.
///
/// All methods may block for seconds. Callers serialize access; an
/// implementation never sees two calls at once.
pub trait DiffusionBackend: Send {
    /// Get the model name
    fn name(&self) -> &str;

    /// Read adapter weights from `source` and attach them under `identifier`.
    /// Any previously attached adapter has already been detached.
    fn attach_adapter(&mut self, source: &Path, identifier: &str) -> Result<()>;

    /// Remove the attached adapter, restoring base behaviour
    fn detach_adapter(&mut self) -> Result<()>;

    /// Change the strength of the attached adapter without re-reading it
    fn set_adapter_weight(&mut self, identifier: &str, weight: f32) -> Result<()>;

    /// Generate an image. Must not change base model weights.
    fn infer(&mut self, params: &InferenceParams) -> Result<GeneratedImage>;

    /// Free transient device buffers left over from the last call
    fn release_scratch(&mut self) {}
}

impl<B: DiffusionBackend + ?Sized> DiffusionBackend for Box<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn attach_adapter(&mut self, source: &Path, identifier: &str) -> Result<()> {
        (**self).attach_adapter(source, identifier)
    }

    fn detach_adapter(&mut self) -> Result<()> {
        (**self).detach_adapter()
    }

    fn set_adapter_weight(&mut self, identifier: &str, weight: f32) -> Result<()> {
        (**self).set_adapter_weight(identifier, weight)
    }

    fn infer(&mut self, params: &InferenceParams) -> Result<GeneratedImage> {
        (**self).infer(params)
    }

    fn release_scratch(&mut self) {
        (**self).release_scratch()
    }
}
