//! Seeded latent noise
//!
//! Device RNGs differ between backends (and the CPU one cannot be seeded at
//! all), so the starting latents are drawn on the host and copied over. The
//! same seed gives the same noise on every device.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Standard normal noise of shape `(batch, channels, height, width)`
pub fn seeded_noise(
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    let len = batch * channels * height * width;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len);

    // Box-Muller, two samples per draw
    while values.len() < len {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        values.push(radius * theta.cos());
        if values.len() < len {
            values.push(radius * theta.sin());
        }
    }

    let noise = Tensor::from_vec(values, (batch, channels, height, width), &Device::Cpu)?;
    Ok(noise.to_device(device)?)
}
