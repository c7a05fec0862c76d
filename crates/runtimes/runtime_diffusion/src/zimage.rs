//! Z-Image pipeline implementation
//!
//! Wraps candle-transformers' z_image module for image generation.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::z_image::{
    calculate_shift, postprocess_image, AutoEncoderKL, Config, FlowMatchEulerDiscreteScheduler,
    SchedulerConfig, TextEncoderConfig, VaeConfig, ZImageTextEncoder, ZImageTransformer2DModel,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use zstudio_runtime_api::{DiffusionBackend, GeneratedImage, InferenceParams};

use crate::lora::LoraAdapter;
use crate::noise::seeded_noise;

/// Z-Image scheduler constants
const BASE_IMAGE_SEQ_LEN: usize = 256;
const MAX_IMAGE_SEQ_LEN: usize = 4096;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

/// Latent channels of the Z-Image VAE
const LATENT_CHANNELS: usize = 16;
const VAE_ALIGN: usize = 16;

struct AttachedLora {
    adapter: LoraAdapter,
    weight: f32,
}

/// Z-Image generation pipeline
pub struct ZImagePipeline {
    tokenizer: Tokenizer,
    text_encoder: ZImageTextEncoder,
    transformer_cfg: Config,
    /// Base transformer weights as loaded; never modified
    base_weights: HashMap<String, Tensor>,
    /// Built from `base_weights` plus the attached LoRA; `None` until rebuilt
    transformer: Option<ZImageTransformer2DModel>,
    vae: AutoEncoderKL,
    device: Device,
    dtype: DType,
    lora: Option<AttachedLora>,
}

fn shard_files(dir: &Path, stem: &str) -> Vec<PathBuf> {
    (1..=3)
        .map(|i| dir.join(format!("{}-{:05}-of-00003.safetensors", stem, i)))
        .filter(|p| p.exists())
        .collect()
}

fn read_config<T: serde::de::DeserializeOwned>(path: &Path, fallback: impl FnOnce() -> T) -> Result<T> {
    if path.exists() {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(file).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        Ok(fallback())
    }
}

impl ZImagePipeline {
    /// Load Z-Image pipeline from a model directory
    pub fn load(model_path: &Path, device: &Device, dtype: DType) -> Result<Self> {
        // Load tokenizer
        let tokenizer_path = model_path.join("tokenizer").join("tokenizer.json");
        if !tokenizer_path.exists() {
            anyhow::bail!("Tokenizer not found at {:?}", tokenizer_path);
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        // Text encoder
        let text_encoder_dir = model_path.join("text_encoder");
        let text_encoder_cfg: TextEncoderConfig =
            read_config(&text_encoder_dir.join("config.json"), TextEncoderConfig::z_image)?;
        let text_encoder_files = shard_files(&text_encoder_dir, "model");
        if text_encoder_files.is_empty() {
            anyhow::bail!("Text encoder weights not found in {:?}", text_encoder_dir);
        }
        let text_encoder_weights =
            unsafe { VarBuilder::from_mmaped_safetensors(&text_encoder_files, dtype, device)? };
        let text_encoder = ZImageTextEncoder::new(&text_encoder_cfg, text_encoder_weights)?;
        tracing::info!("Text encoder loaded");

        // Transformer: weights are kept as a plain map so adapters can be
        // fused into copies of it
        let transformer_dir = model_path.join("transformer");
        let transformer_cfg: Config =
            read_config(&transformer_dir.join("config.json"), Config::z_image_turbo)?;
        let transformer_files = shard_files(&transformer_dir, "diffusion_pytorch_model");
        if transformer_files.is_empty() {
            anyhow::bail!("Transformer weights not found in {:?}", transformer_dir);
        }
        let mut base_weights = HashMap::new();
        for file in &transformer_files {
            let shard = candle_core::safetensors::load(file, device)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            for (name, tensor) in shard {
                base_weights.insert(name, tensor.to_dtype(dtype)?);
            }
        }
        let transformer = Self::build_transformer(&transformer_cfg, base_weights.clone(), device, dtype)?;
        tracing::info!("Transformer loaded ({} tensors)", base_weights.len());

        // VAE
        let vae_dir = model_path.join("vae");
        let vae_cfg: VaeConfig = read_config(&vae_dir.join("config.json"), VaeConfig::z_image)?;
        let vae_path = vae_dir.join("diffusion_pytorch_model.safetensors");
        if !vae_path.exists() {
            anyhow::bail!("VAE weights not found at {:?}", vae_path);
        }
        let vae_weights = unsafe { VarBuilder::from_mmaped_safetensors(&[vae_path], dtype, device)? };
        let vae = AutoEncoderKL::new(&vae_cfg, vae_weights)?;
        tracing::info!("VAE loaded");

        Ok(Self {
            tokenizer,
            text_encoder,
            transformer_cfg,
            base_weights,
            transformer: Some(transformer),
            vae,
            device: device.clone(),
            dtype,
            lora: None,
        })
    }

    fn build_transformer(
        cfg: &Config,
        weights: HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Result<ZImageTransformer2DModel> {
        let vb = VarBuilder::from_tensors(weights, dtype, device);
        Ok(ZImageTransformer2DModel::new(cfg, vb)?)
    }

    /// Drop the current transformer so the next inference rebuilds it
    fn invalidate_transformer(&mut self) {
        self.transformer = None;
    }

    fn transformer(&mut self) -> Result<&ZImageTransformer2DModel> {
        if self.transformer.is_none() {
            let weights = match &self.lora {
                Some(attached) => {
                    tracing::info!(
                        "Fusing LoRA {} at weight {:.2}",
                        attached.adapter.name,
                        attached.weight
                    );
                    attached.adapter.fuse(&self.base_weights, attached.weight)?
                }
                None => self.base_weights.clone(),
            };
            let transformer =
                Self::build_transformer(&self.transformer_cfg, weights, &self.device, self.dtype)?;
            self.transformer = Some(transformer);
        }
        self.transformer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Transformer unavailable"))
    }

    /// Format prompt for Qwen3 chat template
    fn format_prompt(prompt: &str) -> String {
        format!(
            "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            prompt
        )
    }

    fn encode_prompt(&self, prompt: &str, max_sequence_length: usize) -> Result<(Tensor, Tensor)> {
        let formatted_prompt = Self::format_prompt(prompt);
        let mut tokens = self
            .tokenizer
            .encode(formatted_prompt.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();
        if tokens.len() > max_sequence_length {
            tracing::warn!(
                "Prompt is {} tokens, truncating to {}",
                tokens.len(),
                max_sequence_length
            );
            tokens.truncate(max_sequence_length);
        }

        let len = tokens.len();
        let input_ids = Tensor::from_vec(tokens, (1, len), &self.device)?;
        let cap_feats = self.text_encoder.forward(&input_ids)?;
        let cap_mask = Tensor::ones((1, len), DType::U8, &self.device)?;
        Ok((cap_feats, cap_mask))
    }

    /// Generate image from request
    fn generate_internal(&mut self, params: &InferenceParams) -> Result<GeneratedImage> {
        let num_steps = params.steps as usize;
        let height = params.height as usize;
        let width = params.width as usize;

        if height % VAE_ALIGN != 0 || width % VAE_ALIGN != 0 {
            anyhow::bail!(
                "Image dimensions must be divisible by {}. Got {}x{}",
                VAE_ALIGN,
                width,
                height
            );
        }

        let (cap_feats, cap_mask) = self.encode_prompt(&params.prompt, params.max_sequence_length)?;
        if params.guidance_scale > 1.0 {
            tracing::warn!(
                "Guidance scale {} ignored: Z-Image-Turbo samples without CFG",
                params.guidance_scale
            );
        }

        let device = self.device.clone();
        let dtype = self.dtype;
        let transformer = self.transformer()?;

        // Calculate latent dimensions
        let patch_size = transformer.config().all_patch_size[0];
        let latent_h = 2 * (height / VAE_ALIGN);
        let latent_w = 2 * (width / VAE_ALIGN);

        // Calculate shift
        let image_seq_len = (latent_h / patch_size) * (latent_w / patch_size);
        let mu = calculate_shift(
            image_seq_len,
            BASE_IMAGE_SEQ_LEN,
            MAX_IMAGE_SEQ_LEN,
            BASE_SHIFT,
            MAX_SHIFT,
        );

        let mut scheduler = FlowMatchEulerDiscreteScheduler::new(SchedulerConfig::z_image_turbo());
        scheduler.set_timesteps(num_steps, Some(mu));

        let mut latents = seeded_noise(1, LATENT_CHANNELS, latent_h, latent_w, params.seed, &device)?
            .to_dtype(dtype)?;
        latents = latents.unsqueeze(2)?; // Add frame dimension

        // Denoising loop
        for step in 0..num_steps {
            let t = scheduler.current_timestep_normalized();
            let t_tensor = Tensor::from_vec(vec![t as f32], (1,), &device)?.to_dtype(dtype)?;

            let noise_pred = transformer.forward(&latents, &t_tensor, &cap_feats, &cap_mask)?;

            // Negate prediction (Z-Image specific)
            let noise_pred = noise_pred.neg()?;

            let noise_pred_4d = noise_pred.squeeze(2)?;
            let latents_4d = latents.squeeze(2)?;
            let prev_latents = scheduler.step(&noise_pred_4d, &latents_4d)?;
            latents = prev_latents.unsqueeze(2)?;

            tracing::debug!(step = step + 1, total = num_steps, "Denoising progress");
        }

        // VAE decode
        let latents = latents.squeeze(2)?;
        let image = self.vae.decode(&latents)?;

        // Post-process
        let image = postprocess_image(&image)?;
        let image = image.i(0)?; // Remove batch dimension

        let (c, h, w) = image.dims3()?;
        if c != 3 {
            anyhow::bail!("Expected 3 channels from VAE, got {}", c);
        }

        // CHW -> HWC for row-major RGB
        let pixels: Vec<u8> = image
            .permute((1, 2, 0))?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1()?;

        Ok(GeneratedImage {
            pixels,
            width: w as u32,
            height: h as u32,
        })
    }
}

impl DiffusionBackend for ZImagePipeline {
    fn name(&self) -> &str {
        "Z-Image-Turbo"
    }

    fn attach_adapter(&mut self, source: &Path, identifier: &str) -> Result<()> {
        let adapter = LoraAdapter::load(source, identifier, &self.base_weights, &self.device)?;
        self.lora = Some(AttachedLora {
            adapter,
            weight: 1.0,
        });
        self.invalidate_transformer();
        Ok(())
    }

    fn detach_adapter(&mut self) -> Result<()> {
        if let Some(attached) = self.lora.take() {
            tracing::info!("Detached LoRA {}", attached.adapter.name);
            self.invalidate_transformer();
        }
        Ok(())
    }

    fn set_adapter_weight(&mut self, identifier: &str, weight: f32) -> Result<()> {
        let attached = self
            .lora
            .as_mut()
            .filter(|a| a.adapter.name == identifier)
            .ok_or_else(|| anyhow::anyhow!("LoRA {} is not attached", identifier))?;
        if attached.weight != weight {
            attached.weight = weight;
            self.invalidate_transformer();
        }
        Ok(())
    }

    fn infer(&mut self, params: &InferenceParams) -> Result<GeneratedImage> {
        self.generate_internal(params)
    }

    fn release_scratch(&mut self) {
        if let Err(e) = self.device.synchronize() {
            tracing::warn!("Device synchronize failed: {}", e);
        }
    }
}

// ZImagePipeline is Send because:
// - tokenizer is thread-safe
// - candle models don't have interior mutability
// - all mutation goes through &mut self
unsafe impl Send for ZImagePipeline {}
