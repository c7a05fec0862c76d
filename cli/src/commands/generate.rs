//! One-shot image generation

use anyhow::Result;
use zstudio_core::{AdapterRegistry, Config, OutputWriter};
use zstudio_daemon::validate::Numeric;
use zstudio_daemon::{GenerationSession, RawGenerationInput, RequestValidator};

use crate::backend::{load_backend, print_gpu_banner, spinner};

pub struct GenerateArgs {
    pub prompt: String,
    pub steps: Option<u32>,
    pub seed: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub lora: Option<String>,
    pub lora_weight: f32,
    pub cpu: bool,
}

impl GenerateArgs {
    fn into_raw(self) -> RawGenerationInput {
        let number = |v: u32| Numeric::Int(v as i64);
        RawGenerationInput {
            prompt: self.prompt,
            steps: self.steps.map(number),
            seed: Some(Numeric::Int(self.seed)),
            width: self.width.map(number),
            height: self.height.map(number),
            adapter: self.lora,
            adapter_weight: Some(Numeric::Float(self.lora_weight as f64)),
        }
    }
}

pub async fn execute(args: GenerateArgs) -> Result<()> {
    let mut config = Config::load()?;
    if args.cpu {
        config.model.use_gpu = false;
    }
    config.ensure_dirs()?;

    // Reject bad input before paying for a model load
    let request = RequestValidator::new(config.generation.clone()).validate(args.into_raw())?;

    println!("Image Generation");
    println!("================");
    println!("Prompt: {}", request.prompt);
    println!("Size: {}x{}", request.width, request.height);
    println!("Steps: {}", request.steps);
    if let Some(adapter) = &request.adapter {
        println!("LoRA: {} @ {:.2}", adapter, request.adapter_weight);
    }
    print_gpu_banner();
    println!();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let backend = load_backend(&config)?;
        let session = GenerationSession::new(
            backend,
            AdapterRegistry::new(config.paths.adapters_dir.clone()),
            OutputWriter::new(&config.paths.output_dir)?,
        );

        let pb = spinner("Generating...")?;
        let result = session.generate(&request);
        pb.finish_and_clear();
        let result = result?;

        println!("Seed: {}", result.seed_used);
        println!("{}", result.status_line());
        Ok(())
    })
    .await??;

    Ok(())
}
