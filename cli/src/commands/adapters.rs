use anyhow::Result;
use zstudio_core::{AdapterRegistry, Config};

pub fn execute() -> Result<()> {
    let config = Config::load()?;
    let registry = AdapterRegistry::new(config.paths.adapters_dir.clone());
    let adapters = registry.list();

    if adapters.is_empty() {
        println!("No adapters found in {}", registry.dir().display());
        println!("\nDrop .safetensors LoRA files there and they will show up here.");
        return Ok(());
    }

    println!("{:<40} FILE", "NAME");
    println!("{}", "-".repeat(72));
    for adapter in &adapters {
        println!("{:<40} {}", adapter.display_name(), adapter);
    }
    println!("\n{} adapter(s) in {}", adapters.len(), registry.dir().display());

    Ok(())
}
