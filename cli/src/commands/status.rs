use anyhow::Result;
use zstudio_core::{Config, SystemMonitor};

use crate::backend::print_gpu_banner;

pub fn execute() -> Result<()> {
    let config = Config::load()?;

    println!("zstudio status\n");
    print_gpu_banner();

    let monitor = SystemMonitor::new();
    // CPU load is measured between two samples
    monitor.sample();
    std::thread::sleep(std::time::Duration::from_millis(250));
    println!("{}", monitor.sample());

    println!();
    println!("Model:    {} ({})", config.model.repo_id, config.model.precision);
    println!("Cache:    {}", config.paths.model_cache_dir.display());
    println!("Outputs:  {}", config.paths.output_dir.display());
    println!("Adapters: {}", config.paths.adapters_dir.display());
    println!("Config:   {}", Config::config_path()?.display());

    println!("\nRun `zstudio serve` to start the UI.");

    Ok(())
}
