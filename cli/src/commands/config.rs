use anyhow::Result;
use zstudio_core::Config;

const SECTIONS: &[(&str, &[&str])] = &[
    ("server", &["host", "port", "open_browser"]),
    ("paths", &["output_dir", "adapters_dir", "model_cache_dir"]),
    ("model", &["repo_id", "precision", "use_gpu", "hf_token"]),
    ("generation", &["steps", "width", "height", "busy_policy"]),
    ("monitor", &["poll_interval_ms"]),
];

pub fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, _) => {
            println!("Configuration file: {:?}", Config::config_path()?);
            for (section, keys) in SECTIONS {
                println!("\n[{}]", section);
                for k in *keys {
                    let value = config.get(&format!("{}.{}", section, k))?;
                    let value = if value.is_empty() { "(not set)".to_string() } else { value };
                    println!("  {} = {}", k, value);
                }
            }
        }

        // Get a specific key
        (Some(key), None) => {
            println!("{}", config.get(key)?);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            config.set(key, value)?;
            config.save()?;
            println!("Set {} = {}", key, config.get(key)?);
        }
    }

    Ok(())
}
