//! Locating (and if needed downloading) model snapshots

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Files the Z-Image pipeline reads. Shards that a repo does not have are
/// skipped with a warning.
const REQUIRED_FILES: &[&str] = &[
    "tokenizer/tokenizer.json",
    "transformer/config.json",
    "vae/diffusion_pytorch_model.safetensors",
];

const OPTIONAL_FILES: &[&str] = &[
    "tokenizer/tokenizer_config.json",
    "text_encoder/config.json",
    "vae/config.json",
];

/// Resolve `model` to a local snapshot directory.
///
/// `model` may be a local path, a repo id already present in `cache_dir`,
/// or a HuggingFace repo id to download.
pub fn resolve_model_path(model: &str, cache_dir: &Path, hf_token: Option<&str>) -> Result<PathBuf> {
    let path = PathBuf::from(model);
    if path.exists() {
        return Ok(path.canonicalize()?);
    }

    if let Some(local) = find_cached_snapshot(model, cache_dir)? {
        tracing::info!("Using cached model at {}", local.display());
        return Ok(local);
    }

    tracing::info!("Model not found locally, downloading from HuggingFace: {}", model);
    download_snapshot(model, cache_dir, hf_token)
}

/// Look for `<cache>/models--org--name/snapshots/*` or `<cache>/org--name`
pub fn find_cached_snapshot(model: &str, cache_dir: &Path) -> Result<Option<PathBuf>> {
    let hf_name = model.replace('/', "--");

    for dir in [
        cache_dir.join(format!("models--{}", hf_name)),
        cache_dir.join(&hf_name),
    ] {
        if !dir.exists() {
            continue;
        }
        let snapshots = dir.join("snapshots");
        if !snapshots.exists() {
            return Ok(Some(dir));
        }
        if let Some(latest) = latest_entry(&snapshots)? {
            return Ok(Some(latest));
        }
    }

    Ok(None)
}

fn latest_entry(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| std::cmp::Reverse(e.metadata().ok().and_then(|m| m.modified().ok())));
    Ok(entries.first().map(|e| e.path()))
}

fn download_snapshot(model: &str, cache_dir: &Path, hf_token: Option<&str>) -> Result<PathBuf> {
    std::fs::create_dir_all(cache_dir)?;

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_token(hf_token.map(str::to_string))
        .build()?;
    let repo = api.model(model.to_string());

    let mut snapshot = None;
    for file in REQUIRED_FILES {
        tracing::info!("Downloading {}", file);
        let local = repo
            .get(file)
            .with_context(|| format!("Failed to download {} from {}", file, model))?;
        if snapshot.is_none() {
            // <snapshot>/tokenizer/tokenizer.json
            snapshot = local.parent().and_then(Path::parent).map(Path::to_path_buf);
        }
    }

    for file in OPTIONAL_FILES {
        if let Err(e) = repo.get(file) {
            tracing::warn!("Could not download {}: {}", file, e);
        }
    }

    for i in 1..=3 {
        for file in [
            format!("text_encoder/model-{:05}-of-00003.safetensors", i),
            format!("transformer/diffusion_pytorch_model-{:05}-of-00003.safetensors", i),
        ] {
            tracing::info!("Downloading {}", file);
            if let Err(e) = repo.get(&file) {
                tracing::warn!("Could not download {}: {}", file, e);
            }
        }
    }

    snapshot.ok_or_else(|| {
        anyhow::anyhow!(
            "Failed to download model: {}. Check your internet connection and try again.",
            model
        )
    })
}
