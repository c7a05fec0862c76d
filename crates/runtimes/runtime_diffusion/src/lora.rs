//! LoRA (Low-Rank Adaptation) weight loading
//!
//! A LoRA stores, per linear layer, two small matrices whose product is a
//! low-rank update to the layer weight: W' = W + (alpha/rank) * strength * (B @ A)
//!
//! The factors are kept as loaded. Fusing produces a fresh weight map from the
//! untouched base map, so detaching an adapter is just rebuilding from base.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Prefixes trainers put in front of transformer layer names
const KNOWN_PREFIXES: &[&str] = &[
    "base_model.model.",
    "diffusion_model.",
    "transformer.",
    "lora_unet_",
    "lora_transformer_",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    Down,
    Up,
    Alpha,
}

/// One low-rank pair targeting a single base weight
#[derive(Debug)]
pub struct LoraWeight {
    /// Base tensor name, e.g. "layers.0.attention.to_q.weight"
    pub target: String,
    /// Down projection (A) [rank, in_features], f32
    pub lora_down: Tensor,
    /// Up projection (B) [out_features, rank], f32
    pub lora_up: Tensor,
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    fn scale(&self, strength: f32) -> f64 {
        (self.alpha / self.rank as f32 * strength) as f64
    }
}

#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    pub weights: Vec<LoraWeight>,
}

#[derive(Default)]
struct PendingPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f32>,
}

impl LoraAdapter {
    /// Load a LoRA from a safetensors file and match it against `base`.
    ///
    /// Pairs whose target is missing from `base`, or whose shapes do not fit
    /// it, are skipped with a warning. A file with no usable pair is an error.
    pub fn load(
        path: &Path,
        name: &str,
        base: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        info!(path = %path.display(), "Loading LoRA adapter");

        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read LoRA file: {}", path.display()))?;

        let mut pending: HashMap<String, PendingPair> = HashMap::new();
        for (key, tensor) in tensors {
            let Some((base_name, part)) = split_lora_key(&key) else {
                debug!(key = %key, "Ignoring non-LoRA tensor");
                continue;
            };
            let entry = pending.entry(base_name.to_string()).or_default();
            match part {
                LoraPart::Down => entry.down = Some(tensor.to_dtype(DType::F32)?),
                LoraPart::Up => entry.up = Some(tensor.to_dtype(DType::F32)?),
                LoraPart::Alpha => {
                    let alpha = tensor
                        .to_dtype(DType::F32)?
                        .to_device(&Device::Cpu)?
                        .flatten_all()?
                        .to_vec1::<f32>()?;
                    entry.alpha = alpha.first().copied();
                }
            }
        }

        let flat_index = flattened_index(base);
        let mut weights = Vec::new();

        for (base_name, pair) in pending {
            let (Some(lora_down), Some(lora_up)) = (pair.down, pair.up) else {
                warn!(layer = %base_name, "LoRA pair is missing its up or down half");
                continue;
            };

            let Some(target) = resolve_target(&base_name, base, &flat_index) else {
                warn!(layer = %base_name, "LoRA layer has no matching model weight");
                continue;
            };

            let base_dims = base[&target].dims().to_vec();
            let (down_dims, up_dims) = (lora_down.dims().to_vec(), lora_up.dims().to_vec());
            let fits = base_dims.len() == 2
                && down_dims.len() == 2
                && up_dims.len() == 2
                && up_dims[1] == down_dims[0]
                && up_dims[0] == base_dims[0]
                && down_dims[1] == base_dims[1];
            if !fits {
                warn!(
                    layer = %base_name,
                    base = ?base_dims,
                    down = ?down_dims,
                    up = ?up_dims,
                    "LoRA shapes do not fit model weight"
                );
                continue;
            }

            let rank = down_dims[0];
            let alpha = pair.alpha.unwrap_or(rank as f32);
            debug!(target = %target, rank, alpha, "Loaded LoRA weight pair");

            weights.push(LoraWeight {
                target,
                lora_down,
                lora_up,
                alpha,
                rank,
            });
        }

        if weights.is_empty() {
            anyhow::bail!(
                "No LoRA weights in {} match the model",
                path.display()
            );
        }

        weights.sort_by(|a, b| a.target.cmp(&b.target));
        info!(
            name = %name,
            weight_pairs = weights.len(),
            "LoRA adapter loaded"
        );

        Ok(Self {
            name: name.to_string(),
            weights,
        })
    }

    /// Get the number of weight pairs in this adapter
    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// New weight map: `base` with this adapter merged at `strength`.
    /// `base` itself is left untouched.
    pub fn fuse(
        &self,
        base: &HashMap<String, Tensor>,
        strength: f32,
    ) -> Result<HashMap<String, Tensor>> {
        let mut fused = base.clone();
        if strength == 0.0 {
            return Ok(fused);
        }

        for weight in &self.weights {
            let original = base
                .get(&weight.target)
                .with_context(|| format!("Model weight disappeared: {}", weight.target))?;
            let delta = (weight.lora_up.matmul(&weight.lora_down)? * weight.scale(strength))?;
            let merged = (original.to_dtype(DType::F32)? + delta.to_device(original.device())?)?
                .to_dtype(original.dtype())?;
            fused.insert(weight.target.clone(), merged);
        }

        Ok(fused)
    }
}

/// Split "x.lora_A.weight" style keys into ("x", part)
fn split_lora_key(key: &str) -> Option<(&str, LoraPart)> {
    if let Some(base) = key.strip_suffix(".alpha") {
        return Some((base, LoraPart::Alpha));
    }

    const MARKERS: &[(&str, LoraPart)] = &[
        (".lora_down", LoraPart::Down),
        (".lora_A", LoraPart::Down),
        (".lora_up", LoraPart::Up),
        (".lora_B", LoraPart::Up),
    ];

    MARKERS
        .iter()
        .find_map(|(marker, part)| key.rfind(marker).map(|pos| (&key[..pos], *part)))
}

fn strip_known_prefix(name: &str) -> &str {
    let mut name = name;
    for prefix in KNOWN_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
        }
    }
    name
}

/// "layers.0.attention.to_q.weight" is reachable as "layers_0_attention_to_q"
fn flattened_index(base: &HashMap<String, Tensor>) -> HashMap<String, String> {
    base.keys()
        .filter_map(|k| {
            k.strip_suffix(".weight")
                .map(|stem| (stem.replace('.', "_"), k.clone()))
        })
        .collect()
}

fn resolve_target(
    lora_name: &str,
    base: &HashMap<String, Tensor>,
    flat_index: &HashMap<String, String>,
) -> Option<String> {
    let stripped = strip_known_prefix(lora_name);
    let direct = format!("{}.weight", stripped);
    if base.contains_key(&direct) {
        return Some(direct);
    }
    flat_index.get(&stripped.replace('.', "_")).cloned()
}
