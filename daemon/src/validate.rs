//! Turning loosely typed form input into a [`GenerationRequest`]
//!
//! The UI is interactive and forgiving: numbers may arrive as floats or
//! strings, and out-of-range values are clamped instead of rejected. The only
//! hard error is a blank prompt (or an unreadable number / adapter name).

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use zstudio_core::config::GenerationConfig;
use zstudio_core::AdapterIdentity;

use crate::error::SessionError;

pub const STEPS_RANGE: RangeInclusive<u32> = 1..=50;
pub const DIMENSION_RANGE: RangeInclusive<u32> = 512..=2048;
pub const ADAPTER_WEIGHT_RANGE: RangeInclusive<f32> = 0.0..=2.0;
pub const MAX_SEED: u32 = 2_147_483_647;
/// Seed value meaning "draw one at random"
pub const RANDOM_SEED: i64 = -1;

const DEFAULT_ADAPTER_WEIGHT: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedChoice {
    Random,
    Fixed(u32),
}

/// A normalized request, ready for the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub steps: u32,
    pub seed: SeedChoice,
    pub width: u32,
    pub height: u32,
    pub adapter: Option<AdapterIdentity>,
    pub adapter_weight: f32,
}

/// A number as the UI may send it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric::Int(v)
    }
}

impl From<f64> for Numeric {
    fn from(v: f64) -> Self {
        Numeric::Float(v)
    }
}

impl Numeric {
    fn to_f64(&self, field: &str) -> Result<f64, SessionError> {
        let value = match self {
            Numeric::Int(v) => *v as f64,
            Numeric::Float(v) => *v,
            Numeric::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                SessionError::InvalidRequest(format!("{} must be a number, got '{}'", field, s))
            })?,
        };
        if !value.is_finite() {
            return Err(SessionError::InvalidRequest(format!(
                "{} must be a finite number",
                field
            )));
        }
        Ok(value)
    }

    fn to_i64(&self, field: &str) -> Result<i64, SessionError> {
        Ok(self.to_f64(field)?.round() as i64)
    }
}

/// Raw inputs from the form or the command line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawGenerationInput {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub steps: Option<Numeric>,
    #[serde(default)]
    pub seed: Option<Numeric>,
    #[serde(default)]
    pub width: Option<Numeric>,
    #[serde(default)]
    pub height: Option<Numeric>,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub adapter_weight: Option<Numeric>,
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    defaults: GenerationConfig,
}

fn clamp_u32(value: i64, range: &RangeInclusive<u32>) -> u32 {
    value.clamp(*range.start() as i64, *range.end() as i64) as u32
}

impl RequestValidator {
    /// Missing fields are filled from `defaults`
    pub fn new(defaults: GenerationConfig) -> Self {
        Self { defaults }
    }

    pub fn validate(&self, raw: RawGenerationInput) -> Result<GenerationRequest, SessionError> {
        let prompt = raw.prompt.trim();
        if prompt.is_empty() {
            return Err(SessionError::InvalidRequest(
                "Please enter a prompt.".to_string(),
            ));
        }

        let steps = match &raw.steps {
            Some(v) => v.to_i64("steps")?,
            None => self.defaults.steps as i64,
        };
        let width = match &raw.width {
            Some(v) => v.to_i64("width")?,
            None => self.defaults.width as i64,
        };
        let height = match &raw.height {
            Some(v) => v.to_i64("height")?,
            None => self.defaults.height as i64,
        };

        let seed = match &raw.seed {
            None => SeedChoice::Random,
            Some(v) => match v.to_i64("seed")? {
                RANDOM_SEED => SeedChoice::Random,
                s => SeedChoice::Fixed(s.clamp(0, MAX_SEED as i64) as u32),
            },
        };

        let adapter = match raw.adapter.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) if name.eq_ignore_ascii_case("none") => None,
            Some(name) => {
                let identity = AdapterIdentity::new(name);
                if !identity.is_plain_file_name() {
                    return Err(SessionError::InvalidRequest(format!(
                        "Adapter must be a file name inside the adapters folder, got '{}'",
                        name
                    )));
                }
                Some(identity)
            }
        };

        let adapter_weight = match &raw.adapter_weight {
            Some(v) => v.to_f64("adapter_weight")? as f32,
            None => DEFAULT_ADAPTER_WEIGHT,
        }
        .clamp(*ADAPTER_WEIGHT_RANGE.start(), *ADAPTER_WEIGHT_RANGE.end());

        Ok(GenerationRequest {
            prompt: prompt.to_string(),
            steps: clamp_u32(steps, &STEPS_RANGE),
            seed,
            width: clamp_u32(width, &DIMENSION_RANGE),
            height: clamp_u32(height, &DIMENSION_RANGE),
            adapter,
            adapter_weight,
        })
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new(GenerationConfig::default())
    }
}
