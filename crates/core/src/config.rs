use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Output, adapter and model cache locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Base model settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Defaults for the generation form
    #[serde(default)]
    pub generation: GenerationConfig,

    /// System stats polling
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Open the UI in the default browser once the server is up
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Where generated images are written (default: ./outputs)
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Where LoRA adapter files are discovered (default: ./loras)
    #[serde(default = "default_adapters_dir")]
    pub adapters_dir: PathBuf,

    /// Where model snapshots are cached (default: ~/.config/zstudio/models/)
    #[serde(default = "default_model_cache_dir")]
    pub model_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace repo id or local directory of the base model
    #[serde(default = "default_repo_id")]
    pub repo_id: String,

    /// Weight precision: bf16, f16 or f32
    #[serde(default = "default_precision")]
    pub precision: Precision,

    /// Use GPU acceleration (Metal on macOS, CUDA on Linux)
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,

    /// HuggingFace token for gated repos
    #[serde(default)]
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    F16,
    F32,
}

impl std::str::FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            "f16" | "fp16" | "float16" => Ok(Precision::F16),
            "f32" | "fp32" | "float32" => Ok(Precision::F32),
            _ => anyhow::bail!("Unknown precision: {} (expected bf16, f16 or f32)", s),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Bf16 => write!(f, "bf16"),
            Precision::F16 => write!(f, "f16"),
            Precision::F32 => write!(f, "f32"),
        }
    }
}

/// What to do with a generate call that arrives while another one is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the in-flight request to finish
    Block,
    /// Fail immediately with a busy error
    Reject,
}

impl std::str::FromStr for BusyPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block" => Ok(BusyPolicy::Block),
            "reject" => Ok(BusyPolicy::Reject),
            _ => anyhow::bail!("Unknown busy policy: {} (expected block or reject)", s),
        }
    }
}

impl std::fmt::Display for BusyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyPolicy::Block => write!(f, "block"),
            BusyPolicy::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_steps")]
    pub steps: u32,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,

    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often the UI refreshes CPU/RAM/VRAM readouts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7860
}

fn default_open_browser() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_adapters_dir() -> PathBuf {
    PathBuf::from("loras")
}

fn default_model_cache_dir() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/zstudio/models"))
}

fn default_repo_id() -> String {
    "Tongyi-MAI/Z-Image-Turbo".to_string()
}

fn default_precision() -> Precision {
    Precision::Bf16
}

fn default_use_gpu() -> bool {
    true
}

fn default_steps() -> u32 {
    8
}

fn default_dimension() -> u32 {
    1024
}

fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Block
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            open_browser: default_open_browser(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            adapters_dir: default_adapters_dir(),
            model_cache_dir: default_model_cache_dir(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo_id: default_repo_id(),
            precision: default_precision(),
            use_gpu: default_use_gpu(),
            hf_token: None,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            width: default_dimension(),
            height: default_dimension(),
            busy_policy: default_busy_policy(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/zstudio/
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("zstudio"))
    }

    /// Get the config file path: ~/.config/zstudio/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from a specific file, falling back to defaults if it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Create the output and adapter directories if they are missing
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.paths.output_dir, &self.paths.adapters_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Read a single dotted key, e.g. "server.port"
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "server.host" => self.server.host.clone(),
            "server.port" => self.server.port.to_string(),
            "server.open_browser" => self.server.open_browser.to_string(),
            "paths.output_dir" => self.paths.output_dir.display().to_string(),
            "paths.adapters_dir" => self.paths.adapters_dir.display().to_string(),
            "paths.model_cache_dir" => self.paths.model_cache_dir.display().to_string(),
            "model.repo_id" => self.model.repo_id.clone(),
            "model.precision" => self.model.precision.to_string(),
            "model.use_gpu" => self.model.use_gpu.to_string(),
            "model.hf_token" => self
                .model
                .hf_token
                .as_ref()
                .map(|_| "***".to_string())
                .unwrap_or_default(),
            "generation.steps" => self.generation.steps.to_string(),
            "generation.width" => self.generation.width.to_string(),
            "generation.height" => self.generation.height.to_string(),
            "generation.busy_policy" => self.generation.busy_policy.to_string(),
            "monitor.poll_interval_ms" => self.monitor.poll_interval_ms.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }

    /// Set a single dotted key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server.host" => self.server.host = value.to_string(),
            "server.port" => self.server.port = value.parse()?,
            "server.open_browser" => self.server.open_browser = value.parse()?,
            "paths.output_dir" => self.paths.output_dir = value.into(),
            "paths.adapters_dir" => self.paths.adapters_dir = value.into(),
            "paths.model_cache_dir" => self.paths.model_cache_dir = value.into(),
            "model.repo_id" => self.model.repo_id = value.to_string(),
            "model.precision" => self.model.precision = value.parse()?,
            "model.use_gpu" => self.model.use_gpu = value.parse()?,
            "model.hf_token" => {
                self.model.hf_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "generation.steps" => self.generation.steps = value.parse()?,
            "generation.width" => self.generation.width = value.parse()?,
            "generation.height" => self.generation.height = value.parse()?,
            "generation.busy_policy" => self.generation.busy_policy = value.parse()?,
            "monitor.poll_interval_ms" => self.monitor.poll_interval_ms = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}
