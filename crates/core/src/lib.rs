//! zstudio_core - Core library for the Z-Image studio
//!
//! This crate provides:
//! - Config file handling
//! - LoRA adapter discovery
//! - Output image naming and saving
//! - CPU/RAM/VRAM monitoring

pub mod adapters;
pub mod config;
pub mod output;
pub mod system;

pub use adapters::{AdapterIdentity, AdapterRegistry};
pub use config::{BusyPolicy, Config, Precision};
pub use output::{OutputError, OutputWriter};
pub use system::{SystemMonitor, SystemStats};
