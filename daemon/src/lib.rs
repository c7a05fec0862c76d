//! zstudio_daemon - Generation session and HTTP server
//!
//! This crate provides:
//! - The generation session that owns the loaded model and its adapter
//! - Validation of loosely typed generation input
//! - The HTTP API and web UI

pub mod api;
pub mod error;
pub mod server;
pub mod session;
pub mod state;
pub mod validate;

#[cfg(test)]
mod testing;

pub use error::SessionError;
pub use server::run_server;
pub use session::{ActiveAdapter, GenerationResult, GenerationSession, SessionState};
pub use state::AppState;
pub use validate::{GenerationRequest, RawGenerationInput, RequestValidator, SeedChoice};
