use thiserror::Error;
use zstudio_core::OutputError;

/// Every way a generate call can fail. None of these are fatal to the
/// process; the session is back to idle whenever one is returned.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Failed to load adapter {adapter}: {reason}")]
    AdapterLoad { adapter: String, reason: String },

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Another generation is already running")]
    Busy,

    #[error("Failed to save image: {0}")]
    Output(#[from] OutputError),
}

impl SessionError {
    /// Short machine-readable tag used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::AdapterNotFound(_) => "adapter_not_found",
            SessionError::AdapterLoad { .. } => "adapter_load_error",
            SessionError::GenerationFailed(_) => "generation_failed",
            SessionError::Busy => "busy",
            SessionError::Output(_) => "output_error",
        }
    }
}

/// Flatten an anyhow chain into one line
pub(crate) fn reason(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
