use anyhow::Result;
use std::sync::Arc;
use zstudio_core::{AdapterRegistry, BusyPolicy, Config, OutputWriter, SystemMonitor};
use zstudio_runtime_api::DiffusionBackend;

use crate::error::SessionError;
use crate::session::{GenerationResult, GenerationSession};
use crate::validate::{GenerationRequest, RequestValidator};

pub struct AppState {
    pub session: Arc<GenerationSession>,
    pub validator: RequestValidator,
    pub monitor: Arc<SystemMonitor>,
    pub busy_policy: BusyPolicy,
    pub poll_interval_ms: u64,
}

impl AppState {
    pub fn new(config: &Config, backend: Box<dyn DiffusionBackend>) -> Result<Self> {
        let registry = AdapterRegistry::new(config.paths.adapters_dir.clone());
        let writer = OutputWriter::new(&config.paths.output_dir)?;
        let session = GenerationSession::new(backend, registry, writer);
        Ok(Self::from_session(Arc::new(session), config))
    }

    pub fn from_session(session: Arc<GenerationSession>, config: &Config) -> Self {
        Self {
            session,
            validator: RequestValidator::new(config.generation.clone()),
            monitor: Arc::new(SystemMonitor::new()),
            busy_policy: config.generation.busy_policy,
            poll_interval_ms: config.monitor.poll_interval_ms,
        }
    }

    /// Run a request under the configured busy policy. Blocks the calling
    /// thread for the whole generation.
    pub fn generate_blocking(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, SessionError> {
        match self.busy_policy {
            BusyPolicy::Block => self.session.generate(request),
            BusyPolicy::Reject => self.session.try_generate(request),
        }
    }
}
