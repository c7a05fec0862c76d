use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use zstudio_core::Config;
use zstudio_runtime_api::DiffusionBackend;

use crate::api;
use crate::state::AppState;

/// The full application. No CORS layer: only pages served from this origin
/// may call the API.
pub fn app(state: Arc<AppState>) -> Router {
    api::routes(state).layer(TraceLayer::new_for_http())
}

/// Serve the UI and API until the process exits
pub async fn run_server(
    addr: SocketAddr,
    config: &Config,
    backend: Box<dyn DiffusionBackend>,
) -> Result<()> {
    let state = Arc::new(AppState::new(config, backend)?);

    tracing::info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;

    Ok(())
}
