use axum::{extract::State, Json};
use serde::Serialize;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use zstudio_core::SystemStats;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: SystemStats,
    pub display: String,
    pub poll_interval_ms: u64,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    // Sampling shells out to nvidia-smi; keep it off the event loop
    let monitor = state.monitor.clone();
    let stats = tokio::task::spawn_blocking(move || monitor.sample())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(StatsResponse {
        display: stats.to_string(),
        stats,
        poll_interval_ms: state.poll_interval_ms,
    }))
}

#[derive(Serialize)]
pub struct OpenResponse {
    pub path: String,
}

pub async fn open_output(State(state): State<Arc<AppState>>) -> Result<Json<OpenResponse>, ApiError> {
    let dir = state.session.writer().dir().to_path_buf();
    std::fs::create_dir_all(&dir).map_err(ApiError::internal)?;
    reveal_in_file_manager(&dir).map_err(ApiError::internal)?;
    Ok(Json(OpenResponse {
        path: dir.display().to_string(),
    }))
}

fn reveal_in_file_manager(dir: &Path) -> std::io::Result<()> {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else if cfg!(target_os = "windows") {
        "explorer"
    } else {
        "xdg-open"
    };
    tracing::info!("Opening {:?} with {}", dir, opener);
    let mut command = Command::new(opener);
    command.arg(dir);
    spawn_reaped(command)?;
    Ok(())
}

/// Start `command` and wait on it in the background so it never lingers
/// as a zombie
fn spawn_reaped(mut command: Command) -> std::io::Result<JoinHandle<std::io::Result<ExitStatus>>> {
    let mut child = command.spawn()?;
    Ok(tokio::spawn(async move {
        let status = child.wait().await;
        if let Err(e) = &status {
            tracing::warn!("Failed to wait on file manager: {}", e);
        }
        status
    }))
}

/// Exit the process right away. In-flight work is abandoned.
pub async fn shutdown() -> Json<serde_json::Value> {
    tracing::warn!("Shutdown requested, exiting");
    tokio::spawn(async {
        // Give the response a moment to flush
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    Json(serde_json::json!({ "status": "shutting down" }))
}
