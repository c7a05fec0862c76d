use axum::{extract::State, Json};
use base64::Engine;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;

use super::ApiError;
use crate::error::SessionError;
use crate::state::AppState;
use crate::validate::RawGenerationInput;

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub image_png_base64: String,
    pub seed_used: u32,
    pub duration_seconds: f64,
    pub saved_path: String,
    pub status: String,
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<RawGenerationInput>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request = state.validator.validate(raw)?;

    // The model call is long and synchronous; keep it off the event loop
    let worker = state.clone();
    let result = tokio::task::spawn_blocking(move || worker.generate_blocking(&request))
        .await
        .map_err(|e| {
            tracing::error!("Generation task aborted: {}", e);
            SessionError::GenerationFailed(format!("generation task aborted: {}", e))
        })??;

    let status = result.status_line();
    Ok(Json(GenerateResponse {
        image_png_base64: encode_png_base64(&result.image)?,
        seed_used: result.seed_used,
        duration_seconds: result.duration_seconds,
        saved_path: result.saved_path.display().to_string(),
        status,
    }))
}

fn encode_png_base64(image: &RgbImage) -> Result<String, ApiError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(ApiError::internal)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
