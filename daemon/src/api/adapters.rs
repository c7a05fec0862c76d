use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use zstudio_core::AdapterIdentity;

use crate::session::{ActiveAdapter, SessionState};
use crate::state::AppState;

#[derive(Serialize)]
pub struct AdapterObject {
    pub id: AdapterIdentity,
    pub name: String,
}

#[derive(Serialize)]
pub struct AdaptersResponse {
    pub adapters: Vec<AdapterObject>,
    pub active: Option<ActiveAdapter>,
    pub state: SessionState,
    pub model: String,
}

fn listing(state: &AppState, adapters: Vec<AdapterIdentity>) -> AdaptersResponse {
    let session = &state.session;
    AdaptersResponse {
        adapters: adapters
            .into_iter()
            .map(|id| AdapterObject {
                name: id.display_name().to_string(),
                id,
            })
            .collect(),
        active: session.active_adapter(),
        state: session.state(),
        model: session.model_name().to_string(),
    }
}

pub async fn list_adapters(State(state): State<Arc<AppState>>) -> Json<AdaptersResponse> {
    let adapters = state.session.registry().list();
    Json(listing(&state, adapters))
}

pub async fn refresh_adapters(State(state): State<Arc<AppState>>) -> Json<AdaptersResponse> {
    let adapters = state.session.registry().refresh();
    Json(listing(&state, adapters))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::TestApp;
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_listing_tracks_directory() {
        let app = TestApp::new();

        let (status, body) = app.get("/api/adapters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["adapters"], json!([]));
        assert_eq!(body["active"], Value::Null);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["model"], "mock");

        app.add_adapter("b_style.safetensors");
        app.add_adapter("a_style.safetensors");
        let (status, body) = app.post("/api/adapters/refresh", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body["adapters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["a_style.safetensors", "b_style.safetensors"]);
        assert_eq!(body["adapters"][0]["name"], "a_style");
    }

    #[tokio::test]
    async fn test_active_adapter_reported() {
        let app = TestApp::new();
        app.add_adapter("style.safetensors");
        let (status, _) = app
            .post(
                "/api/generate",
                json!({"prompt": "x", "adapter": "style.safetensors", "adapter_weight": 1.25}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = app.get("/api/adapters").await;
        assert_eq!(body["active"]["identity"], "style.safetensors");
        assert_eq!(body["active"]["weight"], 1.25);
    }
}
