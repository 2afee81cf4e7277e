//! Health check endpoint.

use axum::{extract::Extension, Json};
use serde_json::{json, Value};

use crate::server::app::AppState;

pub async fn health_handler(Extension(state): Extension<AppState>) -> Json<Value> {
    let active_rooms = state.manager.active_rooms().await;
    Json(json!({
        "status": "ok",
        "active_rooms": active_rooms,
    }))
}
