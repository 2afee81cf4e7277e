//! WebSocket endpoint.
//!
//! GET /ws?token=JWT
//!
//! Auth happens at the handshake: browsers cannot set custom headers on a
//! WebSocket upgrade, so the token rides a query param with an
//! Authorization-header fallback for non-browser clients. Rejected tokens
//! never upgrade.

use axum::{
    extract::{Extension, Query, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::common::UserId;
use crate::realtime::run_session;
use crate::server::app::AppState;
use crate::server::middleware::auth::extract_bearer_token;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query
        .token
        .or_else(|| extract_bearer_token(&headers))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state
        .jwt
        .verify_token(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user_id = UserId::from(claims.sub.as_str());
    let manager = state.manager.clone();
    Ok(ws.on_upgrade(move |socket| run_session(socket, manager, user_id)))
}
