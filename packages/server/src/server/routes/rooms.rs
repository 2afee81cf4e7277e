//! Room REST surface.
//!
//! Everything read here is projected for the caller; everything written
//! goes through the command pipeline like any other client.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::common::{CoreError, RoomId};
use crate::engine::{CommandEnvelope, CommandType};
use crate::projection::{project_event, project_state, Viewer};
use crate::realtime::protocol::WireEvent;
use crate::server::app::AppState;
use crate::server::middleware::AuthUser;

const EVENTS_PAGE: i64 = 200;

/// CoreError as an HTTP response.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Transient(_) | CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": { "code": self.0.code(), "message": self.0.to_string() }
        }));
        (status, body).into_response()
    }
}

/// POST /rooms - create (ensure) a room and return its id.
pub async fn create_room(
    Extension(state): Extension<AppState>,
    Extension(_user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::from(uuid::Uuid::new_v4().to_string());
    state.manager.get_or_create(&room_id).await?;
    Ok(Json(json!({ "room_id": room_id })))
}

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub storyteller: bool,
}

/// POST /rooms/{id}/join - add the caller as a member.
pub async fn join_room(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
    body: Option<Json<JoinBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::from(room_id.as_str());
    let body = body.map(|Json(b)| b).unwrap_or(JoinBody {
        display_name: None,
        storyteller: false,
    });

    let envelope = CommandEnvelope::new(
        room_id.clone(),
        CommandType::Join,
        user.user_id.clone(),
        json!({
            "display_name": body.display_name.unwrap_or_else(|| user.user_id.to_string()),
            "storyteller": body.storyteller,
        }),
    );

    let handle = state.manager.get_or_create(&room_id).await?;
    let result = handle.dispatch(envelope).await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after_seq: i64,
    pub limit: Option<i64>,
}

/// GET /rooms/{id}/events?after_seq= - paged, projected history.
pub async fn room_events(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::from(room_id.as_str());
    let handle = state.manager.get_or_create(&room_id).await?;
    let game_state = handle.state().await;
    if !game_state.is_member(&user.user_id) {
        return Err(CoreError::Forbidden("not a member of this room".to_string()).into());
    }
    let viewer = Viewer::for_state(&game_state, user.user_id.clone());

    let limit = query.limit.unwrap_or(EVENTS_PAGE).clamp(1, EVENTS_PAGE);
    let events = state
        .manager
        .store()
        .load_events_after(&room_id, query.after_seq.max(0), limit)
        .await
        .map_err(|e| CoreError::Transient(anyhow::anyhow!(e)))?;

    let visible: Vec<WireEvent> = events
        .into_iter()
        .filter_map(|event| project_event(&event, &game_state, &viewer))
        .map(WireEvent::from)
        .collect();
    Ok(Json(json!({ "events": visible })))
}

/// GET /rooms/{id}/state - the projected current state.
pub async fn room_state(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::from(room_id.as_str());
    let handle = state.manager.get_or_create(&room_id).await?;
    let game_state = handle.state().await;
    if !game_state.is_member(&user.user_id) {
        return Err(CoreError::Forbidden("not a member of this room".to_string()).into());
    }
    let viewer = Viewer::for_state(&game_state, user.user_id.clone());
    let visible = project_state(&game_state, &viewer);
    Ok(Json(serde_json::to_value(visible).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub to_seq: i64,
}

/// GET /rooms/{id}/replay?to_seq= - all projected events up to a seq.
pub async fn room_replay(
    Extension(state): Extension<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let room_id = RoomId::from(room_id.as_str());
    let handle = state.manager.get_or_create(&room_id).await?;
    let game_state = handle.state().await;
    if !game_state.is_member(&user.user_id) {
        return Err(CoreError::Forbidden("not a member of this room".to_string()).into());
    }
    let viewer = Viewer::for_state(&game_state, user.user_id.clone());

    let events = state
        .manager
        .store()
        .load_events_up_to(&room_id, query.to_seq)
        .await
        .map_err(|e| CoreError::Transient(anyhow::anyhow!(e)))?;

    let visible: Vec<WireEvent> = events
        .into_iter()
        .filter_map(|event| project_event(&event, &game_state, &viewer))
        .map(WireEvent::from)
        .collect();
    Ok(Json(json!({ "events": visible })))
}
