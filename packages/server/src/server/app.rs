//! Application setup and router wiring.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
#[cfg(not(debug_assertions))]
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::room::RoomManager;
use crate::server::middleware::{auth_middleware, JwtService};
use crate::server::routes::{
    create_room, health_handler, join_room, room_events, room_replay, room_state, ws_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub jwt: Arc<JwtService>,
}

/// Build the Axum application router.
///
/// The WebSocket endpoint does its own handshake auth (query-param token);
/// everything else under /rooms sits behind the bearer middleware. Health
/// stays open for probes.
pub fn build_app(manager: Arc<RoomManager>, jwt: Arc<JwtService>) -> Router {
    let app_state = AppState {
        manager,
        jwt: jwt.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let jwt_for_middleware = jwt.clone();
    let protected = Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:id/join", post(join_room))
        .route("/rooms/:id/events", get(room_events))
        .route("/rooms/:id/state", get(room_state))
        .route("/rooms/:id/replay", get(room_replay))
        .layer(middleware::from_fn(move |req, next| {
            auth_middleware(jwt_for_middleware.clone(), req, next)
        }));

    // REST rate limiting in production builds only: 10/s per IP with a
    // burst of 20. Development shares a localhost IP, so it stays off
    // there. WebSocket sessions carry their own per-session bucket.
    #[cfg(not(debug_assertions))]
    let protected = {
        let rate_limit_config = std::sync::Arc::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(20)
                .use_headers()
                .finish()
                .expect("rate limiter configuration is valid"),
        );
        protected.layer(GovernorLayer {
            config: rate_limit_config,
        })
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
