//! HTTP surface: REST routes, the WebSocket endpoint, and auth middleware.

pub mod app;
pub mod middleware;
pub mod routes;

pub use app::{build_app, AppState};
