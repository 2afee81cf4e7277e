pub mod health;
pub mod rooms;
pub mod ws;

pub use health::health_handler;
pub use rooms::{create_room, join_room, room_events, room_replay, room_state};
pub use ws::ws_handler;
