//! Long-lived client sessions over WebSocket.

pub mod protocol;
pub mod rate_limit;
pub mod session;

pub use protocol::{ClientMessage, ServerMessage};
pub use rate_limit::TokenBucket;
pub use session::run_session;
