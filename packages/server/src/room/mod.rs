//! Per-room runtime: single-writer actors, their subscriber fan-out, and
//! the process-wide registry that owns them.

pub mod actor;
pub mod manager;
pub mod subscriber;

use async_trait::async_trait;

use crate::common::CoreError;
use crate::engine::{CommandEnvelope, CommandResult};

pub use actor::RoomHandle;
pub use manager::{RoomConfig, RoomManager};
pub use subscriber::{Subscription, SubscriberSet};

/// The one door into a room's command pipeline. Sessions, REST handlers
/// and AI tools all submit through this; nothing mutates state directly.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn submit(&self, envelope: CommandEnvelope) -> Result<CommandResult, CoreError>;
}
