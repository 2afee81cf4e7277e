//! Deterministic rule engine.
//!
//! Two pure functions over the authoritative state:
//! - [`handle_command`] turns a command envelope into a list of events (or a
//!   rejection) without performing any I/O,
//! - [`reduce`] folds one event into the state.
//!
//! Timestamps come in on the envelope context and randomness only through a
//! seedable source, so the same inputs always produce the same events.

pub mod command;
pub mod event;
pub mod handlers;
pub mod reduce;
pub mod ruleset;
pub mod state;

pub use command::{CommandEnvelope, CommandResult, CommandStatus, CommandType};
pub use event::{event_types, EventRecord, Payload};
pub use handlers::{handle_command, EngineContext, EngineError};
pub use reduce::reduce;
pub use ruleset::{Ruleset, RoleKind};
pub use state::{GameState, Nomination, Phase, Player, SubPhase, Team};
