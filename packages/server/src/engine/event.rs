//! Event records and the event-type vocabulary.
//!
//! Events are immutable facts. Payloads are string maps; structured fields
//! ride as JSON strings inside them so the log schema stays stable as rules
//! evolve. The reducer branches on `event_type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{RoomId, UserId};

/// Opaque key/value bag carried by every event.
pub type Payload = BTreeMap<String, String>;

/// One appended fact. Immutable once persisted; `seq` is 1-based, strictly
/// increasing per room with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub room_id: RoomId,
    pub seq: i64,
    pub event_id: String,
    pub event_type: String,
    pub actor_user_id: UserId,
    pub causation_command_id: String,
    pub payload: Payload,
    /// Milliseconds since epoch, supplied by the room actor.
    pub server_ts: i64,
}

impl EventRecord {
    /// A not-yet-sequenced event; the room actor assigns `seq`, `room_id`
    /// and `server_ts` before reducing.
    pub fn draft(
        event_type: &str,
        actor: UserId,
        causation_command_id: &str,
        payload: Payload,
    ) -> Self {
        Self {
            room_id: RoomId::from(""),
            seq: 0,
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            actor_user_id: actor,
            causation_command_id: causation_command_id.to_string(),
            payload,
            server_ts: 0,
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

/// The closed vocabulary the reducer and projection understand. `write_event`
/// may append types outside this list; those reduce as no-ops and project as
/// privileged-only.
pub mod event_types {
    pub const PLAYER_JOINED: &str = "room.player_joined";
    pub const PLAYER_LEFT: &str = "room.player_left";
    pub const SEAT_CLAIMED: &str = "seat.claimed";
    pub const GAME_STARTED: &str = "game.started";
    /// Hidden setup: demon, minions, bluffs, red herring. Privileged-only.
    pub const SETUP_COMPLETED: &str = "setup.completed";
    pub const ROLE_ASSIGNED: &str = "role.assigned";
    pub const PHASE_CHANGED: &str = "phase.changed";
    pub const PUBLIC_CHAT: &str = "public.chat";
    pub const WHISPER_SENT: &str = "whisper.sent";
    pub const NOMINATION_CREATED: &str = "nomination.created";
    pub const DEFENSE_ENDED: &str = "defense.ended";
    pub const VOTE_CAST: &str = "vote.cast";
    pub const NOMINATION_RESOLVED: &str = "nomination.resolved";
    pub const EXECUTION_RESOLVED: &str = "execution.resolved";
    pub const PLAYER_DIED: &str = "player.died";
    pub const GAME_ENDED: &str = "game.ended";
    pub const ABILITY_USED: &str = "ability.used";
    /// Private information delivered to one player at night.
    pub const NIGHT_INFO: &str = "night.info";
    pub const SLAYER_SHOT: &str = "slayer.shot";
    pub const CONFIRMATION_REQUESTED: &str = "confirmation.requested";
}

/// Payload keys that must never reach a viewer who is not a named party or
/// privileged. The projection enforces this set.
pub const FORBIDDEN_PAYLOAD_KEYS: &[&str] = &[
    "true_role",
    "is_demon",
    "is_minion",
    "night_info",
    "bluffs",
    "red_herring",
];

/// Builder shorthand for payload maps.
pub fn payload<const N: usize>(pairs: [(&str, String); N]) -> Payload {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_mints_event_id() {
        let a = EventRecord::draft(event_types::PUBLIC_CHAT, UserId::from("u"), "c-1", Payload::new());
        let b = EventRecord::draft(event_types::PUBLIC_CHAT, UserId::from("u"), "c-1", Payload::new());
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.seq, 0);
    }

    #[test]
    fn payload_builder() {
        let p = payload([("message", "hi".to_string()), ("user_id", "u1".to_string())]);
        assert_eq!(p.get("message").unwrap(), "hi");
        assert_eq!(p.len(), 2);
    }
}
