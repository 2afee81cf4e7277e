//! Per-viewer visibility filtering.
//!
//! Every event and every state read passes through here before leaving the
//! server. The rules:
//! - public events go out with hidden-knowledge fields stripped,
//! - private events go only to their named parties and privileged viewers,
//! - events that would leak group knowledge are suppressed entirely.
//!
//! The yielded events are always a strictly-increasing-seq subsequence of
//! the true log; nothing is fabricated.

use serde::Serialize;

use crate::common::UserId;
use crate::engine::event::{event_types as et, EventRecord, FORBIDDEN_PAYLOAD_KEYS};
use crate::engine::state::{GameState, Phase, SubPhase, Team};

/// Who is looking. Privileged viewers (the storyteller) see everything.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_id: UserId,
    pub is_privileged: bool,
}

impl Viewer {
    pub fn new(user_id: UserId, is_privileged: bool) -> Self {
        Self {
            user_id,
            is_privileged,
        }
    }

    pub fn for_state(state: &GameState, user_id: UserId) -> Self {
        let is_privileged = state.is_privileged(&user_id);
        Self {
            user_id,
            is_privileged,
        }
    }

    fn named(&self, event: &EventRecord, key: &str) -> bool {
        event.field(key) == Some(self.user_id.as_str())
    }
}

/// Filter one event for one viewer. `None` suppresses it entirely.
pub fn project_event(
    event: &EventRecord,
    _post_state: &GameState,
    viewer: &Viewer,
) -> Option<EventRecord> {
    if viewer.is_privileged {
        return Some(event.clone());
    }
    match event.event_type.as_str() {
        // Public record: everyone sees it, hidden fields stripped.
        et::PLAYER_JOINED
        | et::PLAYER_LEFT
        | et::SEAT_CLAIMED
        | et::GAME_STARTED
        | et::PHASE_CHANGED
        | et::PUBLIC_CHAT
        | et::NOMINATION_CREATED
        | et::DEFENSE_ENDED
        | et::VOTE_CAST
        | et::NOMINATION_RESOLVED
        | et::EXECUTION_RESOLVED
        | et::PLAYER_DIED
        | et::GAME_ENDED
        | et::SLAYER_SHOT => Some(sanitize(event)),

        // Named parties only.
        et::WHISPER_SENT => {
            if viewer.named(event, "from") || viewer.named(event, "to") {
                Some(event.clone())
            } else {
                None
            }
        }
        et::ROLE_ASSIGNED => {
            if viewer.named(event, "user_id") {
                Some(event.clone())
            } else {
                None
            }
        }
        et::ABILITY_USED | et::NIGHT_INFO | et::CONFIRMATION_REQUESTED => {
            if viewer.named(event, "user_id") {
                Some(event.clone())
            } else {
                None
            }
        }

        // Whole-group secrets never leave the storyteller's view.
        et::SETUP_COMPLETED => None,

        // write_event vocabulary: auditable declarations default to public
        // with hidden fields stripped, unless addressed to one player.
        _ => {
            if let Some(addressee) = event.field("user_id") {
                if addressee != viewer.user_id.as_str() {
                    return None;
                }
            }
            Some(sanitize(event))
        }
    }
}

fn sanitize(event: &EventRecord) -> EventRecord {
    let mut out = event.clone();
    out.payload
        .retain(|key, _| !FORBIDDEN_PAYLOAD_KEYS.contains(&key.as_str()));
    out
}

/// The state a viewer is allowed to read: public fields, plus their own
/// full record.
#[derive(Debug, Clone, Serialize)]
pub struct VisibleState {
    pub room_id: String,
    pub phase: Phase,
    pub sub_phase: SubPhase,
    pub players: Vec<VisiblePlayer>,
    pub seat_order: Vec<String>,
    pub nomination: Option<VisibleNomination>,
    pub day_number: u32,
    pub night_number: u32,
    pub winner: Option<Team>,
    pub ruleset_id: String,
    pub last_seq: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisiblePlayer {
    pub user_id: String,
    pub display_name: String,
    pub is_storyteller: bool,
    pub seat: Option<u32>,
    pub alive: bool,
    pub ghost_vote_used: bool,
    /// Only present on the viewer's own record or for privileged viewers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub night_info: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisibleNomination {
    pub nominator: String,
    pub nominee: String,
    pub yes_count: u32,
    pub votes_cast: u32,
    pub resolved: bool,
}

/// Filter the whole state for one viewer.
pub fn project_state(state: &GameState, viewer: &Viewer) -> VisibleState {
    let players = state
        .players
        .values()
        .map(|p| {
            let own = viewer.is_privileged || p.user_id == viewer.user_id;
            VisiblePlayer {
                user_id: p.user_id.to_string(),
                display_name: p.display_name.clone(),
                is_storyteller: p.is_storyteller,
                seat: p.seat,
                alive: p.alive,
                ghost_vote_used: p.ghost_vote_used,
                role: if own { p.role.clone() } else { None },
                team: if own { p.team } else { None },
                night_info: if own { p.night_info.clone() } else { Vec::new() },
            }
        })
        .collect();
    VisibleState {
        room_id: state.room_id.to_string(),
        phase: state.phase,
        sub_phase: state.sub_phase,
        players,
        seat_order: state.seat_order.iter().map(|id| id.to_string()).collect(),
        nomination: state.nomination.as_ref().map(|n| VisibleNomination {
            nominator: n.nominator.to_string(),
            nominee: n.nominee.to_string(),
            yes_count: n.yes_count(),
            votes_cast: n.votes.len() as u32,
            resolved: n.resolved,
        }),
        day_number: state.day_number,
        night_number: state.night_number,
        winner: state.winner,
        ruleset_id: state.ruleset_id.clone(),
        last_seq: state.last_seq,
    }
}
