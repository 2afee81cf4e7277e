//! Authoritative room state.
//!
//! `GameState` is the full storyteller view. It is only ever mutated by the
//! reducer on the room actor's task; everyone else sees it through the
//! projection layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::{RoomId, UserId};

/// Coarse game phase. Transitions follow the declared edges only; see the
/// phase machine in `handlers.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    FirstNight,
    Day,
    Nomination,
    Voting,
    Night,
    Ended,
}

impl Phase {
    /// True once roles have been dealt.
    pub fn is_started(&self) -> bool {
        !matches!(self, Phase::Lobby)
    }

    pub fn is_night(&self) -> bool {
        matches!(self, Phase::FirstNight | Phase::Night)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Lobby => "lobby",
            Phase::FirstNight => "first_night",
            Phase::Day => "day",
            Phase::Nomination => "nomination",
            Phase::Voting => "voting",
            Phase::Night => "night",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lobby" => Ok(Phase::Lobby),
            "first_night" => Ok(Phase::FirstNight),
            "day" => Ok(Phase::Day),
            "nomination" => Ok(Phase::Nomination),
            "voting" => Ok(Phase::Voting),
            "night" => Ok(Phase::Night),
            "ended" => Ok(Phase::Ended),
            _ => Err(anyhow::anyhow!("Invalid phase: {}", s)),
        }
    }
}

/// Fine-grained state inside `Day` and `Nomination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubPhase {
    Idle,
    Discussion,
    NominationOpen,
    Defense,
    Voting,
}

impl fmt::Display for SubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubPhase::Idle => "idle",
            SubPhase::Discussion => "discussion",
            SubPhase::NominationOpen => "nomination_open",
            SubPhase::Defense => "defense",
            SubPhase::Voting => "voting",
        };
        f.write_str(s)
    }
}

/// Alignment derived from the dealt role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    Good,
    Evil,
}

/// One seat at the table. `role`, `team`, `night_info` and `master` are
/// hidden knowledge; the projection strips them for other viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub user_id: UserId,
    pub display_name: String,
    /// The room's storyteller sees everything and never holds a seat.
    pub is_storyteller: bool,
    pub seat: Option<u32>,
    pub alive: bool,
    pub role: Option<String>,
    pub team: Option<Team>,
    /// Dead players keep a single ghost vote.
    pub ghost_vote_used: bool,
    /// Day-shot abilities (slayer) fire once per game.
    pub day_shot_used: bool,
    /// One-shot passive abilities (virgin) burn out on first trigger.
    pub once_ability_used: bool,
    /// Chosen master, for roles whose vote is locked to another player.
    pub master: Option<UserId>,
    /// Private information handed out at night, newest last.
    pub night_info: Vec<String>,
}

impl Player {
    pub fn new(user_id: UserId, display_name: String, is_storyteller: bool) -> Self {
        Self {
            user_id,
            display_name,
            is_storyteller,
            seat: None,
            alive: true,
            role: None,
            team: None,
            ghost_vote_used: false,
            day_shot_used: false,
            once_ability_used: false,
            master: None,
            night_info: Vec::new(),
        }
    }

    /// Eligible to cast a vote right now: alive, or dead with the ghost
    /// vote unspent.
    pub fn can_vote(&self) -> bool {
        !self.is_storyteller && (self.alive || !self.ghost_vote_used)
    }
}

/// An open accusation. At most one is unresolved at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nomination {
    pub nominator: UserId,
    pub nominee: UserId,
    /// Voter -> yes/no, insertion-deduplicated by the engine.
    pub votes: BTreeMap<UserId, bool>,
    pub resolved: bool,
}

impl Nomination {
    pub fn new(nominator: UserId, nominee: UserId) -> Self {
        Self {
            nominator,
            nominee,
            votes: BTreeMap::new(),
            resolved: false,
        }
    }

    pub fn yes_count(&self) -> u32 {
        self.votes.values().filter(|v| **v).count() as u32
    }
}

/// The full authoritative snapshot of one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    pub room_id: RoomId,
    pub phase: Phase,
    pub sub_phase: SubPhase,
    pub players: BTreeMap<UserId, Player>,
    /// Clockwise seat order of non-storyteller players.
    pub seat_order: Vec<UserId>,
    pub nomination: Option<Nomination>,
    /// Deaths accumulated during the night, announced at dawn.
    pub pending_deaths: Vec<UserId>,
    /// Non-empty iff the game has started.
    pub demon_id: Option<UserId>,
    pub minion_ids: Vec<UserId>,
    /// Out-of-play roles shown to the demon.
    pub bluffs: Vec<String>,
    /// Decoy the fortune teller reads as demonic.
    pub red_herring: Option<UserId>,
    /// Player protected from the demon tonight, if any.
    pub protected_tonight: Option<UserId>,
    /// Player poisoned tonight (ability results are unreliable), if any.
    /// Poison lasts through the following day and clears at dusk.
    pub poisoned_tonight: Option<UserId>,
    /// Players who already used their night ability tonight.
    pub acted_tonight: BTreeSet<UserId>,
    /// The most recent execution, consumed by roles that learn about it.
    pub last_executed: Option<UserId>,
    pub day_number: u32,
    pub night_number: u32,
    /// Players who have nominated / been nominated since dawn.
    pub nominators_today: BTreeSet<UserId>,
    pub nominees_today: BTreeSet<UserId>,
    /// Highest yes-count reached by any nomination since dawn; a later
    /// nomination must strictly beat it to execute.
    pub highest_vote_today: u32,
    pub executed_today: Option<UserId>,
    pub winner: Option<Team>,
    pub ruleset_id: String,
    /// Seq of the last applied event. 0 before any event.
    pub last_seq: i64,
}

impl GameState {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            phase: Phase::Lobby,
            sub_phase: SubPhase::Idle,
            players: BTreeMap::new(),
            seat_order: Vec::new(),
            nomination: None,
            pending_deaths: Vec::new(),
            demon_id: None,
            minion_ids: Vec::new(),
            bluffs: Vec::new(),
            red_herring: None,
            protected_tonight: None,
            poisoned_tonight: None,
            acted_tonight: BTreeSet::new(),
            last_executed: None,
            day_number: 0,
            night_number: 0,
            nominators_today: BTreeSet::new(),
            nominees_today: BTreeSet::new(),
            highest_vote_today: 0,
            executed_today: None,
            winner: None,
            ruleset_id: String::new(),
            last_seq: 0,
        }
    }

    pub fn player(&self, user_id: &UserId) -> Option<&Player> {
        self.players.get(user_id)
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.players.contains_key(user_id)
    }

    pub fn is_privileged(&self, user_id: &UserId) -> bool {
        user_id.is_system()
            || user_id.is_ai()
            || self
                .players
                .get(user_id)
                .map(|p| p.is_storyteller)
                .unwrap_or(false)
    }

    /// Seated, non-storyteller players in seat order.
    pub fn seated_players(&self) -> impl Iterator<Item = &Player> {
        self.seat_order.iter().filter_map(|id| self.players.get(id))
    }

    pub fn alive_count(&self) -> u32 {
        self.seated_players().filter(|p| p.alive).count() as u32
    }

    /// Votes needed to execute: strict majority threshold over the living.
    pub fn execution_threshold(&self) -> u32 {
        self.alive_count().div_ceil(2)
    }

    /// Everyone who may still cast a vote on the open nomination.
    pub fn eligible_voters(&self) -> Vec<UserId> {
        self.seated_players()
            .filter(|p| p.can_vote())
            .map(|p| p.user_id.clone())
            .collect()
    }

    pub fn poisoned(&self, user_id: &UserId) -> bool {
        self.poisoned_tonight.as_ref() == Some(user_id)
    }
}
