//! Command envelopes and results.
//!
//! Commands are intent; events are facts. A command either produces a
//! non-empty event list (accepted) or a rejection, never both. The tuple
//! `(room_id, actor_user_id, idempotency_key, type)` is the dedup key for
//! exactly-once execution.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::common::{RoomId, UserId};

/// Closed set of commands the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Join,
    Leave,
    ClaimSeat,
    StartGame,
    PublicChat,
    Whisper,
    Nominate,
    EndDefense,
    Vote,
    ResolveNomination,
    UseAbility,
    AdvancePhase,
    WriteEvent,
    SlayerShot,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Join => "join",
            CommandType::Leave => "leave",
            CommandType::ClaimSeat => "claim_seat",
            CommandType::StartGame => "start_game",
            CommandType::PublicChat => "public_chat",
            CommandType::Whisper => "whisper",
            CommandType::Nominate => "nominate",
            CommandType::EndDefense => "end_defense",
            CommandType::Vote => "vote",
            CommandType::ResolveNomination => "resolve_nomination",
            CommandType::UseAbility => "ability.use",
            CommandType::AdvancePhase => "advance_phase",
            CommandType::WriteEvent => "write_event",
            CommandType::SlayerShot => "slayer_shot",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "join" => Ok(CommandType::Join),
            "leave" => Ok(CommandType::Leave),
            "claim_seat" => Ok(CommandType::ClaimSeat),
            "start_game" => Ok(CommandType::StartGame),
            "public_chat" => Ok(CommandType::PublicChat),
            "whisper" => Ok(CommandType::Whisper),
            "nominate" => Ok(CommandType::Nominate),
            "end_defense" => Ok(CommandType::EndDefense),
            "vote" => Ok(CommandType::Vote),
            "resolve_nomination" => Ok(CommandType::ResolveNomination),
            "ability.use" => Ok(CommandType::UseAbility),
            "advance_phase" => Ok(CommandType::AdvancePhase),
            "write_event" => Ok(CommandType::WriteEvent),
            "slayer_shot" => Ok(CommandType::SlayerShot),
            _ => Err(anyhow::anyhow!("Unknown command type: {}", s)),
        }
    }
}

/// One submitted command with its identity and idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub idempotency_key: String,
    pub room_id: RoomId,
    pub command_type: CommandType,
    pub actor_user_id: UserId,
    /// Advisory only; no optimistic-concurrency check is performed.
    pub last_seen_seq: Option<i64>,
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    pub fn new(
        room_id: RoomId,
        command_type: CommandType,
        actor: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            room_id,
            command_type,
            actor_user_id: actor,
            last_seen_seq: None,
            payload,
        }
    }

    /// Required string field from the JSON payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Accepted,
    Rejected,
    Duplicate,
}

/// Outcome returned to the submitter and memoised in the dedup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_seq_from: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_seq_to: Option<i64>,
}

impl CommandResult {
    pub fn accepted(command_id: &str, from: i64, to: i64) -> Self {
        Self {
            command_id: command_id.to_string(),
            status: CommandStatus::Accepted,
            reason: None,
            applied_seq_from: Some(from),
            applied_seq_to: Some(to),
        }
    }

    pub fn rejected(command_id: &str, reason: String) -> Self {
        Self {
            command_id: command_id.to_string(),
            status: CommandStatus::Rejected,
            reason: Some(reason),
            applied_seq_from: None,
            applied_seq_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_type_round_trips() {
        for ty in [
            CommandType::Join,
            CommandType::ClaimSeat,
            CommandType::UseAbility,
            CommandType::SlayerShot,
        ] {
            let parsed: CommandType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
        assert!("teleport".parse::<CommandType>().is_err());
    }

    #[test]
    fn result_serializes_without_empty_fields() {
        let r = CommandResult::rejected("c-1", "wrong phase".to_string());
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("applied_seq_from").is_none());
        assert_eq!(json["status"], "rejected");
    }
}
