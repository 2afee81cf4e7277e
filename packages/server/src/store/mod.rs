//! Durable append-only event log.
//!
//! One transactional primitive, `append_batch`, covers events, the command
//! dedup memo and the optional snapshot so either everything in a command's
//! write set becomes visible or nothing does.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{RoomId, UserId};
use crate::engine::{CommandResult, EventRecord};

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;

/// A serialized state capture at a specific seq. Replaying events with
/// `seq > last_seq` on top of it yields the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub room_id: RoomId,
    pub last_seq: i64,
    pub state_json: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted memo of a command's outcome, keyed by the dedup tuple.
#[derive(Debug, Clone)]
pub struct DedupRecord {
    pub room_id: RoomId,
    pub actor_user_id: UserId,
    pub idempotency_key: String,
    pub command_type: String,
    pub command_id: String,
    pub result: CommandResult,
}

/// One atomic write set. `events` may be empty when only a rejection memo
/// is being recorded.
#[derive(Debug, Clone)]
pub struct AppendBatch {
    pub room_id: RoomId,
    pub events: Vec<EventRecord>,
    pub dedup: Option<DedupRecord>,
    pub snapshot: Option<Snapshot>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retryable infrastructure failure; nothing was written.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// The store and the actor disagree about the sequence counter. This is
    /// unrecoverable for the in-memory actor; it must crash and rehydrate.
    #[error("sequence invariant violated: {0}")]
    SequenceViolation(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::SequenceViolation(_) | StoreError::Corrupt(_))
    }
}

/// Storage behind every room. Implementations must make `append_batch`
/// atomic and keep `(room_id, seq)` unique.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// The snapshot with the largest `last_seq`, if any.
    async fn get_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StoreError>;

    /// Events with `seq > after_seq` in ascending seq, at most `limit`.
    async fn load_events_after(
        &self,
        room_id: &RoomId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// All events with `seq <= to_seq` in ascending seq.
    async fn load_events_up_to(
        &self,
        room_id: &RoomId,
        to_seq: i64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The memoised result for a previously executed command, if any.
    async fn get_dedup(
        &self,
        room_id: &RoomId,
        actor: &UserId,
        idempotency_key: &str,
        command_type: &str,
    ) -> Result<Option<CommandResult>, StoreError>;

    /// Atomically append events, upsert the dedup memo and insert the
    /// snapshot. Verifies the events' pre-assigned seqs continue the
    /// room's counter exactly.
    async fn append_batch(&self, batch: AppendBatch) -> Result<(), StoreError>;
}
