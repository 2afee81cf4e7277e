//! In-memory store.
//!
//! Implements the full `EventStore` contract including the sequence checks,
//! so the actor and test suites exercise the same code paths as production.
//! Backs the integration harness; never used behind a real server.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::common::{RoomId, UserId};
use crate::engine::{CommandResult, EventRecord};

use super::{AppendBatch, DedupRecord, EventStore, Snapshot, StoreError};

#[derive(Default)]
struct RoomLog {
    next_seq: i64,
    events: Vec<EventRecord>,
    snapshots: Vec<Snapshot>,
    dedup: HashMap<(UserId, String, String), DedupRecord>,
}

impl RoomLog {
    fn new() -> Self {
        Self {
            next_seq: 1,
            ..Default::default()
        }
    }
}

/// Process-local event log keyed by room.
#[derive(Default)]
pub struct InMemoryEventStore {
    rooms: Mutex<HashMap<RoomId, RoomLog>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total event count for a room, test helper.
    pub fn event_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .lock()
            .expect("store lock")
            .get(room_id)
            .map(|log| log.events.len())
            .unwrap_or(0)
    }

    /// Events of a given type for a room, test helper.
    pub fn events_of_type(&self, room_id: &RoomId, event_type: &str) -> Vec<EventRecord> {
        self.rooms
            .lock()
            .expect("store lock")
            .get(room_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StoreError> {
        let rooms = self.rooms.lock().expect("store lock");
        Ok(rooms
            .get(room_id)
            .and_then(|log| log.snapshots.iter().max_by_key(|s| s.last_seq))
            .cloned())
    }

    async fn load_events_after(
        &self,
        room_id: &RoomId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rooms = self.rooms.lock().expect("store lock");
        Ok(rooms
            .get(room_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_events_up_to(
        &self,
        room_id: &RoomId,
        to_seq: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rooms = self.rooms.lock().expect("store lock");
        Ok(rooms
            .get(room_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.seq <= to_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_dedup(
        &self,
        room_id: &RoomId,
        actor: &UserId,
        idempotency_key: &str,
        command_type: &str,
    ) -> Result<Option<CommandResult>, StoreError> {
        let rooms = self.rooms.lock().expect("store lock");
        Ok(rooms.get(room_id).and_then(|log| {
            log.dedup
                .get(&(
                    actor.clone(),
                    idempotency_key.to_string(),
                    command_type.to_string(),
                ))
                .map(|record| record.result.clone())
        }))
    }

    async fn append_batch(&self, batch: AppendBatch) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().expect("store lock");
        let log = rooms.entry(batch.room_id.clone()).or_insert_with(RoomLog::new);

        // Verify first, mutate after: the whole batch is atomic.
        if let Some(first) = batch.events.first() {
            if first.seq != log.next_seq {
                return Err(StoreError::SequenceViolation(format!(
                    "room {} expected seq {}, got {}",
                    batch.room_id, log.next_seq, first.seq
                )));
            }
            for (offset, event) in batch.events.iter().enumerate() {
                let expected = log.next_seq + offset as i64;
                if event.seq != expected {
                    return Err(StoreError::SequenceViolation(format!(
                        "room {} expected seq {}, got {}",
                        batch.room_id, expected, event.seq
                    )));
                }
            }
        }

        log.next_seq += batch.events.len() as i64;
        log.events.extend(batch.events);
        if let Some(dedup) = batch.dedup {
            log.dedup.insert(
                (
                    dedup.actor_user_id.clone(),
                    dedup.idempotency_key.clone(),
                    dedup.command_type.clone(),
                ),
                dedup,
            );
        }
        if let Some(snapshot) = batch.snapshot {
            log.snapshots.push(snapshot);
        }
        Ok(())
    }
}
