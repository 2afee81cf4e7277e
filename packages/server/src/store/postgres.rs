//! PostgreSQL-backed event store.
//!
//! `append_batch` runs as one transaction: it takes the `room_sequences`
//! row lock, verifies the batch continues the counter exactly, inserts
//! events, bumps the counter, upserts the dedup memo and inserts the
//! snapshot. Any failure rolls the whole write set back.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::common::{RoomId, UserId};
use crate::engine::{CommandResult, EventRecord};

use super::{AppendBatch, EventStore, Snapshot, StoreError};

pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    room_id: String,
    seq: i64,
    event_id: String,
    event_type: String,
    actor_user_id: String,
    causation_command_id: String,
    payload_json: serde_json::Value,
    server_ts: i64,
}

impl EventRow {
    fn into_record(self) -> Result<EventRecord, StoreError> {
        let payload: BTreeMap<String, String> = serde_json::from_value(self.payload_json)
            .map_err(|e| StoreError::Corrupt(format!("event {} payload: {}", self.event_id, e)))?;
        Ok(EventRecord {
            room_id: RoomId::from(self.room_id),
            seq: self.seq,
            event_id: self.event_id,
            event_type: self.event_type,
            actor_user_id: UserId::from(self.actor_user_id),
            causation_command_id: self.causation_command_id,
            payload,
            server_ts: self.server_ts,
        })
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(anyhow!(e))
}

/// Unique-key violation on `events (room_id, seq)` means two writers raced
/// a seq. That must be impossible under the single-writer actor.
fn classify_event_insert(e: sqlx::Error, room_id: &RoomId, seq: i64) -> StoreError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::SequenceViolation(format!(
                "duplicate (room {}, seq {})",
                room_id, seq
            ));
        }
    }
    unavailable(e)
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn get_snapshot(&self, room_id: &RoomId) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT room_id, last_seq, state_json, created_at
            FROM snapshots
            WHERE room_id = $1
            ORDER BY last_seq DESC
            LIMIT 1
            "#,
        )
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(|row| Snapshot {
            room_id: RoomId::from(row.get::<String, _>("room_id")),
            last_seq: row.get("last_seq"),
            state_json: row.get("state_json"),
            created_at: row.get("created_at"),
        }))
    }

    async fn load_events_after(
        &self,
        room_id: &RoomId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT room_id, seq, event_id, event_type, actor_user_id,
                   causation_command_id, payload_json, server_ts
            FROM events
            WHERE room_id = $1 AND seq > $2
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(room_id.as_str())
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn load_events_up_to(
        &self,
        room_id: &RoomId,
        to_seq: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT room_id, seq, event_id, event_type, actor_user_id,
                   causation_command_id, payload_json, server_ts
            FROM events
            WHERE room_id = $1 AND seq <= $2
            ORDER BY seq ASC
            "#,
        )
        .bind(room_id.as_str())
        .bind(to_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(EventRow::into_record).collect()
    }

    async fn get_dedup(
        &self,
        room_id: &RoomId,
        actor: &UserId,
        idempotency_key: &str,
        command_type: &str,
    ) -> Result<Option<CommandResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT result_json
            FROM commands_dedup
            WHERE room_id = $1 AND actor_user_id = $2
              AND idempotency_key = $3 AND command_type = $4
            "#,
        )
        .bind(room_id.as_str())
        .bind(actor.as_str())
        .bind(idempotency_key)
        .bind(command_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|row| {
            let value: serde_json::Value = row.get("result_json");
            serde_json::from_value(value)
                .map_err(|e| StoreError::Corrupt(format!("dedup result: {}", e)))
        })
        .transpose()
    }

    async fn append_batch(&self, batch: AppendBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        if !batch.events.is_empty() {
            // Take the per-room counter lock; create the row lazily.
            let next_seq: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO room_sequences (room_id, next_seq)
                VALUES ($1, 1)
                ON CONFLICT (room_id)
                    DO UPDATE SET next_seq = room_sequences.next_seq
                RETURNING next_seq
                "#,
            )
            .bind(batch.room_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;

            for (offset, event) in batch.events.iter().enumerate() {
                let expected = next_seq + offset as i64;
                if event.seq != expected {
                    return Err(StoreError::SequenceViolation(format!(
                        "room {} expected seq {}, got {}",
                        batch.room_id, expected, event.seq
                    )));
                }
            }

            for event in &batch.events {
                let payload_json = serde_json::to_value(&event.payload)
                    .map_err(|e| StoreError::Corrupt(format!("payload: {}", e)))?;
                sqlx::query(
                    r#"
                    INSERT INTO events (room_id, seq, event_id, event_type, actor_user_id,
                                        causation_command_id, payload_json, server_ts)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(event.room_id.as_str())
                .bind(event.seq)
                .bind(&event.event_id)
                .bind(&event.event_type)
                .bind(event.actor_user_id.as_str())
                .bind(&event.causation_command_id)
                .bind(payload_json)
                .bind(event.server_ts)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_event_insert(e, &batch.room_id, event.seq))?;
            }

            sqlx::query("UPDATE room_sequences SET next_seq = $1 WHERE room_id = $2")
                .bind(next_seq + batch.events.len() as i64)
                .bind(batch.room_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        if let Some(dedup) = &batch.dedup {
            let result_json = serde_json::to_value(&dedup.result)
                .map_err(|e| StoreError::Corrupt(format!("result: {}", e)))?;
            // First memo wins: a replayed command must see the original
            // result, never a rewritten one.
            sqlx::query(
                r#"
                INSERT INTO commands_dedup
                    (room_id, actor_user_id, idempotency_key, command_type,
                     command_id, status, result_json, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                ON CONFLICT (room_id, actor_user_id, idempotency_key, command_type)
                    DO NOTHING
                "#,
            )
            .bind(dedup.room_id.as_str())
            .bind(dedup.actor_user_id.as_str())
            .bind(&dedup.idempotency_key)
            .bind(&dedup.command_type)
            .bind(&dedup.command_id)
            .bind(match dedup.result.status {
                crate::engine::CommandStatus::Accepted => "accepted",
                crate::engine::CommandStatus::Rejected => "rejected",
                crate::engine::CommandStatus::Duplicate => "duplicate",
            })
            .bind(result_json)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }

        if let Some(snapshot) = &batch.snapshot {
            sqlx::query(
                r#"
                INSERT INTO snapshots (room_id, last_seq, state_json, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (room_id, last_seq) DO NOTHING
                "#,
            )
            .bind(snapshot.room_id.as_str())
            .bind(snapshot.last_seq)
            .bind(&snapshot.state_json)
            .bind(snapshot.created_at)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }
}
