//! Task queue implementations.
//!
//! The Postgres queue claims with `FOR UPDATE SKIP LOCKED` so a pool of
//! consumers never double-claims, retries with exponential backoff, and
//! dead-letters after `max_retries`. The in-memory queue backs tests and
//! exercises the same retry/dead-letter semantics.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::task::Task;

pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue for execution. Returns the task id.
    async fn publish(&self, task_type: &str, args: Value) -> Result<Uuid>;

    /// Claim up to `limit` ready tasks for this worker.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<Task>>;

    async fn mark_succeeded(&self, task_id: Uuid) -> Result<()>;

    /// Re-queue with backoff while retries remain, then dead-letter.
    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<()>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PostgresTaskQueue {
    pool: PgPool,
}

impl PostgresTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PostgresTaskQueue {
    async fn publish(&self, task_type: &str, args: Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ai_tasks (id, task_type, args, status, max_retries)
            VALUES ($1, $2, $3, 'pending', $4)
            "#,
        )
        .bind(id)
        .bind(task_type)
        .bind(args)
        .bind(DEFAULT_MAX_RETRIES)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<(Uuid, String, Value, i32, i32)> = sqlx::query_as(
            r#"
            UPDATE ai_tasks
            SET status = 'running',
                worker_id = $1,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM ai_tasks
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_type, args, retry_count, max_retries
            "#,
        )
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, task_type, args, retry_count, max_retries)| Task {
                id,
                task_type,
                args,
                retry_count,
                max_retries,
            })
            .collect())
    }

    async fn mark_succeeded(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ai_tasks
            SET status = 'succeeded', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        let row: Option<(i32, i32)> =
            sqlx::query_as("SELECT retry_count, max_retries FROM ai_tasks WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((retry_count, max_retries)) = row else {
            return Ok(());
        };

        if retry_count < max_retries {
            let delay_secs = 2i64.pow(retry_count as u32).min(300);
            let retry_at = Utc::now() + Duration::seconds(delay_secs);
            sqlx::query(
                r#"
                UPDATE ai_tasks
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    run_at = $1,
                    error_message = $2,
                    worker_id = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE ai_tasks
                SET status = 'dead_letter',
                    error_message = $1,
                    dead_lettered_at = NOW(),
                    dead_letter_reason = 'max retries exceeded',
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
            info!(task_id = %task_id, "task dead-lettered");
        }
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<Task>,
    running: Vec<Task>,
    succeeded: Vec<Uuid>,
    dead_letter: Vec<(Task, String)>,
}

/// Test/standalone queue with the same retry semantics as Postgres.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<MemoryState>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("queue lock").pending.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().expect("queue lock").dead_letter.len()
    }

    pub fn succeeded_count(&self) -> usize {
        self.state.lock().expect("queue lock").succeeded.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish(&self, task_type: &str, args: Value) -> Result<Uuid> {
        let task = Task::new(task_type, args, DEFAULT_MAX_RETRIES);
        let id = task.id;
        self.state.lock().expect("queue lock").pending.push_back(task);
        Ok(id)
    }

    async fn claim(&self, _worker_id: &str, limit: i64) -> Result<Vec<Task>> {
        let mut state = self.state.lock().expect("queue lock");
        let mut claimed = Vec::new();
        while claimed.len() < limit.max(0) as usize {
            let Some(task) = state.pending.pop_front() else {
                break;
            };
            state.running.push(task.clone());
            claimed.push(task);
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, task_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().expect("queue lock");
        state.running.retain(|t| t.id != task_id);
        state.succeeded.push(task_id);
        Ok(())
    }

    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().expect("queue lock");
        let Some(position) = state.running.iter().position(|t| t.id == task_id) else {
            return Ok(());
        };
        let mut task = state.running.remove(position);
        if task.retries_remaining() {
            task.retry_count += 1;
            state.pending.push_back(task);
        } else {
            state.dead_letter.push((task, error.to_string()));
        }
        Ok(())
    }
}
