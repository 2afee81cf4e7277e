//! The single-writer room actor.
//!
//! One task per room owns the in-memory state and serialises every command:
//! dedup lookup, pure engine call, provisional-seq reduce on a working copy,
//! durable append, in-memory commit, subscriber fan-out, AI notify, respond.
//! The write lock is held only around the final swap so concurrent readers
//! (backfill projection, REST state reads) stay cheap.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{error, info, warn};

use crate::ai::AiObserver;
use crate::common::{CoreError, RoomId};
use crate::engine::{
    handle_command, reduce, CommandEnvelope, CommandResult, EngineContext, EventRecord, GameState,
    Ruleset,
};
use crate::projection::Viewer;
use crate::store::{AppendBatch, DedupRecord, EventStore, Snapshot, StoreError};

use super::subscriber::{SubscriberSet, Subscription};

/// Commands queue here; capacity bounds give observable back-pressure.
pub const INBOX_CAPACITY: usize = 128;

/// Per-subscriber delivery buffer before events get dropped.
pub const SUBSCRIBER_BUFFER: usize = 256;

pub(crate) struct ActorMessage {
    envelope: CommandEnvelope,
    respond: oneshot::Sender<Result<CommandResult, CoreError>>,
}

/// Cloneable reference to a live room actor.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: RoomId,
    tx: mpsc::Sender<ActorMessage>,
    state: Arc<RwLock<GameState>>,
    subscribers: Arc<SubscriberSet>,
}

impl RoomHandle {
    /// Submit one command and wait for its result. Cancellation-safe: if
    /// the caller gives up, the command may still apply and the dedup memo
    /// makes a retry return the same result.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> Result<CommandResult, CoreError> {
        if envelope.room_id != self.room_id {
            return Err(CoreError::Validation(format!(
                "command for room {} sent to room {}",
                envelope.room_id, self.room_id
            )));
        }
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(ActorMessage { envelope, respond })
            .await
            .map_err(|_| CoreError::Unavailable("room actor stopped".to_string()))?;
        rx.await
            .map_err(|_| CoreError::Unavailable("room actor dropped the command".to_string()))?
    }

    /// Cheap read-only copy of the current state.
    pub async fn state(&self) -> GameState {
        self.state.read().await.clone()
    }

    pub fn subscribe(&self, viewer: Viewer) -> Subscription {
        self.subscribers.add(viewer, SUBSCRIBER_BUFFER)
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.subscribers.remove(subscription_id);
    }

    /// True once the actor task has exited (crash or shutdown).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) type OnCrash = Box<dyn Fn(RoomId) + Send + Sync>;

pub(crate) struct RoomActor {
    room_id: RoomId,
    store: Arc<dyn EventStore>,
    ruleset: Arc<Ruleset>,
    state: Arc<RwLock<GameState>>,
    subscribers: Arc<SubscriberSet>,
    /// Shared with the manager; read at notify time so the side-channel
    /// can be wired after rooms already exist.
    ai: Arc<OnceLock<Arc<AiObserver>>>,
    next_seq: i64,
    snapshot_interval: i64,
}

impl RoomActor {
    /// Construct the actor and its handle; the caller spawns `run`.
    pub(crate) fn new(
        room_id: RoomId,
        store: Arc<dyn EventStore>,
        ruleset: Arc<Ruleset>,
        state: GameState,
        next_seq: i64,
        snapshot_interval: i64,
        ai: Arc<OnceLock<Arc<AiObserver>>>,
    ) -> (Self, RoomHandle, mpsc::Receiver<ActorMessage>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let state = Arc::new(RwLock::new(state));
        let subscribers = Arc::new(SubscriberSet::new());
        let handle = RoomHandle {
            room_id: room_id.clone(),
            tx,
            state: state.clone(),
            subscribers: subscribers.clone(),
        };
        let actor = Self {
            room_id,
            store,
            ruleset,
            state,
            subscribers,
            ai,
            next_seq,
            snapshot_interval,
        };
        (actor, handle, rx)
    }

    /// The serial command loop. Exits on channel close (manager shutdown)
    /// or on a fatal invariant violation, in which case `on_crash` fires
    /// and the manager rebuilds the room from the durable log.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<ActorMessage>, on_crash: OnCrash) {
        info!(room_id = %self.room_id, next_seq = self.next_seq, "room actor started");
        while let Some(message) = rx.recv().await {
            let command_id = message.envelope.command_id.clone();
            match self.process(message.envelope).await {
                Ok(result) => {
                    let _ = message.respond.send(Ok(result));
                }
                Err(ProcessError::Reply(err)) => {
                    let _ = message.respond.send(Err(err));
                }
                Err(ProcessError::Fatal(reason)) => {
                    error!(
                        room_id = %self.room_id,
                        command_id = %command_id,
                        reason = %reason,
                        "room actor crashing"
                    );
                    let _ = message.respond.send(Err(CoreError::Fatal(reason)));
                    drop(rx);
                    on_crash(self.room_id.clone());
                    return;
                }
            }
        }
        info!(room_id = %self.room_id, "room actor stopped");
    }

    async fn process(&mut self, envelope: CommandEnvelope) -> Result<CommandResult, ProcessError> {
        // Exactly-once: a replayed command returns the memoised result
        // verbatim, including the original applied seq range.
        let existing = self
            .store
            .get_dedup(
                &self.room_id,
                &envelope.actor_user_id,
                &envelope.idempotency_key,
                envelope.command_type.as_str(),
            )
            .await
            .map_err(store_error)?;
        if let Some(result) = existing {
            return Ok(result);
        }

        let current = self.state.read().await.clone();
        let ctx = EngineContext {
            rng_seed: seed_from(&envelope.command_id),
            ruleset: &self.ruleset,
        };

        // The engine and reducer are pure; a panic in either is contained
        // to this command and reported as a rejection.
        let handled = catch_unwind(AssertUnwindSafe(|| handle_command(&current, &envelope, &ctx)));
        let events = match handled {
            Ok(Ok(events)) => events,
            Ok(Err(engine_err)) => {
                let result =
                    CommandResult::rejected(&envelope.command_id, engine_err.to_string());
                self.record_rejection(&envelope, &result).await?;
                return Ok(result);
            }
            Err(_) => {
                warn!(room_id = %self.room_id, command_id = %envelope.command_id, "engine panicked");
                let result = CommandResult::rejected(
                    &envelope.command_id,
                    "internal rule error".to_string(),
                );
                self.record_rejection(&envelope, &result).await?;
                return Ok(result);
            }
        };

        // Assign authoritative seqs before reducing; the store verifies the
        // same numbers under its row lock.
        let base = self.next_seq;
        let now_ms = Utc::now().timestamp_millis();
        let mut sealed: Vec<EventRecord> = Vec::with_capacity(events.len());
        for (offset, mut event) in events.into_iter().enumerate() {
            event.room_id = self.room_id.clone();
            event.seq = base + offset as i64;
            event.server_ts = now_ms;
            sealed.push(event);
        }

        let reduced = catch_unwind(AssertUnwindSafe(|| {
            let mut working = current.clone();
            for event in &sealed {
                working = reduce(&working, event);
            }
            working
        }));
        let working = match reduced {
            Ok(state) => state,
            Err(_) => {
                warn!(room_id = %self.room_id, command_id = %envelope.command_id, "reducer panicked");
                let result = CommandResult::rejected(
                    &envelope.command_id,
                    "internal rule error".to_string(),
                );
                self.record_rejection(&envelope, &result).await?;
                return Ok(result);
            }
        };

        let last = base + sealed.len() as i64 - 1;
        let result = CommandResult::accepted(&envelope.command_id, base, last);

        let snapshot = if crosses_interval(base - 1, last, self.snapshot_interval) {
            match serde_json::to_string(&working) {
                Ok(state_json) => Some(Snapshot {
                    room_id: self.room_id.clone(),
                    last_seq: last,
                    state_json,
                    created_at: Utc::now(),
                }),
                Err(e) => {
                    // Skipping a snapshot only costs reload time.
                    warn!(room_id = %self.room_id, error = %e, "snapshot serialization failed");
                    None
                }
            }
        } else {
            None
        };

        self.store
            .append_batch(AppendBatch {
                room_id: self.room_id.clone(),
                events: sealed.clone(),
                dedup: Some(DedupRecord {
                    room_id: self.room_id.clone(),
                    actor_user_id: envelope.actor_user_id.clone(),
                    idempotency_key: envelope.idempotency_key.clone(),
                    command_type: envelope.command_type.as_str().to_string(),
                    command_id: envelope.command_id.clone(),
                    result: result.clone(),
                }),
                snapshot,
            })
            .await
            .map_err(store_error)?;

        // Durable; commit to memory under the write lock, then fan out.
        {
            let mut guard = self.state.write().await;
            *guard = working.clone();
        }
        self.next_seq = last + 1;

        self.subscribers.broadcast(&sealed, &working);

        if let Some(ai) = self.ai.get() {
            let ai = ai.clone();
            let post_state = working;
            tokio::spawn(async move {
                ai.on_events(&sealed, &post_state).await;
            });
        }

        Ok(result)
    }

    /// Rejections are memoised too so a retry replays the same refusal
    /// without re-running the engine.
    async fn record_rejection(
        &self,
        envelope: &CommandEnvelope,
        result: &CommandResult,
    ) -> Result<(), ProcessError> {
        self.store
            .append_batch(AppendBatch {
                room_id: self.room_id.clone(),
                events: Vec::new(),
                dedup: Some(DedupRecord {
                    room_id: self.room_id.clone(),
                    actor_user_id: envelope.actor_user_id.clone(),
                    idempotency_key: envelope.idempotency_key.clone(),
                    command_type: envelope.command_type.as_str().to_string(),
                    command_id: envelope.command_id.clone(),
                    result: result.clone(),
                }),
                snapshot: None,
            })
            .await
            .map_err(store_error)
    }
}

enum ProcessError {
    /// Returned to the caller; the actor keeps running.
    Reply(CoreError),
    /// The actor must crash and be rebuilt from the log.
    Fatal(String),
}

fn store_error(err: StoreError) -> ProcessError {
    if err.is_fatal() {
        ProcessError::Fatal(err.to_string())
    } else {
        ProcessError::Reply(CoreError::Transient(anyhow::anyhow!(err)))
    }
}

/// Snapshot when the applied range crosses a multiple of the interval.
fn crosses_interval(before: i64, after: i64, interval: i64) -> bool {
    interval > 0 && before / interval != after / interval
}

/// Rule-determined randomness is seeded from the command identity, so a
/// replay of the same command deals the same cards.
fn seed_from(command_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    command_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_crossing() {
        assert!(crosses_interval(49, 50, 50));
        assert!(crosses_interval(48, 52, 50));
        assert!(!crosses_interval(50, 51, 50));
        assert!(!crosses_interval(0, 49, 50));
        assert!(!crosses_interval(3, 4, 0));
    }

    #[test]
    fn seeds_are_stable() {
        assert_eq!(seed_from("c-1"), seed_from("c-1"));
        assert_ne!(seed_from("c-1"), seed_from("c-2"));
    }
}
