//! Lazy room registry with crash-rebuild.
//!
//! `get_or_create` hydrates a room from the latest snapshot plus tail
//! events on first access. The map lock gives construct-once discipline:
//! concurrent callers get the same actor. Actors hold an `on_crash`
//! callback instead of a manager back-pointer; the manager keeps the only
//! strong reference.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ai::AiObserver;
use crate::common::{CoreError, RoomId};
use crate::engine::{reduce, CommandEnvelope, CommandResult, GameState, Ruleset};
use crate::store::EventStore;

use super::actor::{RoomActor, RoomHandle};
use super::CommandGateway;

/// Page size for hydration reads.
const HYDRATE_BATCH: i64 = 500;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub snapshot_interval: i64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 50,
        }
    }
}

pub struct RoomManager {
    store: Arc<dyn EventStore>,
    ruleset: Arc<Ruleset>,
    config: RoomConfig,
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
    /// Wired after construction; AI tools reach back through
    /// [`CommandGateway`], so this is the one deliberately late binding.
    /// Shared with every actor, which reads it at notify time.
    ai: Arc<OnceLock<Arc<AiObserver>>>,
    /// Handed to actors as part of their crash callback.
    weak_self: Weak<RoomManager>,
}

impl RoomManager {
    pub fn new(store: Arc<dyn EventStore>, ruleset: Ruleset, config: RoomConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            ruleset: Arc::new(ruleset),
            config,
            rooms: Mutex::new(HashMap::new()),
            ai: Arc::new(OnceLock::new()),
            weak_self: weak.clone(),
        })
    }

    /// Attach the AI side-channel. Rooms created before this see no AI.
    pub fn set_ai_observer(&self, observer: Arc<AiObserver>) {
        let _ = self.ai.set(observer);
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Return the live actor for a room, hydrating it on first access.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<RoomHandle, CoreError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
            // A crashed actor's entry may still be here if the crash
            // callback has not run yet.
            rooms.remove(room_id);
        }

        let (state, next_seq) = self.hydrate(room_id).await?;
        let (actor, handle, rx) = RoomActor::new(
            room_id.clone(),
            self.store.clone(),
            self.ruleset.clone(),
            state,
            next_seq,
            self.config.snapshot_interval,
            self.ai.clone(),
        );

        let manager = self.weak_self.clone();
        let on_crash = Box::new(move |room_id: RoomId| {
            let Some(manager) = Weak::upgrade(&manager) else {
                return;
            };
            tokio::spawn(async move {
                manager.evict_crashed(&room_id).await;
            });
        });
        tokio::spawn(actor.run(rx, on_crash));

        rooms.insert(room_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Snapshot plus tail replay. A room with no history starts fresh; its
    /// first event will be seq 1.
    async fn hydrate(&self, room_id: &RoomId) -> Result<(GameState, i64), CoreError> {
        let snapshot = self
            .store
            .get_snapshot(room_id)
            .await
            .map_err(|e| CoreError::Transient(anyhow::anyhow!(e)))?;

        let mut state = match snapshot {
            Some(snapshot) => serde_json::from_str::<GameState>(&snapshot.state_json)
                .map_err(|e| CoreError::Fatal(format!("snapshot corrupt: {}", e)))?,
            None => GameState::new(room_id.clone()),
        };

        loop {
            let events = self
                .store
                .load_events_after(room_id, state.last_seq, HYDRATE_BATCH)
                .await
                .map_err(|e| CoreError::Transient(anyhow::anyhow!(e)))?;
            if events.is_empty() {
                break;
            }
            for event in &events {
                state = reduce(&state, event);
            }
        }

        let next_seq = state.last_seq + 1;
        info!(room_id = %room_id, last_seq = state.last_seq, "room hydrated");
        Ok((state, next_seq))
    }

    async fn evict_crashed(&self, room_id: &RoomId) {
        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            if handle.is_closed() {
                rooms.remove(room_id);
                warn!(room_id = %room_id, "crashed room evicted; next access rehydrates");
            }
        }
    }

    /// Drop every actor. In-flight dispatches resolve as unavailable;
    /// clients reconnect and resume by seq.
    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.lock().await;
        let count = rooms.len();
        rooms.clear();
        info!(rooms = count, "room manager shut down");
    }

    pub async fn active_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[async_trait]
impl CommandGateway for RoomManager {
    async fn submit(&self, envelope: CommandEnvelope) -> Result<CommandResult, CoreError> {
        let handle = self.get_or_create(&envelope.room_id).await?;
        handle.dispatch(envelope).await
    }
}
