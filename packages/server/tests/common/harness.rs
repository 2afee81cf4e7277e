//! Shared test harness: an in-memory room runtime with helpers for
//! seating a table and pushing commands through the full actor pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use grimoire_core::ai::{ActionProducer, EventPrompt, PlannedAction};
use grimoire_core::common::{CoreError, RoomId, UserId};
use grimoire_core::engine::{
    CommandEnvelope, CommandResult, CommandStatus, CommandType, GameState, Ruleset,
};
use grimoire_core::room::{RoomConfig, RoomHandle, RoomManager};
use grimoire_core::store::{EventStore, InMemoryEventStore};

pub struct TestRoom {
    pub store: Arc<InMemoryEventStore>,
    pub manager: Arc<RoomManager>,
    pub room_id: RoomId,
}

impl TestRoom {
    pub async fn new() -> Self {
        Self::with_snapshot_interval(50).await
    }

    pub async fn with_snapshot_interval(interval: i64) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let manager = RoomManager::new(
            store.clone() as Arc<dyn EventStore>,
            Ruleset::trouble_brewing(),
            RoomConfig {
                snapshot_interval: interval,
            },
        );
        Self {
            store,
            manager,
            room_id: RoomId::from("table-1"),
        }
    }

    pub async fn handle(&self) -> RoomHandle {
        self.manager
            .get_or_create(&self.room_id)
            .await
            .expect("room available")
    }

    pub fn envelope(&self, user: &str, command_type: CommandType, payload: Value) -> CommandEnvelope {
        CommandEnvelope::new(
            self.room_id.clone(),
            command_type,
            UserId::from(user),
            payload,
        )
    }

    pub async fn dispatch(
        &self,
        user: &str,
        command_type: CommandType,
        payload: Value,
    ) -> Result<CommandResult, CoreError> {
        let handle = self.handle().await;
        handle
            .dispatch(self.envelope(user, command_type, payload))
            .await
    }

    /// Dispatch and require acceptance.
    pub async fn dispatch_ok(
        &self,
        user: &str,
        command_type: CommandType,
        payload: Value,
    ) -> CommandResult {
        let result = self
            .dispatch(user, command_type, payload)
            .await
            .expect("dispatch succeeds");
        assert_eq!(
            result.status,
            CommandStatus::Accepted,
            "command rejected: {:?}",
            result.reason
        );
        result
    }

    /// Dispatch with an explicit idempotency key.
    pub async fn dispatch_keyed(
        &self,
        user: &str,
        command_type: CommandType,
        payload: Value,
        idempotency_key: &str,
    ) -> Result<CommandResult, CoreError> {
        let mut envelope = self.envelope(user, command_type, payload);
        envelope.idempotency_key = idempotency_key.to_string();
        let handle = self.handle().await;
        handle.dispatch(envelope).await
    }

    pub async fn join(&self, user: &str, storyteller: bool) -> CommandResult {
        self.dispatch_ok(
            user,
            CommandType::Join,
            json!({"display_name": user, "storyteller": storyteller}),
        )
        .await
    }

    pub async fn state(&self) -> GameState {
        self.handle().await.state().await
    }

    /// Storyteller "dm" plus five seated players, game started. Returns
    /// the player ids in seat order.
    pub async fn seat_five_and_start(&self) -> Vec<String> {
        self.join("dm", true).await;
        let players: Vec<String> = (1..=5).map(|i| format!("p{}", i)).collect();
        for (seat, player) in players.iter().enumerate() {
            self.join(player, false).await;
            self.dispatch_ok(player, CommandType::ClaimSeat, json!({ "seat": seat }))
                .await;
        }
        self.dispatch_ok("dm", CommandType::StartGame, json!({})).await;
        players
    }

    /// Seat order ids of players that are not the demon.
    pub async fn non_demons(&self) -> Vec<String> {
        let state = self.state().await;
        state
            .seat_order
            .iter()
            .filter(|id| state.demon_id.as_ref() != Some(*id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Players safe to nominate in tests that want a plain execution: not
    /// the demon (game would end) and not the virgin (the nomination
    /// would backfire on the nominator).
    pub async fn plain_nominees(&self) -> Vec<String> {
        let state = self.state().await;
        state
            .seat_order
            .iter()
            .filter(|id| {
                let player = state.player(id).unwrap();
                state.demon_id.as_ref() != Some(*id)
                    && player.role.as_deref() != Some("virgin")
            })
            .map(|id| id.to_string())
            .collect()
    }
}

/// Producer that never answers within any reasonable deadline.
pub struct HangingProducer;

#[async_trait]
impl ActionProducer for HangingProducer {
    async fn plan(&self, _prompt: &EventPrompt) -> anyhow::Result<Vec<PlannedAction>> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}
