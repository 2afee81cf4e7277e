//! AI side-channel.
//!
//! Observes every applied event, packages the interesting ones as queue
//! tasks (or handles them inline when no queue is configured), asks the
//! LLM producer for intended actions under a hard deadline, and executes
//! them through the schema-validated tool registry. On deadline or
//! producer error a canned fallback line goes out through the same tool
//! path so the game never stalls waiting for the model.

pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::common::{RoomId, UserId};
use crate::engine::event::event_types as et;
use crate::engine::{EventRecord, GameState};
use crate::jobs::{TaskQueue, TaskRegistry};
use crate::tools::{ToolCallContext, ToolRegistry};

pub use llm::{ActionProducer, EventPrompt, OpenAiProducer, PlannedAction};

/// Queue task type for event reactions.
pub const AI_TASK_TYPE: &str = "ai.event";

/// The canned line used when the model is unavailable.
pub const FALLBACK_LINE: &str =
    "The storyteller pauses, shuffles their notes, and the tale moves on.";

/// AI-authored events of these types must not loop back into the AI.
const ECHOABLE: &[&str] = &[et::PUBLIC_CHAT, et::WHISPER_SENT];

/// Event types the storyteller reacts to at all.
const REACTIVE: &[&str] = &[
    et::GAME_STARTED,
    et::PHASE_CHANGED,
    et::PUBLIC_CHAT,
    et::NOMINATION_CREATED,
    et::NOMINATION_RESOLVED,
    et::EXECUTION_RESOLVED,
    et::PLAYER_DIED,
    et::SLAYER_SHOT,
    et::GAME_ENDED,
];

/// Queue payload: the event and the minimum state the producer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTaskArgs {
    pub event: EventRecord,
    pub state: StateView,
}

/// Public knowledge only; hidden roles never leave the room runtime even
/// toward the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateView {
    pub room_id: String,
    pub phase: String,
    pub sub_phase: String,
    pub day_number: u32,
    pub night_number: u32,
    pub alive: Vec<String>,
    pub dead: Vec<String>,
}

impl StateView {
    pub fn from_state(state: &GameState) -> Self {
        let (alive, dead): (Vec<_>, Vec<_>) = state
            .seated_players()
            .map(|p| (p.user_id.to_string(), p.alive))
            .partition(|(_, alive)| *alive);
        Self {
            room_id: state.room_id.to_string(),
            phase: state.phase.to_string(),
            sub_phase: state.sub_phase.to_string(),
            day_number: state.day_number,
            night_number: state.night_number,
            alive: alive.into_iter().map(|(id, _)| id).collect(),
            dead: dead.into_iter().map(|(id, _)| id).collect(),
        }
    }
}

pub struct AiObserver {
    tools: Arc<ToolRegistry>,
    producer: Arc<dyn ActionProducer>,
    queue: Option<Arc<dyn TaskQueue>>,
    deadline: Duration,
}

impl AiObserver {
    pub fn new(
        tools: Arc<ToolRegistry>,
        producer: Arc<dyn ActionProducer>,
        queue: Option<Arc<dyn TaskQueue>>,
        deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tools,
            producer,
            queue,
            deadline,
        })
    }

    /// Wire the queue consumer. Must run before the worker starts so no
    /// task can arrive for an unknown handler.
    pub fn register_handler(self: &Arc<Self>, registry: &mut TaskRegistry) {
        let observer = self.clone();
        registry.register(AI_TASK_TYPE, move |args| {
            let observer = observer.clone();
            async move { observer.handle_task(args).await }
        });
    }

    /// Entry point from the room actor, fire-and-forget per batch.
    pub async fn on_events(&self, events: &[EventRecord], post_state: &GameState) {
        for event in events {
            self.on_event(event, post_state).await;
        }
    }

    pub async fn on_event(&self, event: &EventRecord, post_state: &GameState) {
        if !REACTIVE.contains(&event.event_type.as_str()) {
            return;
        }
        // Self-loop guard: the storyteller does not react to its own voice.
        if event.actor_user_id.is_ai() && ECHOABLE.contains(&event.event_type.as_str()) {
            return;
        }

        let args = AiTaskArgs {
            event: event.clone(),
            state: StateView::from_state(post_state),
        };
        let args = match serde_json::to_value(&args) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to package ai task");
                return;
            }
        };

        if let Some(queue) = &self.queue {
            match queue.publish(AI_TASK_TYPE, args.clone()).await {
                Ok(task_id) => {
                    debug!(task_id = %task_id, event_type = %event.event_type, "ai task queued");
                    return;
                }
                Err(e) => {
                    // Queue down: degrade to synchronous handling.
                    warn!(error = %e, "ai queue unavailable, handling inline");
                }
            }
        }
        if let Err(e) = self.handle_task(args).await {
            warn!(error = %e, "inline ai handling failed");
        }
    }

    /// Queue consumer body. Errors bubble to the worker for retry.
    pub async fn handle_task(&self, args: Value) -> anyhow::Result<()> {
        let task: AiTaskArgs = serde_json::from_value(args)?;
        let room_id = task.event.room_id.clone();

        let prompt = EventPrompt {
            room_id: room_id.to_string(),
            event_type: task.event.event_type.clone(),
            event_payload: serde_json::to_value(&task.event.payload)?,
            state: serde_json::to_value(&task.state)?,
        };

        let planned = tokio::time::timeout(self.deadline, self.producer.plan(&prompt)).await;
        match planned {
            Ok(Ok(actions)) => {
                for action in actions {
                    let ctx = ToolCallContext {
                        room_id: room_id.clone(),
                        actor: UserId::ai(),
                    };
                    if let Err(e) = self.tools.invoke(&action.tool, ctx, action.args).await {
                        warn!(tool = %action.tool, error = %e, "ai action failed");
                    }
                }
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "llm producer failed, emitting fallback");
                self.fallback(&room_id).await
            }
            Err(_) => {
                warn!(deadline_ms = self.deadline.as_millis() as u64, "llm deadline exceeded, emitting fallback");
                self.fallback(&room_id).await
            }
        }
    }

    /// The canned utterance goes through the same tool path as any other
    /// action, so it is audited and rule-checked like the rest.
    async fn fallback(&self, room_id: &RoomId) -> anyhow::Result<()> {
        let ctx = ToolCallContext {
            room_id: room_id.clone(),
            actor: UserId::ai(),
        };
        self.tools
            .invoke(
                "send_public_message",
                ctx,
                serde_json::json!({ "message": FALLBACK_LINE }),
            )
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::event::payload;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedProducer {
        actions: Vec<PlannedAction>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionProducer for ScriptedProducer {
        async fn plan(&self, _prompt: &EventPrompt) -> anyhow::Result<Vec<PlannedAction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.actions.clone())
        }
    }

    struct HangingProducer;

    #[async_trait]
    impl ActionProducer for HangingProducer {
        async fn plan(&self, _prompt: &EventPrompt) -> anyhow::Result<Vec<PlannedAction>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn tool_registry_counting(messages: Arc<Mutex<Vec<String>>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(
            "send_public_message",
            "chat",
            crate::tools::ParamSchema::object(
                vec![("message", crate::tools::ParamSchema::string())],
                vec!["message"],
            ),
            move |_ctx, args| {
                let messages = messages.clone();
                async move {
                    messages
                        .lock()
                        .unwrap()
                        .push(args["message"].as_str().unwrap_or("").to_string());
                    Ok(serde_json::json!({}))
                }
            },
        );
        Arc::new(registry)
    }

    fn phase_event(actor: UserId) -> EventRecord {
        let mut event = EventRecord::draft(
            et::PHASE_CHANGED,
            actor,
            "c-1",
            payload([("from", "first_night".to_string()), ("to", "day".to_string())]),
        );
        event.room_id = crate::common::RoomId::from("r");
        event.seq = 10;
        event
    }

    fn chat_event(actor: UserId) -> EventRecord {
        let mut event = EventRecord::draft(
            et::PUBLIC_CHAT,
            actor.clone(),
            "c-2",
            payload([
                ("user_id", actor.to_string()),
                ("message", "hello".to_string()),
            ]),
        );
        event.room_id = crate::common::RoomId::from("r");
        event.seq = 11;
        event
    }

    fn state() -> GameState {
        GameState::new(crate::common::RoomId::from("r"))
    }

    #[tokio::test]
    async fn planned_actions_run_through_tools() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(ScriptedProducer {
            actions: vec![PlannedAction {
                tool: "send_public_message".to_string(),
                args: serde_json::json!({"message": "dawn breaks"}),
            }],
            calls: AtomicU32::new(0),
        });
        let observer = AiObserver::new(
            tool_registry_counting(messages.clone()),
            producer,
            None,
            Duration::from_secs(1),
        );

        observer.on_event(&phase_event(UserId::from("dm")), &state()).await;
        assert_eq!(messages.lock().unwrap().as_slice(), ["dawn breaks"]);
    }

    #[tokio::test]
    async fn deadline_produces_fallback() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let observer = AiObserver::new(
            tool_registry_counting(messages.clone()),
            Arc::new(HangingProducer),
            None,
            Duration::from_millis(20),
        );

        observer.on_event(&phase_event(UserId::from("dm")), &state()).await;
        assert_eq!(messages.lock().unwrap().as_slice(), [FALLBACK_LINE]);
    }

    #[tokio::test]
    async fn own_chat_does_not_loop() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(ScriptedProducer {
            actions: Vec::new(),
            calls: AtomicU32::new(0),
        });
        let observer = AiObserver::new(
            tool_registry_counting(messages.clone()),
            producer.clone(),
            None,
            Duration::from_secs(1),
        );

        // A player's chat is reactive; the AI's own chat is not.
        observer.on_event(&chat_event(UserId::from("alice")), &state()).await;
        observer.on_event(&chat_event(UserId::ai()), &state()).await;
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_gets_the_task_when_configured() {
        let queue = Arc::new(crate::jobs::InMemoryTaskQueue::new());
        let messages = Arc::new(Mutex::new(Vec::new()));
        let producer = Arc::new(ScriptedProducer {
            actions: Vec::new(),
            calls: AtomicU32::new(0),
        });
        let observer = AiObserver::new(
            tool_registry_counting(messages),
            producer.clone(),
            Some(queue.clone()),
            Duration::from_secs(1),
        );

        observer.on_event(&phase_event(UserId::from("dm")), &state()).await;
        // Queued, not handled inline.
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(producer.calls.load(Ordering::SeqCst), 0);
    }
}
