//! LLM action producer.
//!
//! The side-channel asks an external model for a list of intended actions;
//! each action names a registered tool and its arguments. The trait keeps
//! the room runtime testable with scripted producers; the one real
//! implementation speaks the OpenAI-compatible chat-completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What the producer sees: the triggering event plus a minimal state view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPrompt {
    pub room_id: String,
    pub event_type: String,
    pub event_payload: Value,
    pub state: Value,
}

/// One intended action: a tool name and its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[async_trait]
pub trait ActionProducer: Send + Sync {
    async fn plan(&self, prompt: &EventPrompt) -> anyhow::Result<Vec<PlannedAction>>;
}

// =============================================================================
// OpenAI-compatible chat producer
// =============================================================================

const SYSTEM_PROMPT: &str = "You are the storyteller of a social-deduction game. \
React to the game event with zero or more actions. Respond with a JSON array; \
each element is {\"tool\": name, \"args\": {...}}. Available tools: \
send_public_message {message}, send_private_message {to_user_id, message}, \
request_player_confirmation {to_user_id, question}, toggle_voting {}, \
advance_phase {phase}, write_event {event_type, data}. \
Respond with [] when no action is needed.";

pub struct OpenAiProducer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProducer {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl ActionProducer for OpenAiProducer {
    async fn plan(&self, prompt: &EventPrompt) -> anyhow::Result<Vec<PlannedAction>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": serde_json::to_string(prompt)?},
            ],
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .unwrap_or("[]");
        parse_actions(content)
    }
}

/// Models wrap JSON in prose or code fences often enough that we cut the
/// array out of the surrounding text before parsing.
pub fn parse_actions(content: &str) -> anyhow::Result<Vec<PlannedAction>> {
    let start = content.find('[');
    let end = content.rfind(']');
    let (Some(start), Some(end)) = (start, end) else {
        anyhow::bail!("no JSON array in model output");
    };
    if end < start {
        anyhow::bail!("malformed model output");
    }
    let actions: Vec<PlannedAction> = serde_json::from_str(&content[start..=end])?;
    Ok(actions)
}
