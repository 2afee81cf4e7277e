//! The storyteller's toolbox.
//!
//! Tool names are part of the AI contract. Each handler turns its
//! arguments into one or two commands submitted through the gateway; the
//! engine applies the same legality rules it applies to humans.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};

use crate::engine::{CommandEnvelope, CommandResult, CommandStatus, CommandType};
use crate::room::CommandGateway;

use super::schema::ParamSchema;
use super::{ToolCallContext, ToolRegistry};

const MESSAGE_MAX: usize = 2000;

/// Build the registry with every tool the AI may call.
pub fn builtin_registry(gateway: Arc<dyn CommandGateway>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    {
        let gateway = gateway.clone();
        registry.register(
            "send_public_message",
            "Say something in the room's public chat.",
            ParamSchema::object(
                vec![("message", ParamSchema::string().with_length(1, MESSAGE_MAX))],
                vec!["message"],
            ),
            move |ctx, args| {
                let gateway = gateway.clone();
                async move {
                    let result = submit(
                        &gateway,
                        &ctx,
                        CommandType::PublicChat,
                        json!({"message": args["message"]}),
                    )
                    .await?;
                    Ok(result_value(&result))
                }
            },
        );
    }

    {
        let gateway = gateway.clone();
        registry.register(
            "send_private_message",
            "Whisper to a single player.",
            ParamSchema::object(
                vec![
                    ("to_user_id", ParamSchema::string().with_length(1, 128)),
                    ("message", ParamSchema::string().with_length(1, MESSAGE_MAX)),
                ],
                vec!["to_user_id", "message"],
            ),
            move |ctx, args| {
                let gateway = gateway.clone();
                async move {
                    let result = submit(
                        &gateway,
                        &ctx,
                        CommandType::Whisper,
                        json!({
                            "to_user_id": args["to_user_id"],
                            "message": args["message"],
                        }),
                    )
                    .await?;
                    Ok(result_value(&result))
                }
            },
        );
    }

    {
        let gateway = gateway.clone();
        registry.register(
            "request_player_confirmation",
            "Whisper a question to a player and record that it was asked.",
            ParamSchema::object(
                vec![
                    ("to_user_id", ParamSchema::string().with_length(1, 128)),
                    ("question", ParamSchema::string().with_length(1, MESSAGE_MAX)),
                ],
                vec!["to_user_id", "question"],
            ),
            move |ctx, args| {
                let gateway = gateway.clone();
                async move {
                    let whisper = submit(
                        &gateway,
                        &ctx,
                        CommandType::Whisper,
                        json!({
                            "to_user_id": args["to_user_id"],
                            "message": args["question"],
                        }),
                    )
                    .await?;
                    let audit = submit(
                        &gateway,
                        &ctx,
                        CommandType::WriteEvent,
                        json!({
                            "event_type": "confirmation.requested",
                            "data": {
                                "user_id": args["to_user_id"],
                                "question": args["question"],
                            },
                        }),
                    )
                    .await?;
                    Ok(json!({
                        "whisper": result_value(&whisper),
                        "audit": result_value(&audit),
                    }))
                }
            },
        );
    }

    {
        let gateway = gateway.clone();
        registry.register(
            "toggle_voting",
            "Close the defense and open voting on the current nomination.",
            ParamSchema::object(vec![], vec![]),
            move |ctx, _args| {
                let gateway = gateway.clone();
                async move {
                    let result = submit(&gateway, &ctx, CommandType::EndDefense, json!({})).await?;
                    Ok(result_value(&result))
                }
            },
        );
    }

    {
        let gateway = gateway.clone();
        registry.register(
            "advance_phase",
            "Move the game to the named phase.",
            ParamSchema::object(
                vec![(
                    "phase",
                    ParamSchema::string().with_enum(vec![
                        json!("day"),
                        json!("night"),
                        json!("nomination"),
                    ]),
                )],
                vec!["phase"],
            ),
            move |ctx, args| {
                let gateway = gateway.clone();
                async move {
                    let result = submit(
                        &gateway,
                        &ctx,
                        CommandType::AdvancePhase,
                        json!({"target": args["phase"]}),
                    )
                    .await?;
                    Ok(result_value(&result))
                }
            },
        );
    }

    {
        let gateway = gateway.clone();
        registry.register(
            "write_event",
            "Append an auditable declaration to the room's log.",
            ParamSchema::object(
                vec![
                    (
                        "event_type",
                        ParamSchema::string()
                            .with_length(1, 128)
                            .with_pattern(r"^[a-z_]+(\.[a-z_]+)*$"),
                    ),
                    ("data", ParamSchema::object(vec![], vec![])),
                ],
                vec!["event_type"],
            ),
            move |ctx, args| {
                let gateway = gateway.clone();
                async move {
                    let data = args.get("data").cloned().unwrap_or_else(|| json!({}));
                    let result = submit(
                        &gateway,
                        &ctx,
                        CommandType::WriteEvent,
                        json!({
                            "event_type": args["event_type"],
                            "data": data,
                        }),
                    )
                    .await?;
                    Ok(result_value(&result))
                }
            },
        );
    }

    registry
}

async fn submit(
    gateway: &Arc<dyn CommandGateway>,
    ctx: &ToolCallContext,
    command_type: CommandType,
    payload: Value,
) -> anyhow::Result<CommandResult> {
    let envelope = CommandEnvelope::new(
        ctx.room_id.clone(),
        command_type,
        ctx.actor.clone(),
        payload,
    );
    let result = gateway
        .submit(envelope)
        .await
        .with_context(|| format!("submitting {}", command_type))?;
    if result.status == CommandStatus::Rejected {
        anyhow::bail!(
            "{} rejected: {}",
            command_type,
            result.reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(result)
}

fn result_value(result: &CommandResult) -> Value {
    json!({
        "command_id": result.command_id,
        "status": result.status,
        "applied_seq_from": result.applied_seq_from,
        "applied_seq_to": result.applied_seq_to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CoreError, RoomId, UserId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Gateway that records envelopes and accepts everything.
    #[derive(Default)]
    struct RecordingGateway {
        submitted: Mutex<Vec<CommandEnvelope>>,
    }

    #[async_trait]
    impl CommandGateway for RecordingGateway {
        async fn submit(&self, envelope: CommandEnvelope) -> Result<CommandResult, CoreError> {
            let result = CommandResult::accepted(&envelope.command_id, 1, 1);
            self.submitted.lock().unwrap().push(envelope);
            Ok(result)
        }
    }

    fn ctx() -> ToolCallContext {
        ToolCallContext {
            room_id: RoomId::from("r"),
            actor: UserId::ai(),
        }
    }

    #[tokio::test]
    async fn public_message_becomes_chat_command() {
        let gateway = Arc::new(RecordingGateway::default());
        let registry = builtin_registry(gateway.clone());

        registry
            .invoke("send_public_message", ctx(), json!({"message": "dusk falls"}))
            .await
            .unwrap();

        let submitted = gateway.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].command_type, CommandType::PublicChat);
        assert_eq!(submitted[0].actor_user_id, UserId::ai());
        assert_eq!(submitted[0].str_field("message"), Some("dusk falls"));
    }

    #[tokio::test]
    async fn confirmation_emits_whisper_and_audit() {
        let gateway = Arc::new(RecordingGateway::default());
        let registry = builtin_registry(gateway.clone());

        registry
            .invoke(
                "request_player_confirmation",
                ctx(),
                json!({"to_user_id": "alice", "question": "use your ability?"}),
            )
            .await
            .unwrap();

        let submitted = gateway.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].command_type, CommandType::Whisper);
        assert_eq!(submitted[1].command_type, CommandType::WriteEvent);
        assert_eq!(
            submitted[1].str_field("event_type"),
            Some("confirmation.requested")
        );
    }

    #[tokio::test]
    async fn advance_phase_rejects_bad_enum() {
        let gateway = Arc::new(RecordingGateway::default());
        let registry = builtin_registry(gateway.clone());

        let err = registry
            .invoke("advance_phase", ctx(), json!({"phase": "teatime"}))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::tools::ToolError::Schema(_)));
        assert!(gateway.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_contract_tool_is_registered() {
        let registry = builtin_registry(Arc::new(RecordingGateway::default()));
        for name in [
            "send_public_message",
            "send_private_message",
            "request_player_confirmation",
            "toggle_voting",
            "advance_phase",
            "write_event",
        ] {
            assert!(registry.describe(name).is_some(), "missing tool {}", name);
        }
    }
}
