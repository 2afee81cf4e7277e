//! Tool registry for the AI side-channel.
//!
//! Named operations with declared parameter schemas. `invoke` validates the
//! arguments, runs the handler, and records an audit entry. Every tool
//! bottoms out in a command through the room pipeline; none touches state
//! directly, so the AI can only do what a privileged human could.

pub mod builtin;
pub mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::common::{RoomId, UserId};

pub use builtin::builtin_registry;
pub use schema::{validate, ParamSchema, SchemaViolation};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error(transparent)]
    Schema(#[from] SchemaViolation),
    #[error("tool execution failed: {0}")]
    Execution(#[source] anyhow::Error),
}

/// Where a tool call lands: which room, and under which actor identity the
/// resulting commands are submitted.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub room_id: RoomId,
    pub actor: UserId,
}

type ToolHandler = Box<
    dyn Fn(ToolCallContext, Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
        + Send
        + Sync,
>;

struct ToolDef {
    description: &'static str,
    schema: ParamSchema,
    handler: ToolHandler,
}

/// One audit line per invocation, success or failure.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub name: String,
    pub args: Value,
    pub result: Result<Value, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, ToolDef>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(
        &mut self,
        name: &'static str,
        description: &'static str,
        schema: ParamSchema,
        handler: F,
    ) where
        F: Fn(ToolCallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.tools.insert(
            name,
            ToolDef {
                description,
                schema,
                handler: Box::new(move |ctx, args| Box::pin(handler(ctx, args))),
            },
        );
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn describe(&self, name: &str) -> Option<&'static str> {
        self.tools.get(name).map(|def| def.description)
    }

    /// Validate and execute one tool call.
    pub async fn invoke(
        &self,
        name: &str,
        ctx: ToolCallContext,
        args: Value,
    ) -> Result<Value, ToolError> {
        let def = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        validate(&args, &def.schema)?;

        let outcome = (def.handler)(ctx, args.clone()).await;
        let entry = AuditEntry {
            name: name.to_string(),
            args,
            result: outcome
                .as_ref()
                .map(|v| v.clone())
                .map_err(|e| e.to_string()),
            timestamp: Utc::now(),
        };
        debug!(tool = name, ok = entry.result.is_ok(), "tool invoked");
        self.audit.lock().expect("audit lock").push(entry);

        outcome.map_err(ToolError::Execution)
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("audit lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with_echo() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            "echo",
            "returns its message",
            ParamSchema::object(
                vec![("message", ParamSchema::string().with_length(1, 100))],
                vec!["message"],
            ),
            |_ctx, args| async move { Ok(json!({"echoed": args["message"]})) },
        );
        registry
    }

    fn ctx() -> ToolCallContext {
        ToolCallContext {
            room_id: RoomId::from("r"),
            actor: UserId::ai(),
        }
    }

    #[tokio::test]
    async fn invoke_validates_then_runs() {
        let registry = registry_with_echo();
        let out = registry
            .invoke("echo", ctx(), json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(out["echoed"], "hi");
        assert_eq!(registry.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn schema_violation_blocks_handler() {
        let registry = registry_with_echo();
        let err = registry.invoke("echo", ctx(), json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Schema(_)));
        // Rejected calls never reach the handler, so no audit entry.
        assert!(registry.audit_log().is_empty());
    }

    #[tokio::test]
    async fn unknown_tool() {
        let registry = registry_with_echo();
        let err = registry
            .invoke("vanish", ctx(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn failures_are_audited() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "explode",
            "always fails",
            ParamSchema::object(vec![], vec![]),
            |_ctx, _args| async move { Err(anyhow::anyhow!("boom")) },
        );
        let err = registry
            .invoke("explode", ctx(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Execution(_)));
        let audit = registry.audit_log();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].result.is_err());
    }
}
