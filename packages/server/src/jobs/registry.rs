//! Handler registry.
//!
//! Maps task type strings to async handlers. Consumers must be registered
//! before the worker starts delivering, so no message can arrive for an
//! unknown handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::{anyhow, Result};
use serde_json::Value;

use super::task::Task;

type BoxedHandler =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. Dependencies are captured in
    /// the closure at registration time.
    pub fn register<F, Fut>(&mut self, task_type: &'static str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(task_type, Box::new(move |args| Box::pin(handler(args))));
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub async fn execute(&self, task: &Task) -> Result<()> {
        let handler = self
            .handlers
            .get(task.task_type.as_str())
            .ok_or_else(|| anyhow!("unknown task type: {}", task.task_type))?;
        handler(task.args.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn registered_handler_runs() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut registry = TaskRegistry::new();
        let captured = counter.clone();
        registry.register("bump", move |_args| {
            let captured = captured.clone();
            async move {
                captured.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let task = Task::new("bump", json!({}), 3);
        registry.execute(&task).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_errors() {
        let registry = TaskRegistry::new();
        let task = Task::new("mystery", json!({}), 3);
        assert!(registry.execute(&task).await.is_err());
        assert!(!registry.is_registered("mystery"));
    }
}
