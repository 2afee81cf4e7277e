//! Task model.

use serde_json::Value;
use uuid::Uuid;

/// One unit of queued work. The `args` payload is opaque to the queue;
/// the registry deserializes it for the registered handler.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub args: Value,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl Task {
    pub fn new(task_type: &str, args: Value, max_retries: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            args,
            retry_count: 0,
            max_retries,
        }
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
