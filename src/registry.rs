//! # Task registry (§4.8)
//!
//! Keyed by task name (stable string): handler, declared route, time-limit
//! policy, default max retries, and an optional partition-key selector
//! read from the deserialized input's raw bytes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::handler::TaskHandler;

/// Extracts a partition key from a task's raw serialized args, if the task
/// declares one. Returning `None` means "no partitioning for this input".
pub type PartitionKeySelector = Arc<dyn Fn(&[u8]) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    /// Declared route; `None` defers to the router's default/pattern resolution.
    pub route: Option<String>,
    pub soft_time_limit: Option<Duration>,
    pub hard_time_limit: Option<Duration>,
    pub max_retries: u32,
    pub partition_key_selector: Option<PartitionKeySelector>,
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("route", &self.route)
            .field("soft_time_limit", &self.soft_time_limit)
            .field("hard_time_limit", &self.hard_time_limit)
            .field("max_retries", &self.max_retries)
            .field("partition_key_selector", &self.partition_key_selector.is_some())
            .finish()
    }
}

/// Builder for one [`TaskDescriptor`], registered via [`TaskRegistry::register`].
pub struct TaskBuilder {
    descriptor: TaskDescriptor,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            descriptor: TaskDescriptor {
                name: name.into(),
                handler,
                route: None,
                soft_time_limit: None,
                hard_time_limit: None,
                max_retries: 3,
                partition_key_selector: None,
            },
        }
    }

    pub fn route(mut self, queue: impl Into<String>) -> Self {
        self.descriptor.route = Some(queue.into());
        self
    }

    pub fn soft_time_limit(mut self, d: Duration) -> Self {
        self.descriptor.soft_time_limit = Some(d);
        self
    }

    pub fn hard_time_limit(mut self, d: Duration) -> Self {
        self.descriptor.hard_time_limit = Some(d);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.descriptor.max_retries = n;
        self
    }

    pub fn partition_key(mut self, selector: PartitionKeySelector) -> Self {
        self.descriptor.partition_key_selector = Some(selector);
        self
    }

    pub fn build(self) -> TaskDescriptor {
        self.descriptor
    }
}

/// The task registry. Read-mostly: built up at startup, then shared via
/// `Arc` and replaced wholesale (copy-on-write) rather than mutated under a lock.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TaskDescriptor) {
        self.tasks.insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskDescriptor>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerOutcome, TaskContext};

    struct NoopHandler;

    #[async_trait::async_trait]
    impl TaskHandler for NoopHandler {
        async fn call(&self, _ctx: &TaskContext, _args: &[u8]) -> HandlerOutcome {
            HandlerOutcome::Success {
                bytes: vec![],
                content_type: "application/json".to_string(),
            }
        }
    }

    #[test]
    fn register_and_lookup_round_trips() {
        let mut registry = TaskRegistry::new();
        registry.register(
            TaskBuilder::new("emails.send", Arc::new(NoopHandler))
                .route("emails")
                .max_retries(5)
                .build(),
        );
        let descriptor = registry.get("emails.send").unwrap();
        assert_eq!(descriptor.route.as_deref(), Some("emails"));
        assert_eq!(descriptor.max_retries, 5);
        assert!(!registry.contains("unknown.task"));
    }
}
