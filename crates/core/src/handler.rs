//! Handler contract and the immutable name-to-handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::outcome::TaskResult;
use crate::task::Task;

/// A registered task handler.
///
/// Handlers are plain values invoked with the decoded task row. They are
/// assumed blocking and compute-bound; the worker runs them on its executor
/// pool rather than on the polling loop.
pub type Handler = Arc<dyn Fn(&Task) -> TaskResult + Send + Sync>;

/// Name-to-handler mapping, built once at startup and immutable thereafter.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: Arc<HashMap<String, Handler>>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    handlers: HashMap<String, Handler>,
}

impl TaskRegistryBuilder {
    /// Register a handler under the given task name. A later registration
    /// under the same name replaces the earlier one.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Task) -> TaskResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
