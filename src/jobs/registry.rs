//! Named tasks supplied by external modules.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by a registered task.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registered task: called once per run.
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Registry of tasks by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any previous task with that name.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: TaskFn = Arc::new(move || Box::pin(func()));
        self.tasks.insert(name.into(), func);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry")
            .field("tasks", &names)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut registry = TaskRegistry::new();
        registry.register("gerarEntregasDoDia", || async { Ok(()) });

        let task = registry.resolve("gerarEntregasDoDia").unwrap();
        assert!(task().await.is_ok());
        assert!(registry.resolve("outraTarefa").is_none());
    }

    #[tokio::test]
    async fn test_task_errors_are_returned() {
        let mut registry = TaskRegistry::new();
        registry.register("falha", || async { anyhow::bail!("db offline") });

        let err = registry.resolve("falha").unwrap()().await.unwrap_err();
        assert_eq!(err.to_string(), "db offline");
    }

    #[test]
    fn test_debug_lists_names() {
        let mut registry = TaskRegistry::new();
        registry
            .register("b", || async { Ok(()) })
            .register("a", || async { Ok(()) });

        assert_eq!(format!("{registry:?}"), r#"TaskRegistry { tasks: ["a", "b"] }"#);
        assert!(!registry.is_empty());
        assert!(TaskRegistry::new().is_empty());
    }
}
