//! Task-type → handler registry, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::{TaskContext, TaskKind, TaskOutcome};

/// Handles one kind of task.
///
/// Delivery is at-least-once: a handler may see the same task again after a
/// crash or lease expiry and must tolerate re-running.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> TaskOutcome;
}

/// Maps each [`TaskKind`] to its handler. Read-only once the processor starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Resolve a wire tag. `None` for unknown tags and for known kinds without a handler.
    pub fn resolve(&self, tag: &str) -> Option<(TaskKind, Arc<dyn TaskHandler>)> {
        let kind: TaskKind = tag.parse().ok()?;
        self.handlers.get(&kind).map(|h| (kind, h.clone()))
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Known kinds nobody registered a handler for.
    pub fn unregistered_kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f(ctx, payload)` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
{
    async fn handle(&self, ctx: &TaskContext, payload: &[u8]) -> TaskOutcome {
        (self.0)(ctx.clone(), payload.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_kinds_only() {
        let empty = HandlerRegistry::new();
        assert!(empty.resolve("task:send_verify_email").is_none());
        assert_eq!(empty.unregistered_kinds(), vec![TaskKind::SendVerifyEmail]);

        let registry =
            HandlerRegistry::new().with(TaskKind::SendVerifyEmail, handler_fn(|_, _| async { TaskOutcome::Success }));
        let (kind, _) = registry.resolve("task:send_verify_email").expect("registered");
        assert_eq!(kind, TaskKind::SendVerifyEmail);
        assert!(registry.resolve("task:unknown").is_none());
        assert!(registry.unregistered_kinds().is_empty());
    }
}
