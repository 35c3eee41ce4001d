//! Linked-action handlers: side effects fired after a step succeeds.
//!
//! Handlers are best-effort. The runner logs and emits an event for a
//! failed action, but never fails the step because of it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use prizm_types::workflow::LinkedAction;
use uuid::Uuid;

use crate::lock::{LockManager, ResourceKey};

/// Where an action came from.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub scope: String,
    pub run_id: Uuid,
    pub step_id: String,
}

impl ActionContext {
    /// Lock holder id for this step's side effects.
    pub fn holder_id(&self) -> String {
        format!("run:{}:{}", self.run_id, self.step_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{resource_type} '{resource_id}' is locked by {held_by}")]
    Locked {
        resource_type: String,
        resource_id: String,
        held_by: String,
    },

    #[error("action failed: {0}")]
    Failed(String),
}

type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;

/// Performs rendered linked actions.
pub trait LinkedActionHandler: Send + Sync {
    fn handle<'a>(&'a self, action: &'a LinkedAction, ctx: &'a ActionContext) -> ActionFuture<'a>;
}

/// Default handler: records each action in the log and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActionHandler;

impl LinkedActionHandler for LoggingActionHandler {
    fn handle<'a>(&'a self, action: &'a LinkedAction, ctx: &'a ActionContext) -> ActionFuture<'a> {
        Box::pin(async move {
            match action {
                LinkedAction::CreateTodo { list, title } => tracing::info!(
                    run_id = %ctx.run_id,
                    step_id = %ctx.step_id,
                    list = list.as_deref().unwrap_or("default"),
                    title = %title,
                    "linked action: create todo"
                ),
                LinkedAction::Notify { message } => tracing::info!(
                    run_id = %ctx.run_id,
                    step_id = %ctx.step_id,
                    message = %message,
                    "linked action: notify"
                ),
                LinkedAction::AppendDocument { document_id, content } => tracing::info!(
                    run_id = %ctx.run_id,
                    step_id = %ctx.step_id,
                    document_id = %document_id,
                    bytes = content.len(),
                    "linked action: append document"
                ),
            }
            Ok(())
        })
    }
}

/// Resource touched by an action, if it needs a lock.
fn resource_for(action: &LinkedAction, scope: &str) -> Option<ResourceKey> {
    match action {
        LinkedAction::CreateTodo { list, .. } => Some(ResourceKey::new(
            scope,
            "todo_list",
            list.as_deref().unwrap_or("default"),
        )),
        LinkedAction::AppendDocument { document_id, .. } => {
            Some(ResourceKey::new(scope, "document", document_id.as_str()))
        }
        LinkedAction::Notify { .. } => None,
    }
}

/// Wraps another handler with acquire/release on the resource it touches.
///
/// If the resource is held by someone else the action fails with
/// [`ActionError::Locked`] and the inner handler is not called.
pub struct LockingActionHandler {
    inner: Arc<dyn LinkedActionHandler>,
    locks: Arc<dyn LockManager>,
}

impl LockingActionHandler {
    pub fn new(inner: Arc<dyn LinkedActionHandler>, locks: Arc<dyn LockManager>) -> Self {
        Self { inner, locks }
    }
}

impl LinkedActionHandler for LockingActionHandler {
    fn handle<'a>(&'a self, action: &'a LinkedAction, ctx: &'a ActionContext) -> ActionFuture<'a> {
        Box::pin(async move {
            let Some(key) = resource_for(action, &ctx.scope) else {
                return self.inner.handle(action, ctx).await;
            };
            let holder = ctx.holder_id();
            let grant = self
                .locks
                .acquire(&key, &holder, Some(action.type_name()))
                .await
                .map_err(|e| ActionError::Failed(e.to_string()))?;
            if !grant.success {
                return Err(ActionError::Locked {
                    resource_type: key.resource_type.clone(),
                    resource_id: key.resource_id.clone(),
                    held_by: grant.held_by.unwrap_or_else(|| "unknown".to_string()),
                });
            }

            let result = self.inner.handle(action, ctx).await;

            if let Err(e) = self.locks.release(&key, &holder).await {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    resource_id = %key.resource_id,
                    error = %e,
                    "failed to release action lock"
                );
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockManager;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<String>>,
    }

    impl LinkedActionHandler for Recorder {
        fn handle<'a>(&'a self, action: &'a LinkedAction, _ctx: &'a ActionContext) -> ActionFuture<'a> {
            Box::pin(async move {
                self.handled.lock().unwrap().push(action.type_name().to_string());
                Ok(())
            })
        }
    }

    fn ctx() -> ActionContext {
        ActionContext {
            scope: "notes".to_string(),
            run_id: Uuid::now_v7(),
            step_id: "publish".to_string(),
        }
    }

    fn append() -> LinkedAction {
        LinkedAction::AppendDocument {
            document_id: "doc-1".to_string(),
            content: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_locking_handler_acquires_and_releases() {
        let recorder = Arc::new(Recorder::default());
        let locks = Arc::new(InMemoryLockManager::new());
        let handler = LockingActionHandler::new(recorder.clone(), locks.clone());

        handler.handle(&append(), &ctx()).await.unwrap();

        assert_eq!(*recorder.handled.lock().unwrap(), vec!["append_document"]);
        let key = ResourceKey::new("notes", "document", "doc-1");
        assert!(locks.status(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locking_handler_refuses_when_held() {
        let recorder = Arc::new(Recorder::default());
        let locks = Arc::new(InMemoryLockManager::new());
        let key = ResourceKey::new("notes", "document", "doc-1");
        locks.acquire(&key, "someone-else", None).await.unwrap();

        let handler = LockingActionHandler::new(recorder.clone(), locks);
        let err = handler.handle(&append(), &ctx()).await.unwrap_err();

        assert!(matches!(err, ActionError::Locked { ref held_by, .. } if held_by == "someone-else"));
        assert!(recorder.handled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_needs_no_lock() {
        let recorder = Arc::new(Recorder::default());
        let handler = LockingActionHandler::new(recorder.clone(), Arc::new(InMemoryLockManager::new()));
        let notify = LinkedAction::Notify {
            message: "done".to_string(),
        };
        handler.handle(&notify, &ctx()).await.unwrap();
        LoggingActionHandler.handle(&notify, &ctx()).await.unwrap();
        assert_eq!(recorder.handled.lock().unwrap().len(), 1);
    }
}
