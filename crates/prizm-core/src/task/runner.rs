//! Task runner: single agent invocations with a nesting bound.
//!
//! A task is one agent call spawned on behalf of a session (typically an
//! agent delegating a sub-task). Tasks are held in memory only, are bounded
//! per scope, and carry a depth that may not exceed `max_task_depth`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use prizm_types::config::EngineConfig;
use prizm_types::event::EngineEvent;
use prizm_types::task::{TaskMeta, TaskRun, TaskStatus};
use prizm_types::workflow::{ErrorKind, FailureKind, RunError};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::EventSink;
use crate::workflow::step_runner::{AgentInvocation, StepContext, StepRunner};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u8, max: u8 },

    #[error("task {0} not found")]
    NotFound(Uuid),
}

/// Live handle for a task that has not finished yet. Dropped from the
/// control map once the task is terminal.
struct TaskControl {
    cancel: CancellationToken,
    status_tx: watch::Sender<TaskStatus>,
    spawned: Instant,
    started: OnceLock<Instant>,
    /// Final record, kept here so a waiter still sees it after eviction.
    finished: OnceLock<TaskRun>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            status_tx: watch::channel(TaskStatus::Pending).0,
            spawned: Instant::now(),
            started: OnceLock::new(),
            finished: OnceLock::new(),
        }
    }

    /// Time since the agent call began, or since spawn if it never began.
    fn elapsed_ms(&self) -> u64 {
        self.started.get().unwrap_or(&self.spawned).elapsed().as_millis() as u64
    }
}

struct TaskInner {
    steps: StepRunner,
    events: Arc<dyn EventSink>,
    tasks: DashMap<Uuid, TaskRun>,
    controls: DashMap<Uuid, Arc<TaskControl>>,
    scope_limits: DashMap<String, Arc<Semaphore>>,
    max_depth: u8,
    max_concurrent_per_scope: usize,
    default_timeout_ms: u64,
    list_limit_max: u32,
    retain_finished: usize,
}

/// Spawns and tracks ad-hoc agent tasks.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<TaskInner>,
}

impl TaskRunner {
    pub fn new(steps: StepRunner, events: Arc<dyn EventSink>, config: &EngineConfig) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                steps,
                events,
                tasks: DashMap::new(),
                controls: DashMap::new(),
                scope_limits: DashMap::new(),
                max_depth: config.max_task_depth,
                max_concurrent_per_scope: config.max_concurrent_per_scope.max(1),
                default_timeout_ms: config.default_task_timeout_ms,
                list_limit_max: config.list_limit_max.max(1),
                retain_finished: config.retain_finished_tasks,
            }),
        }
    }

    /// Spawn a task and return its id immediately.
    ///
    /// The task runs at `meta.parent_depth + 1`. Past the depth bound nothing
    /// is created and a `DepthLimitReached` event is emitted instead.
    pub fn trigger(&self, scope: &str, input: &str, meta: TaskMeta) -> Result<Uuid, TaskError> {
        self.spawn(scope, input, meta).map(|(task_id, _)| task_id)
    }

    fn spawn(
        &self,
        scope: &str,
        input: &str,
        meta: TaskMeta,
    ) -> Result<(Uuid, Arc<TaskControl>), TaskError> {
        let depth = meta.parent_depth.saturating_add(1);
        let max = self.inner.max_depth;
        if depth > max {
            tracing::warn!(scope, depth, max, "task spawn refused by depth limit");
            self.inner.events.emit(EngineEvent::DepthLimitReached {
                scope: scope.to_string(),
                attempted_depth: depth,
                max_depth: max,
            });
            return Err(TaskError::DepthExceeded { depth, max });
        }

        let task = TaskRun::new(scope, input, &meta, depth);
        let task_id = task.id;
        let control = Arc::new(TaskControl::new());
        self.inner.tasks.insert(task_id, task);
        self.inner.controls.insert(task_id, Arc::clone(&control));

        tracing::info!(task_id = %task_id, scope, depth, label = ?meta.label, "spawning task");
        self.inner.events.emit(EngineEvent::TaskSpawned {
            task_id,
            scope: scope.to_string(),
            depth,
            parent_session_id: meta.parent_session_id.clone(),
        });

        let inner = Arc::clone(&self.inner);
        let invocation = AgentInvocation {
            prompt: input.to_string(),
            input: None,
            model: meta.model,
            session_config: None,
        };
        let scope = scope.to_string();
        let session_id = meta.parent_session_id;
        let handle = Arc::clone(&control);
        tokio::spawn(
            async move {
                inner
                    .execute(task_id, scope, session_id, invocation, handle)
                    .await
            }
            .instrument(tracing::info_span!("task", task_id = %task_id)),
        );
        Ok((task_id, control))
    }

    /// Spawn a task and wait for it.
    ///
    /// If the task is not done within `timeout_ms` (default from config) it
    /// is marked failed with kind `timeout` and its cancellation token fires.
    pub async fn trigger_sync(
        &self,
        scope: &str,
        input: &str,
        meta: TaskMeta,
        timeout_ms: Option<u64>,
    ) -> Result<TaskRun, TaskError> {
        let (task_id, control) = self.spawn(scope, input, meta)?;
        let timeout_ms = timeout_ms.unwrap_or(self.inner.default_timeout_ms);

        let mut rx = control.status_tx.subscribe();
        let waited = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            rx.wait_for(|status| status.is_terminal()).await.map(|_| ())
        })
        .await;
        if waited.is_err() {
            let message = format!("no result within {timeout_ms}ms");
            if self.inner.finish(task_id, TaskStatus::Failed, |task| {
                task.error = Some(RunError::new(ErrorKind::Timeout, message.clone()));
            }) {
                tracing::warn!(task_id = %task_id, timeout_ms, "task timed out");
                self.inner.events.emit(EngineEvent::TaskFailed {
                    task_id,
                    error: message,
                });
            }
        }
        match control.finished.get().cloned() {
            Some(task) => Ok(task),
            None => self.get_status(task_id),
        }
    }

    pub fn get_status(&self, task_id: Uuid) -> Result<TaskRun, TaskError> {
        self.inner
            .tasks
            .get(&task_id)
            .map(|t| t.clone())
            .ok_or(TaskError::NotFound(task_id))
    }

    /// Tasks in `scope`, newest first, optionally only those spawned by one
    /// session.
    pub fn list(&self, scope: &str, parent_session_id: Option<&str>, limit: u32) -> Vec<TaskRun> {
        let mut tasks: Vec<TaskRun> = self
            .inner
            .tasks
            .iter()
            .filter(|t| t.scope == scope)
            .filter(|t| {
                parent_session_id.is_none() || t.parent_session_id.as_deref() == parent_session_id
            })
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        tasks.truncate(limit.clamp(1, self.inner.list_limit_max) as usize);
        tasks
    }

    /// Cancel a task. Returns `false` if it had already finished.
    pub fn cancel(&self, task_id: Uuid) -> Result<bool, TaskError> {
        if !self.inner.tasks.contains_key(&task_id) {
            return Err(TaskError::NotFound(task_id));
        }
        let cancelled = self.inner.finish(task_id, TaskStatus::Cancelled, |task| {
            task.error = Some(RunError::new(ErrorKind::Cancelled, "cancelled by request"));
        });
        if cancelled {
            tracing::info!(task_id = %task_id, "task cancelled");
            self.inner.events.emit(EngineEvent::TaskCancelled { task_id });
        }
        Ok(cancelled)
    }
}

impl TaskInner {
    fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        self.scope_limits
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_scope)))
            .clone()
    }

    /// Move a non-terminal task to `status`, fire its token, and wake
    /// waiters. Returns `false` if the task was already terminal.
    ///
    /// The task's control entry is dropped and old finished tasks past the
    /// retention bound are evicted.
    fn finish(&self, task_id: Uuid, status: TaskStatus, update: impl FnOnce(&mut TaskRun)) -> bool {
        let control = self.controls.get(&task_id).map(|c| Arc::clone(c.value()));
        let finished = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return false;
            };
            if task.status.is_terminal() {
                return false;
            }
            task.status = status;
            task.finished_at = Some(Utc::now());
            update(&mut *task);
            if task.duration_ms.is_none() {
                task.duration_ms = control.as_ref().map(|c| c.elapsed_ms());
            }
            task.clone()
        };
        self.controls.remove(&task_id);
        if let Some(control) = control {
            let _ = control.finished.set(finished);
            if status != TaskStatus::Completed {
                control.cancel.cancel();
            }
            control.status_tx.send_replace(status);
        }
        self.evict_finished();
        true
    }

    /// Drop the oldest finished tasks beyond `retain_finished`.
    fn evict_finished(&self) {
        let mut finished: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.finished_at.unwrap_or(t.created_at), t.id))
            .collect();
        if finished.len() <= self.retain_finished {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - self.retain_finished;
        for (_, id) in finished.into_iter().take(excess) {
            self.tasks.remove(&id);
        }
        tracing::debug!(evicted = excess, "evicted finished tasks");
    }

    async fn execute(
        &self,
        task_id: Uuid,
        scope: String,
        session_id: Option<String>,
        invocation: AgentInvocation,
        control: Arc<TaskControl>,
    ) {
        let semaphore = self.scope_semaphore(&scope);
        let _permit = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => return,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    self.finish(task_id, TaskStatus::Failed, |task| {
                        task.error = Some(RunError::new(ErrorKind::Internal, e.to_string()));
                    });
                    return;
                }
            },
        };

        match self.tasks.get_mut(&task_id) {
            Some(mut task) if !task.status.is_terminal() => task.status = TaskStatus::Running,
            _ => return,
        }
        let started = Instant::now();
        let _ = control.started.set(started);
        control.status_tx.send_replace(TaskStatus::Running);

        let ctx = StepContext {
            scope,
            session_id,
            run_id: None,
            step_id: format!("task-{task_id}"),
            cancel: control.cancel.child_token(),
        };
        let result = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => return,
            result = self.steps.invoke_agent(invocation, &ctx) => result,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let done = self.finish(task_id, TaskStatus::Completed, |task| {
                    task.output = Some(output.output);
                    task.session_id = output.session_id;
                    task.duration_ms = Some(duration_ms);
                });
                if done {
                    tracing::info!(task_id = %task_id, duration_ms, "task completed");
                    self.events.emit(EngineEvent::TaskCompleted {
                        task_id,
                        duration_ms,
                    });
                }
            }
            Err(err) => {
                let kind = match err.kind {
                    FailureKind::Failed => ErrorKind::StepFailed,
                    FailureKind::Timeout => ErrorKind::StepTimeout,
                };
                let message = err.message.clone();
                let done = self.finish(task_id, TaskStatus::Failed, |task| {
                    task.error = Some(RunError::new(kind, message));
                    task.duration_ms = Some(duration_ms);
                });
                if done {
                    tracing::warn!(task_id = %task_id, error = %err, "task failed");
                    self.events.emit(EngineEvent::TaskFailed {
                        task_id,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
