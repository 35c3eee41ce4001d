//! Workflow runner: the sequential run state machine.
//!
//! `WorkflowRunner` owns every in-flight run. Each run is driven by one
//! spawned task that walks the steps in order, persisting the run record
//! after every transition so a crash loses at most the step in flight.
//!
//! # Run lifecycle
//!
//! ```text
//! pending -> running -> completed
//!               |  \--> failed
//!               v
//!            paused --resume(approved)--> running
//!               \-----resume(denied)----> cancelled
//! ```
//!
//! Any non-terminal run can be cancelled. Approve steps pause the run and
//! issue a single-use resume token; the token is cleared and persisted
//! before execution continues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prizm_types::config::EngineConfig;
use prizm_types::event::EngineEvent;
use prizm_types::workflow::{
    ErrorKind, ErrorStrategy, FailureKind, RunError, RunFilter, RunStatus, RunSummary,
    StepStatus, WorkflowDef, WorkflowRun,
};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::actions::{ActionContext, LinkedActionHandler};
use super::context::{cap_output, RunContext};
use super::definition::{compile, CompiledStep, CompiledWorkflow, ParseError};
use super::expression;
use super::registry::{RegistryError, WorkflowRegistry};
use super::resume::{ResumeStore, StoreError};
use super::retry::RetryHandler;
use super::step_runner::{StepContext, StepError, StepOutcome, StepRunner};
use super::trigger::TriggerEvent;
use crate::event::EventSink;
use crate::repository::definition::DefinitionRepository;
use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// Errors and options
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("resume token is invalid or was already used")]
    InvalidToken,

    #[error("run {0} is being resumed by another caller")]
    ConcurrentAccess(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("missing required arg '{0}'")]
    MissingArg(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("workflow '{0}' not found")]
    UnknownWorkflow(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistryError> for RunnerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => RunnerError::UnknownWorkflow(name),
            RegistryError::Parse(e) => RunnerError::Parse(e),
            other => RunnerError::Registry(other.to_string()),
        }
    }
}

/// Options for starting a run.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub args: Map<String, Value>,
    /// Recorded on the run; `manual` for direct calls.
    pub trigger_type: String,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            args: Map::new(),
            trigger_type: "manual".to_string(),
        }
    }
}

impl StartOptions {
    pub fn with_args(args: Map<String, Value>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }
}

/// Check required args and fill declared defaults. Extra args pass through.
pub fn resolve_args(
    def: &WorkflowDef,
    mut args: Map<String, Value>,
) -> Result<Map<String, Value>, RunnerError> {
    for (name, arg) in &def.args {
        if args.contains_key(name) {
            continue;
        }
        match &arg.default {
            Some(default) => {
                args.insert(name.clone(), default.clone());
            }
            None => return Err(RunnerError::MissingArg(name.clone())),
        }
    }
    Ok(args)
}

// ---------------------------------------------------------------------------
// Active run bookkeeping
// ---------------------------------------------------------------------------

/// A run that a driver (or a resume/cancel call) currently owns.
struct ActiveRun {
    state: Mutex<WorkflowRun>,
    cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
}

impl ActiveRun {
    fn new(run: WorkflowRun) -> Arc<Self> {
        let (status_tx, _) = watch::channel(run.status);
        Arc::new(Self {
            state: Mutex::new(run),
            cancel: CancellationToken::new(),
            status_tx,
        })
    }
}

/// How a single attempt ended, as seen by the driver.
enum Attempt {
    Cancelled,
    RunTimeout,
    Done(Result<StepOutcome, StepError>),
}

/// What the driver does after a step.
enum Next {
    Advance,
    Stop,
}

struct Inner<R: RunRepository, D: DefinitionRepository> {
    store: ResumeStore<R>,
    registry: Arc<WorkflowRegistry<D>>,
    steps: StepRunner,
    actions: Arc<dyn LinkedActionHandler>,
    events: Arc<dyn EventSink>,
    active: DashMap<Uuid, Arc<ActiveRun>>,
    scope_limits: DashMap<String, Arc<Semaphore>>,
    max_concurrent_per_scope: usize,
    list_limit_max: u32,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Starts, resumes, and cancels workflow runs.
///
/// Cheap to clone; clones share the same set of active runs.
pub struct WorkflowRunner<R: RunRepository, D: DefinitionRepository> {
    inner: Arc<Inner<R, D>>,
}

impl<R: RunRepository, D: DefinitionRepository> Clone for WorkflowRunner<R, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, D> WorkflowRunner<R, D>
where
    R: RunRepository + 'static,
    D: DefinitionRepository + 'static,
{
    pub fn new(
        runs: R,
        registry: Arc<WorkflowRegistry<D>>,
        steps: StepRunner,
        actions: Arc<dyn LinkedActionHandler>,
        events: Arc<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: ResumeStore::new(runs),
                registry,
                steps,
                actions,
                events,
                active: DashMap::new(),
                scope_limits: DashMap::new(),
                max_concurrent_per_scope: config.max_concurrent_per_scope.max(1),
                list_limit_max: config.list_limit_max.max(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry<D>> {
        &self.inner.registry
    }

    pub fn store(&self) -> &ResumeStore<R> {
        &self.inner.store
    }

    /// Start a run of `def` and return its id without waiting for it.
    ///
    /// The definition is compiled and snapshotted onto the run; required
    /// args are checked and defaults filled before anything is persisted.
    pub async fn start(
        &self,
        scope: &str,
        def: WorkflowDef,
        options: StartOptions,
    ) -> Result<Uuid, RunnerError> {
        let compiled = Arc::new(compile(&def)?);
        let args = resolve_args(&def, options.args)?;
        let mut run = WorkflowRun::new(scope, def, args, options.trigger_type);
        self.inner.store.save(&mut run).await?;

        let run_id = run.id;
        tracing::info!(
            run_id = %run_id,
            scope,
            workflow = %run.workflow_name,
            trigger = %run.trigger_type,
            "starting workflow run"
        );
        self.inner.events.emit(EngineEvent::RunStarted {
            run_id,
            workflow_name: run.workflow_name.clone(),
            scope: scope.to_string(),
            trigger_type: run.trigger_type.clone(),
        });

        let active = ActiveRun::new(run);
        self.inner.active.insert(run_id, Arc::clone(&active));
        self.spawn_driver(run_id, active, compiled, None);
        Ok(run_id)
    }

    /// Start the definition registered under `(scope, name)`.
    pub async fn start_by_name(
        &self,
        scope: &str,
        name: &str,
        options: StartOptions,
    ) -> Result<Uuid, RunnerError> {
        let def = self.inner.registry.load_def(scope, name).await?;
        self.start(scope, def, options).await
    }

    /// Start every registered workflow whose trigger fires for `event`.
    ///
    /// A workflow that fails to start is logged and skipped.
    pub async fn dispatch_event(
        &self,
        scope: &str,
        event: &TriggerEvent,
    ) -> Result<Vec<Uuid>, RunnerError> {
        let matched = self.inner.registry.match_event(scope, event).await?;
        let mut started = Vec::with_capacity(matched.len());
        for triggered in matched {
            let options = StartOptions {
                args: triggered.args,
                trigger_type: event.trigger_type.as_str().to_string(),
            };
            let name = triggered.record.name.clone();
            match self.start(scope, triggered.definition, options).await {
                Ok(run_id) => started.push(run_id),
                Err(e) => {
                    tracing::warn!(scope, workflow = %name, error = %e, "triggered run failed to start")
                }
            }
        }
        Ok(started)
    }

    /// Continue or reject a run paused at an approve step.
    ///
    /// The token is single-use: it is cleared and persisted before the run
    /// moves on. Returns the run snapshot right after the decision.
    pub async fn resume(&self, token: &str, approved: bool) -> Result<WorkflowRun, RunnerError> {
        let found = self
            .inner
            .store
            .find_by_token(token)
            .await?
            .ok_or(RunnerError::InvalidToken)?;
        if found.status != RunStatus::Paused {
            return Err(RunnerError::InvalidToken);
        }
        let run_id = found.id;

        // Claim the run; a second concurrent resume loses here.
        let active = ActiveRun::new(found);
        match self.inner.active.entry(run_id) {
            Entry::Occupied(_) => return Err(RunnerError::ConcurrentAccess(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&active));
            }
        }

        // The state lock is held until the decision is persisted, so a cancel
        // that found the claim waits for it and then sees the outcome.
        let mut run = active.state.lock().await;
        if active.cancel.is_cancelled() {
            return Err(RunnerError::ConcurrentAccess(run_id));
        }

        // Re-read under the claim: the token may have been spent meanwhile.
        let fresh = match self.inner.store.get(&run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Paused && run.resume_token.as_deref() == Some(token) => run,
            Ok(_) => {
                self.release(run_id, &active);
                return Err(RunnerError::InvalidToken);
            }
            Err(e) => {
                self.release(run_id, &active);
                return Err(e.into());
            }
        };

        let compiled = match compile(&fresh.definition) {
            Ok(compiled) => Arc::new(compiled),
            Err(e) => {
                self.release(run_id, &active);
                return Err(e.into());
            }
        };

        *run = fresh;
        run.resume_token = None;
        let index = run.current_step_index;
        let step_id = run
            .step_results
            .get(index)
            .map(|r| r.step_id.clone())
            .unwrap_or_default();
        let now = Utc::now();

        self.inner.events.emit(EngineEvent::RunResumed { run_id, approved });

        if !approved {
            if let Some(result) = run.step_results.get_mut(index) {
                result.status = StepStatus::Failed;
                result.error = Some(RunError::new(ErrorKind::Denied, "approval denied"));
                result.finished_at = Some(now);
            }
            run.status = RunStatus::Cancelled;
            run.error = Some(RunError::new(
                ErrorKind::Denied,
                format!("step '{step_id}' was denied"),
            ));
            let saved = self.inner.store.save(&mut run).await;
            let snapshot = run.clone();
            self.release(run_id, &active);
            drop(run);
            active.status_tx.send_replace(RunStatus::Cancelled);
            saved?;

            tracing::info!(run_id = %run_id, step_id = %step_id, "run denied at approval");
            self.inner.events.emit(EngineEvent::RunCancelled {
                run_id,
                reason: "denied".to_string(),
            });
            return Ok(snapshot);
        }

        if let Some(result) = run.step_results.get_mut(index) {
            result.status = StepStatus::Completed;
            result.output = Some(json!({ "approved": true }));
            result.error = None;
            result.finished_at = Some(now);
        }
        run.current_step_index = index + 1;
        run.status = RunStatus::Running;
        if let Err(e) = self.inner.store.save(&mut run).await {
            self.release(run_id, &active);
            return Err(e.into());
        }
        active.status_tx.send_replace(RunStatus::Running);
        let snapshot = run.clone();
        drop(run);

        tracing::info!(run_id = %run_id, step_id = %step_id, "run approved, resuming");
        self.spawn_driver(run_id, active, compiled, Some(index));
        Ok(snapshot)
    }

    /// Cancel a non-terminal run.
    ///
    /// Returns `false` if the run had already reached a terminal state. A
    /// paused run loses its resume token.
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, RunnerError> {
        loop {
            let existing = self.inner.active.get(&run_id).map(|e| Arc::clone(e.value()));
            if let Some(active) = existing {
                match self.cancel_active(run_id, active).await? {
                    Some(cancelled) => return Ok(cancelled),
                    None => continue,
                }
            }

            let run = self
                .inner
                .store
                .get(&run_id)
                .await?
                .ok_or(RunnerError::RunNotFound(run_id))?;
            if run.status.is_terminal() {
                return Ok(false);
            }

            // Paused (or orphaned) with no driver: claim it and cancel in place.
            let active = ActiveRun::new(run);
            match self.inner.active.entry(run_id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&active));
                }
            }
            // Re-read under the claim so a resume that just finished is not lost.
            match self.inner.store.get(&run_id).await {
                Ok(Some(fresh)) => *active.state.lock().await = fresh,
                Ok(None) => {
                    self.release(run_id, &active);
                    return Err(RunnerError::RunNotFound(run_id));
                }
                Err(e) => {
                    self.release(run_id, &active);
                    return Err(e.into());
                }
            }
            match self.cancel_active(run_id, active).await? {
                Some(cancelled) => return Ok(cancelled),
                None => continue,
            }
        }
    }

    /// Drop `active` from the active table, unless another claim replaced it.
    fn release(&self, run_id: Uuid, active: &Arc<ActiveRun>) {
        self.inner
            .active
            .remove_if(&run_id, |_, current| Arc::ptr_eq(current, active));
    }

    /// Cancel through an existing claim. `None` means the claim was released
    /// before the state lock was acquired (a resume that gave up), and the
    /// caller should look the run up again.
    async fn cancel_active(
        &self,
        run_id: Uuid,
        active: Arc<ActiveRun>,
    ) -> Result<Option<bool>, RunnerError> {
        let mut run = active.state.lock().await;
        if run.status.is_terminal() {
            return Ok(Some(false));
        }
        let still_claimed = self
            .inner
            .active
            .get(&run_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &active));
        if !still_claimed {
            return Ok(None);
        }
        active.cancel.cancel();

        let now = Utc::now();
        let index = run.current_step_index;
        if let Some(result) = run.step_results.get_mut(index) {
            if matches!(result.status, StepStatus::Running | StepStatus::WaitingApproval) {
                result.status = StepStatus::Failed;
                result.error = Some(RunError::new(ErrorKind::Cancelled, "run cancelled"));
                result.finished_at = Some(now);
            }
        }
        run.status = RunStatus::Cancelled;
        run.error = Some(RunError::new(ErrorKind::Cancelled, "cancelled by request"));
        run.resume_token = None;
        let saved = self.inner.store.save(&mut run).await;
        self.release(run_id, &active);
        drop(run);
        active.status_tx.send_replace(RunStatus::Cancelled);
        saved?;

        tracing::info!(run_id = %run_id, "run cancelled");
        self.inner.events.emit(EngineEvent::RunCancelled {
            run_id,
            reason: "cancelled by request".to_string(),
        });
        Ok(Some(true))
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, RunnerError> {
        self.inner
            .store
            .get(&run_id)
            .await?
            .ok_or(RunnerError::RunNotFound(run_id))
    }

    /// Most recent runs in `scope`, capped at the configured list limit.
    pub async fn list_runs(
        &self,
        scope: &str,
        filter: &RunFilter,
        limit: u32,
    ) -> Result<Vec<RunSummary>, RunnerError> {
        let runs = self
            .inner
            .store
            .list(scope, filter, limit.min(self.inner.list_limit_max))
            .await?;
        Ok(runs.iter().map(WorkflowRun::summary).collect())
    }

    /// Wait until the run is paused or terminal, or `timeout` elapses, and
    /// return its latest snapshot either way.
    pub async fn wait_settled(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowRun, RunnerError> {
        let rx = self
            .inner
            .active
            .get(&run_id)
            .map(|e| e.value().status_tx.subscribe());
        if let Some(mut rx) = rx {
            let _ = tokio::time::timeout(timeout, async {
                rx.wait_for(|status| status.is_settled()).await.map(|_| ())
            })
            .await;
        }
        self.get_run(run_id).await
    }

    /// Number of runs currently owned by a driver.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Restart drivers for runs left pending or running by a previous
    /// process. Returns how many were picked up.
    pub async fn recover(&self) -> Result<usize, RunnerError> {
        let mut recovered = 0;
        for run in self.inner.store.unfinished().await? {
            let run_id = run.id;
            if self.inner.active.contains_key(&run_id) {
                continue;
            }
            let compiled = match compile(&run.definition) {
                Ok(compiled) => Arc::new(compiled),
                Err(e) => {
                    let mut run = run;
                    run.status = RunStatus::Failed;
                    run.error = Some(RunError::new(
                        ErrorKind::Internal,
                        format!("snapshot no longer compiles: {e}"),
                    ));
                    self.inner.store.save(&mut run).await?;
                    tracing::warn!(run_id = %run_id, error = %e, "could not recover run");
                    continue;
                }
            };
            tracing::info!(
                run_id = %run_id,
                step_index = run.current_step_index,
                "recovering workflow run"
            );
            let active = ActiveRun::new(run);
            if let Entry::Vacant(slot) = self.inner.active.entry(run_id) {
                slot.insert(Arc::clone(&active));
                self.spawn_driver(run_id, active, compiled, None);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn spawn_driver(
        &self,
        run_id: Uuid,
        active: Arc<ActiveRun>,
        compiled: Arc<CompiledWorkflow>,
        approved_step: Option<usize>,
    ) {
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("workflow_run", run_id = %run_id);
        tokio::spawn(
            async move { inner.drive(active, compiled, approved_step).await }.instrument(span),
        );
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl<R, D> Inner<R, D>
where
    R: RunRepository + 'static,
    D: DefinitionRepository + 'static,
{
    fn scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        self.scope_limits
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_scope)))
            .clone()
    }

    /// Persist, release the run, and wake waiters, in that order.
    async fn settle(&self, active: &ActiveRun, run: &mut WorkflowRun) {
        if let Err(e) = self.store.save(run).await {
            tracing::error!(run_id = %run.id, error = %e, "failed to persist settled run");
        }
        self.active.remove(&run.id);
        active.status_tx.send_replace(run.status);
    }

    async fn checkpoint(&self, run: &mut WorkflowRun) {
        if let Err(e) = self.store.save(run).await {
            tracing::error!(run_id = %run.id, error = %e, "checkpoint failed");
        }
    }

    async fn drive(
        &self,
        active: Arc<ActiveRun>,
        compiled: Arc<CompiledWorkflow>,
        approved_step: Option<usize>,
    ) {
        let scope = active.state.lock().await.scope.clone();
        let semaphore = self.scope_semaphore(&scope);
        let _permit = tokio::select! {
            biased;
            _ = active.cancel.cancelled() => return,
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    let mut run = active.state.lock().await;
                    run.status = RunStatus::Failed;
                    run.error = Some(RunError::new(ErrorKind::Internal, e.to_string()));
                    self.settle(&active, &mut run).await;
                    return;
                }
            },
        };

        let segment_start = Instant::now();
        let (base_active_ms, deadline) = {
            let mut run = active.state.lock().await;
            if run.status.is_terminal() {
                return;
            }
            if run.status != RunStatus::Running {
                run.status = RunStatus::Running;
                self.checkpoint(&mut run).await;
                active.status_tx.send_replace(RunStatus::Running);
            }
            let budget = run.definition.config.max_total_timeout_ms;
            let deadline = budget.map(|ms| {
                segment_start + Duration::from_millis(ms.saturating_sub(run.active_ms))
            });
            (run.active_ms, deadline)
        };
        let active_ms = || base_active_ms + segment_start.elapsed().as_millis() as u64;

        if let Some(index) = approved_step {
            let (ctx, output) = {
                let run = active.state.lock().await;
                let output = run.step_results.get(index).and_then(|r| r.output.clone());
                (RunContext::for_step(&run, index), output)
            };
            if let (Some(step), Some(output)) = (compiled.steps.get(index), output) {
                self.fire_linked_actions(&active, step, &ctx, &output, &scope).await;
            }
        }

        loop {
            let next = self
                .run_step(&active, &compiled, &scope, deadline, &active_ms)
                .await;
            if let Next::Stop = next {
                return;
            }
        }
    }

    /// Execute the step at the run's current index (with retries) and
    /// record the outcome.
    async fn run_step(
        &self,
        active: &ActiveRun,
        compiled: &CompiledWorkflow,
        scope: &str,
        deadline: Option<Instant>,
        active_ms: &impl Fn() -> u64,
    ) -> Next {
        let (run_id, index, step_def, ctx, error_strategy, mut attempt) = {
            let mut run = active.state.lock().await;
            if run.status.is_terminal() {
                return Next::Stop;
            }
            let index = run.current_step_index;
            if index >= run.definition.steps.len() {
                run.status = RunStatus::Completed;
                run.active_ms = active_ms();
                let steps_completed = run
                    .step_results
                    .iter()
                    .filter(|r| r.status == StepStatus::Completed)
                    .count() as u32;
                self.settle(active, &mut run).await;
                tracing::info!(run_id = %run.id, steps_completed, "workflow run completed");
                self.events.emit(EngineEvent::RunCompleted {
                    run_id: run.id,
                    workflow_name: run.workflow_name.clone(),
                    steps_completed,
                });
                return Next::Stop;
            }
            // A step interrupted by a crash keeps the attempts it already used.
            let attempt = match run.step_results[index].status {
                StepStatus::Running => run.step_results[index].attempts,
                _ => 0,
            };
            (
                run.id,
                index,
                run.definition.steps[index].clone(),
                RunContext::for_step(&run, index),
                run.definition.config.error_strategy,
                attempt,
            )
        };
        let Some(step) = compiled.steps.get(index) else {
            return self
                .fail_run(active, index, ErrorKind::Internal, "step missing from compiled plan", active_ms)
                .await;
        };

        if let Some(condition) = &step.condition {
            let run_it = match expression::evaluate(condition, &ctx.scope()) {
                Ok(value) => expression::is_truthy(&value),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, step_id = %step.id, error = %e, "condition failed to evaluate, skipping");
                    false
                }
            };
            if !run_it {
                let mut run = active.state.lock().await;
                if run.status.is_terminal() {
                    return Next::Stop;
                }
                let result = &mut run.step_results[index];
                result.status = StepStatus::Skipped;
                result.finished_at = Some(Utc::now());
                run.current_step_index = index + 1;
                run.active_ms = active_ms();
                self.checkpoint(&mut run).await;
                tracing::debug!(run_id = %run_id, step_id = %step.id, "step skipped");
                self.events.emit(EngineEvent::StepSkipped {
                    run_id,
                    step_id: step.id.clone(),
                });
                return Next::Advance;
            }
        }

        let retry_config = step_def.retry_config.as_ref();
        let step_timeout = step_def.timeout_ms().map(Duration::from_millis);
        loop {
            attempt += 1;
            let started = Instant::now();
            {
                let mut run = active.state.lock().await;
                if run.status.is_terminal() {
                    return Next::Stop;
                }
                let result = &mut run.step_results[index];
                result.status = StepStatus::Running;
                result.attempts = attempt;
                result.started_at.get_or_insert_with(Utc::now);
                run.active_ms = active_ms();
                self.checkpoint(&mut run).await;
            }
            self.events.emit(EngineEvent::StepStarted {
                run_id,
                step_id: step.id.clone(),
                step_type: step_def.kind.type_name().to_string(),
                attempt,
            });

            let step_ctx = StepContext {
                scope: scope.to_string(),
                session_id: None,
                run_id: Some(run_id),
                step_id: step.id.clone(),
                cancel: active.cancel.child_token(),
            };
            let execution = self.steps.run(&step_def.kind, step, &ctx, &step_ctx);
            let outcome = tokio::select! {
                biased;
                _ = active.cancel.cancelled() => Attempt::Cancelled,
                _ = sleep_until_opt(deadline) => Attempt::RunTimeout,
                result = async {
                    match step_timeout {
                        Some(limit) => tokio::time::timeout(limit, execution)
                            .await
                            .unwrap_or_else(|_| Err(StepError::timeout(format!(
                                "step exceeded {}ms",
                                limit.as_millis()
                            )))),
                        None => execution.await,
                    }
                } => Attempt::Done(result),
            };
            step_ctx.cancel.cancel();

            match outcome {
                // cancel() already recorded the terminal state.
                Attempt::Cancelled => return Next::Stop,
                Attempt::RunTimeout => {
                    self.events.emit(EngineEvent::StepFailed {
                        run_id,
                        step_id: step.id.clone(),
                        error: "run time budget exhausted".to_string(),
                        will_retry: false,
                    });
                    return self
                        .fail_run(active, index, ErrorKind::RunTimeout, "run exceeded max_total_timeout_ms", active_ms)
                        .await;
                }
                Attempt::Done(Ok(StepOutcome::Completed(output))) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    return self
                        .complete_step(active, step, &ctx, output, duration_ms, scope, active_ms)
                        .await;
                }
                Attempt::Done(Ok(StepOutcome::Suspend { prompt })) => {
                    return self.pause(active, index, &step.id, prompt, active_ms).await;
                }
                Attempt::Done(Err(err)) => {
                    let will_retry = RetryHandler::should_retry(retry_config, attempt, err.kind);
                    tracing::warn!(
                        run_id = %run_id,
                        step_id = %step.id,
                        attempt,
                        will_retry,
                        error = %err,
                        "step attempt failed"
                    );
                    self.events.emit(EngineEvent::StepFailed {
                        run_id,
                        step_id: step.id.clone(),
                        error: err.to_string(),
                        will_retry,
                    });

                    if will_retry {
                        {
                            let mut run = active.state.lock().await;
                            if run.status.is_terminal() {
                                return Next::Stop;
                            }
                            run.step_results[index].error =
                                Some(RunError::new(error_kind_for(err.kind), err.message.clone()));
                            run.active_ms = active_ms();
                            self.checkpoint(&mut run).await;
                        }
                        tokio::select! {
                            biased;
                            _ = active.cancel.cancelled() => return Next::Stop,
                            _ = sleep_until_opt(deadline) => {
                                return self
                                    .fail_run(active, index, ErrorKind::RunTimeout, "run exceeded max_total_timeout_ms", active_ms)
                                    .await;
                            }
                            _ = tokio::time::sleep(RetryHandler::delay(retry_config)) => {}
                        }
                        continue;
                    }

                    return match error_strategy {
                        ErrorStrategy::FailFast => {
                            let message = format!("step '{}' failed: {}", step.id, err.message);
                            self.fail_run(active, index, error_kind_for(err.kind), &message, active_ms)
                                .await
                        }
                        ErrorStrategy::Continue => {
                            let mut run = active.state.lock().await;
                            if run.status.is_terminal() {
                                return Next::Stop;
                            }
                            let result = &mut run.step_results[index];
                            result.status = StepStatus::Failed;
                            result.error =
                                Some(RunError::new(error_kind_for(err.kind), err.message.clone()));
                            result.finished_at = Some(Utc::now());
                            run.current_step_index = index + 1;
                            run.active_ms = active_ms();
                            self.checkpoint(&mut run).await;
                            Next::Advance
                        }
                    };
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_step(
        &self,
        active: &ActiveRun,
        step: &CompiledStep,
        ctx: &RunContext,
        output: Value,
        duration_ms: u64,
        scope: &str,
        active_ms: &impl Fn() -> u64,
    ) -> Next {
        // A result that lands after cancellation is discarded.
        if active.cancel.is_cancelled() {
            return Next::Stop;
        }
        let output = cap_output(&step.id, output);
        self.fire_linked_actions(active, step, ctx, &output, scope).await;

        let mut run = active.state.lock().await;
        if run.status.is_terminal() {
            return Next::Stop;
        }
        let index = run.current_step_index;
        let result = &mut run.step_results[index];
        result.status = StepStatus::Completed;
        result.output = Some(output);
        result.error = None;
        result.finished_at = Some(Utc::now());
        run.current_step_index = index + 1;
        run.active_ms = active_ms();
        self.checkpoint(&mut run).await;

        tracing::debug!(run_id = %run.id, step_id = %step.id, duration_ms, "step completed");
        self.events.emit(EngineEvent::StepCompleted {
            run_id: run.id,
            step_id: step.id.clone(),
            duration_ms,
        });
        Next::Advance
    }

    /// Render and hand off a step's linked actions. Failures are logged and
    /// reported as events; they never fail the step.
    async fn fire_linked_actions(
        &self,
        active: &ActiveRun,
        step: &CompiledStep,
        ctx: &RunContext,
        output: &Value,
        scope: &str,
    ) {
        if step.actions.is_empty() {
            return;
        }
        let run_id = active.state.lock().await.id;
        let action_ctx = ActionContext {
            scope: scope.to_string(),
            run_id,
            step_id: step.id.clone(),
        };
        let action_scope = ctx.scope_with_prev(output);
        for compiled in &step.actions {
            let outcome = match compiled.render(&action_scope) {
                Ok(action) => self
                    .actions
                    .handle(&action, &action_ctx)
                    .await
                    .map_err(|e| (action.type_name(), e.to_string())),
                Err(e) => Err(("render", e.to_string())),
            };
            if let Err((action, error)) = outcome {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    action,
                    error = %error,
                    "linked action failed"
                );
                self.events.emit(EngineEvent::LinkedActionFailed {
                    run_id,
                    step_id: step.id.clone(),
                    action: action.to_string(),
                    error,
                });
            }
        }
    }

    async fn pause(
        &self,
        active: &ActiveRun,
        index: usize,
        step_id: &str,
        prompt: String,
        active_ms: &impl Fn() -> u64,
    ) -> Next {
        let mut run = active.state.lock().await;
        if run.status.is_terminal() {
            return Next::Stop;
        }
        run.step_results[index].status = StepStatus::WaitingApproval;
        run.step_results[index].output = Some(json!({ "prompt": prompt.clone() }));
        run.status = RunStatus::Paused;
        run.resume_token = Some(Uuid::new_v4().simple().to_string());
        run.active_ms = active_ms();
        self.settle(active, &mut run).await;

        tracing::info!(run_id = %run.id, step_id, "run paused for approval");
        self.events.emit(EngineEvent::RunPaused {
            run_id: run.id,
            step_id: step_id.to_string(),
            prompt,
        });
        Next::Stop
    }

    async fn fail_run(
        &self,
        active: &ActiveRun,
        index: usize,
        kind: ErrorKind,
        message: &str,
        active_ms: &impl Fn() -> u64,
    ) -> Next {
        let mut run = active.state.lock().await;
        if run.status.is_terminal() {
            return Next::Stop;
        }
        if let Some(result) = run.step_results.get_mut(index) {
            result.status = StepStatus::Failed;
            result.error = Some(RunError::new(kind, message));
            result.finished_at = Some(Utc::now());
        }
        run.status = RunStatus::Failed;
        run.error = Some(RunError::new(kind, message));
        run.active_ms = active_ms();
        self.settle(active, &mut run).await;

        tracing::warn!(run_id = %run.id, kind = %kind, error = message, "workflow run failed");
        self.events.emit(EngineEvent::RunFailed {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            error: message.to_string(),
        });
        Next::Stop
    }
}

fn error_kind_for(kind: FailureKind) -> ErrorKind {
    match kind {
        FailureKind::Failed => ErrorKind::StepFailed,
        FailureKind::Timeout => ErrorKind::StepTimeout,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, NullSink};
    use crate::repository::memory::{InMemoryDefinitionRepository, InMemoryRunRepository};
    use crate::workflow::actions::{ActionError, LoggingActionHandler};
    use crate::workflow::definition::parse_workflow_yaml;
    use crate::workflow::step_runner::{AgentExecutor, AgentInvocation, AgentOutput};
    use prizm_types::workflow::{LinkedAction, TriggerType};
    use std::future::Future;
    use std::pin::Pin;
    use prizm_types::error::RepositoryError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    type Behavior = Box<dyn Fn(&AgentInvocation, u32) -> Result<Value, StepError> + Send + Sync>;

    /// Agent double: sleeps for `delay`, then applies `behavior` to the call.
    struct ScriptedAgent {
        calls: AtomicU32,
        delay: Duration,
        behavior: Behavior,
    }

    impl ScriptedAgent {
        fn new(
            delay: Duration,
            behavior: impl Fn(&AgentInvocation, u32) -> Result<Value, StepError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                delay,
                behavior: Box::new(behavior),
            })
        }

        fn echo() -> Arc<Self> {
            Self::new(Duration::ZERO, |inv, _| Ok(json!({ "text": inv.prompt })))
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AgentExecutor for ScriptedAgent {
        fn execute<'a>(
            &'a self,
            invocation: AgentInvocation,
            ctx: &'a StepContext,
        ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, StepError>> + Send + 'a>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(StepError::failed("cancelled")),
                    _ = tokio::time::sleep(self.delay) => {}
                }
                (self.behavior)(&invocation, call).map(|output| AgentOutput {
                    output,
                    session_id: None,
                })
            })
        }
    }

    /// Action handler that fails every `notify` and records the rest.
    #[derive(Default)]
    struct FlakyActions {
        handled: std::sync::Mutex<Vec<LinkedAction>>,
    }

    impl LinkedActionHandler for FlakyActions {
        fn handle<'a>(
            &'a self,
            action: &'a LinkedAction,
            _ctx: &'a ActionContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
            Box::pin(async move {
                if let LinkedAction::Notify { .. } = action {
                    return Err(ActionError::Failed("notifier offline".to_string()));
                }
                self.handled.lock().unwrap().push(action.clone());
                Ok(())
            })
        }
    }

    type TestRunner = WorkflowRunner<InMemoryRunRepository, InMemoryDefinitionRepository>;

    fn runner_with(
        agent: Arc<dyn AgentExecutor>,
        actions: Arc<dyn LinkedActionHandler>,
    ) -> (TestRunner, EventBus) {
        let bus = EventBus::new(256);
        let runner = WorkflowRunner::new(
            InMemoryRunRepository::new(),
            Arc::new(WorkflowRegistry::new(InMemoryDefinitionRepository::new())),
            StepRunner::new(agent),
            actions,
            Arc::new(bus.clone()),
            &EngineConfig::default(),
        );
        (runner, bus)
    }

    fn runner(agent: Arc<dyn AgentExecutor>) -> TestRunner {
        runner_with(agent, Arc::new(LoggingActionHandler)).0
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    const WAIT: Duration = Duration::from_secs(5);

    const DIGEST: &str = r#"
name: digest
args:
  topic: {}
steps:
  - id: gather
    type: agent
    prompt: "Collect notes about $args.topic"
  - id: shape
    type: transform
    transform: "{ title: $args.topic|upper, body: $gather.text }"
"#;

    #[tokio::test]
    async fn test_sequential_run_completes_with_outputs() {
        let runner = runner(ScriptedAgent::echo());
        let def = parse_workflow_yaml(DIGEST).unwrap();
        let run_id = runner
            .start("notes", def, StartOptions::with_args(args(json!({"topic": "rust"}))))
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step_index, 2);
        assert_eq!(
            run.step_output("shape"),
            Some(&json!({"title": "RUST", "body": "Collect notes about rust"}))
        );
        assert_eq!(runner.active_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_required_arg_rejected() {
        let runner = runner(ScriptedAgent::echo());
        let def = parse_workflow_yaml(DIGEST).unwrap();
        let err = runner
            .start("notes", def, StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::MissingArg(name) if name == "topic"));
        assert!(runner
            .list_runs("notes", &RunFilter::default(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_resolve_args_fills_defaults() {
        let def = parse_workflow_yaml(
            "name: d\nargs:\n  limit:\n    default: 5\nsteps:\n  - id: a\n    type: transform\n    transform: \"$args.limit\"\n",
        )
        .unwrap();
        let resolved = resolve_args(&def, args(json!({"extra": true}))).unwrap();
        assert_eq!(resolved.get("limit"), Some(&json!(5)));
        assert_eq!(resolved.get("extra"), Some(&json!(true)));
    }

    const APPROVAL: &str = r#"
name: publish
steps:
  - id: draft
    type: transform
    transform: "{ text: 'hello' }"
  - id: confirm
    type: approve
    approve_prompt: "Publish {{ $draft.text }}?"
  - id: ship
    type: transform
    transform: "{ shipped: $confirm.approved, text: $draft.text }"
"#;

    async fn paused_run(runner: &TestRunner) -> WorkflowRun {
        let def = parse_workflow_yaml(APPROVAL).unwrap();
        let run_id = runner.start("notes", def, StartOptions::default()).await.unwrap();
        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        run
    }

    #[tokio::test]
    async fn test_pause_and_approve() {
        let (runner, bus) = runner_with(ScriptedAgent::echo(), Arc::new(LoggingActionHandler));
        let mut events = bus.subscribe();
        let paused = paused_run(&runner).await;

        assert_eq!(paused.current_step_index, 1);
        assert_eq!(paused.step_results[1].status, StepStatus::WaitingApproval);
        assert_eq!(paused.step_output("confirm"), Some(&json!({"prompt": "Publish hello?"})));
        let token = paused.resume_token.clone().unwrap();

        let resumed = runner.resume(&token, true).await.unwrap();
        assert!(resumed.resume_token.is_none());
        assert_eq!(resumed.step_output("confirm"), Some(&json!({"approved": true})));

        let done = runner.wait_settled(paused.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(
            done.step_output("ship"),
            Some(&json!({"shipped": true, "text": "hello"}))
        );

        let mut saw_prompt = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::RunPaused { prompt, .. } = event {
                assert_eq!(prompt, "Publish hello?");
                saw_prompt = true;
            }
        }
        assert!(saw_prompt);
    }

    #[tokio::test]
    async fn test_resume_token_is_single_use() {
        let runner = runner(ScriptedAgent::echo());
        let paused = paused_run(&runner).await;
        let token = paused.resume_token.clone().unwrap();

        runner.resume(&token, true).await.unwrap();
        let again = runner.resume(&token, true).await.unwrap_err();
        assert!(matches!(again, RunnerError::InvalidToken));
        assert!(matches!(
            runner.resume("not-a-token", true).await.unwrap_err(),
            RunnerError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn test_concurrent_resume_only_one_wins() {
        let runner = runner(ScriptedAgent::echo());
        let paused = paused_run(&runner).await;
        let token = paused.resume_token.clone().unwrap();

        let (a, b) = tokio::join!(runner.resume(&token, true), runner.resume(&token, true));
        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);
        let loser = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
        assert!(matches!(
            loser,
            RunnerError::InvalidToken | RunnerError::ConcurrentAccess(_)
        ));
    }

    #[tokio::test]
    async fn test_denied_approval_cancels_run() {
        let runner = runner(ScriptedAgent::echo());
        let paused = paused_run(&runner).await;
        let token = paused.resume_token.clone().unwrap();

        let denied = runner.resume(&token, false).await.unwrap();
        assert_eq!(denied.status, RunStatus::Cancelled);
        assert_eq!(denied.error.as_ref().map(|e| e.kind), Some(ErrorKind::Denied));
        assert!(denied.resume_token.is_none());

        let stored = runner.get_run(paused.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert_eq!(stored.step_results[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_paused_run_clears_token() {
        let runner = runner(ScriptedAgent::echo());
        let paused = paused_run(&runner).await;
        let token = paused.resume_token.clone().unwrap();

        assert!(runner.cancel(paused.id).await.unwrap());
        let stored = runner.get_run(paused.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(stored.resume_token.is_none());
        assert!(matches!(
            runner.resume(&token, true).await.unwrap_err(),
            RunnerError::InvalidToken
        ));
        assert!(!runner.cancel(paused.id).await.unwrap());
        assert!(matches!(
            runner.cancel(Uuid::now_v7()).await.unwrap_err(),
            RunnerError::RunNotFound(_)
        ));
    }

    /// Lets a test stop the next `get_run` until it is released.
    #[derive(Default)]
    struct ReadGate {
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    struct GatedRunRepository {
        inner: InMemoryRunRepository,
        gate: Arc<ReadGate>,
    }

    impl RunRepository for GatedRunRepository {
        async fn save_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
            self.inner.save_run(run).await
        }

        async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
            if self.gate.hold.swap(false, Ordering::SeqCst) {
                self.gate.entered.notify_one();
                self.gate.release.notified().await;
            }
            self.inner.get_run(id).await
        }

        async fn get_run_by_token(&self, token: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
            self.inner.get_run_by_token(token).await
        }

        async fn list_runs(
            &self,
            scope: &str,
            filter: &RunFilter,
            limit: u32,
        ) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_runs(scope, filter, limit).await
        }

        async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
            self.inner.list_unfinished_runs().await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_resume_reread_is_serialized() {
        let gate = Arc::new(ReadGate::default());
        let runner = WorkflowRunner::new(
            GatedRunRepository {
                inner: InMemoryRunRepository::new(),
                gate: Arc::clone(&gate),
            },
            Arc::new(WorkflowRegistry::new(InMemoryDefinitionRepository::new())),
            StepRunner::new(ScriptedAgent::echo()),
            Arc::new(LoggingActionHandler),
            Arc::new(NullSink),
            &EngineConfig::default(),
        );
        let def = parse_workflow_yaml(APPROVAL).unwrap();
        let run_id = runner.start("notes", def, StartOptions::default()).await.unwrap();
        let paused = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        let token = paused.resume_token.clone().unwrap();

        // Stop the resume inside its re-read, then cancel while it waits.
        gate.hold.store(true, Ordering::SeqCst);
        let resumer = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.resume(&token, true).await })
        };
        gate.entered.notified().await;
        let canceller = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.cancel(run_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.release.notify_one();

        let resumed = resumer.await.unwrap();
        let cancelled = canceller.await.unwrap().unwrap();
        let run = runner.wait_settled(run_id, WAIT).await.unwrap();

        assert!(run.status.is_terminal(), "run left {}", run.status);
        assert!(run.resume_token.is_none());
        assert_eq!(runner.active_count(), 0);
        if cancelled {
            assert_eq!(run.status, RunStatus::Cancelled);
        } else {
            assert!(resumed.is_ok());
            assert_eq!(run.status, RunStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_cancel_running_run_discards_late_result() {
        let agent = ScriptedAgent::new(Duration::from_millis(300), |_, _| Ok(json!("late")));
        let runner = runner(agent.clone());
        let def = parse_workflow_yaml(DIGEST).unwrap();
        let run_id = runner
            .start("notes", def, StartOptions::with_args(args(json!({"topic": "x"}))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runner.cancel(run_id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(400)).await;

        let run = runner.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.step_output("gather").is_none());
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::Cancelled));
    }

    const RETRYING: &str = r#"
name: flaky
steps:
  - id: call
    type: agent
    prompt: "try"
    retry_config:
      max_retries: 2
      retry_delay_ms: 5
      retry_on: [failed]
"#;

    #[tokio::test]
    async fn test_retry_runs_at_most_max_retries_plus_one() {
        let agent = ScriptedAgent::new(Duration::ZERO, |_, _| Err(StepError::failed("boom")));
        let runner = runner(agent.clone());
        let def = parse_workflow_yaml(RETRYING).unwrap();
        let run_id = runner.start("s", def, StartOptions::default()).await.unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(agent.calls(), 3);
        assert_eq!(run.step_results[0].attempts, 3);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::StepFailed));
    }

    #[tokio::test]
    async fn test_retry_recovers_on_later_attempt() {
        let agent = ScriptedAgent::new(Duration::ZERO, |_, call| {
            if call < 2 {
                Err(StepError::failed("transient"))
            } else {
                Ok(json!("ok"))
            }
        });
        let runner = runner(agent.clone());
        let def = parse_workflow_yaml(RETRYING).unwrap();
        let run_id = runner.start("s", def, StartOptions::default()).await.unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(agent.calls(), 2);
        assert_eq!(run.step_output("call"), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn test_step_timeout_is_retryable_kind() {
        let yaml = r#"
name: slow
steps:
  - id: call
    type: agent
    prompt: "wait"
    timeout_ms: 20
    retry_config:
      max_retries: 1
      retry_delay_ms: 0
      retry_on: [timeout]
"#;
        let agent = ScriptedAgent::new(Duration::from_millis(200), |_, _| Ok(json!("slow")));
        let runner = runner(agent.clone());
        let run_id = runner
            .start("s", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(agent.calls(), 2);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::StepTimeout));
    }

    #[tokio::test]
    async fn test_run_timeout_is_not_retried() {
        let yaml = r#"
name: budget
config:
  max_total_timeout_ms: 50
steps:
  - id: call
    type: agent
    prompt: "wait"
    retry_config:
      max_retries: 3
      retry_delay_ms: 0
      retry_on: [failed, timeout]
"#;
        let agent = ScriptedAgent::new(Duration::from_millis(500), |_, _| Ok(json!("slow")));
        let runner = runner(agent.clone());
        let run_id = runner
            .start("s", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(ErrorKind::RunTimeout));
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_continue_strategy_and_conditions() {
        let yaml = r#"
name: tolerant
config:
  error_strategy: continue
steps:
  - id: broken
    type: agent
    prompt: "fail"
  - id: gated
    type: transform
    condition: "$broken.text == 'x'"
    transform: "'never'"
  - id: last
    type: transform
    transform: "{ saw_prev: $prev }"
"#;
        let agent = ScriptedAgent::new(Duration::ZERO, |_, _| Err(StepError::failed("down")));
        let runner = runner(agent);
        let run_id = runner
            .start("s", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step_results[0].status, StepStatus::Failed);
        assert_eq!(run.step_results[1].status, StepStatus::Skipped);
        assert_eq!(run.step_output("last"), Some(&json!({"saw_prev": null})));
    }

    #[tokio::test]
    async fn test_linked_action_failure_does_not_fail_step() {
        let yaml = r#"
name: actions
steps:
  - id: draft
    type: transform
    transform: "{ title: 'Weekly review' }"
    linked_actions:
      - type: notify
        message: "drafted {{ $prev.title }}"
      - type: create_todo
        list: inbox
        title: "Follow up on {{ $prev.title }}"
"#;
        let actions = Arc::new(FlakyActions::default());
        let (runner, bus) = runner_with(ScriptedAgent::echo(), actions.clone());
        let mut events = bus.subscribe();
        let run_id = runner
            .start("s", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let handled = actions.handled.lock().unwrap().clone();
        assert_eq!(
            handled,
            vec![LinkedAction::CreateTodo {
                list: Some("inbox".to_string()),
                title: "Follow up on Weekly review".to_string(),
            }]
        );

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::LinkedActionFailed { action, .. } = event {
                assert_eq!(action, "notify");
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_start_by_name_and_dispatch_event() {
        let runner = runner(ScriptedAgent::echo());
        let yaml = r#"
name: on-done
args:
  source: {}
steps:
  - id: note
    type: transform
    transform: "{ from: $args.source }"
triggers:
  - type: todo_completed
    args:
      source: trigger
"#;
        runner
            .registry()
            .register_def("s", "on-done", yaml, None, None)
            .await
            .unwrap();

        let manual = runner
            .start_by_name("s", "on-done", StartOptions::with_args(args(json!({"source": "cli"}))))
            .await
            .unwrap();
        assert_eq!(
            runner.wait_settled(manual, WAIT).await.unwrap().step_output("note"),
            Some(&json!({"from": "cli"}))
        );

        let event = TriggerEvent::new(TriggerType::TodoCompleted, json!({"title": "x"}));
        let started = runner.dispatch_event("s", &event).await.unwrap();
        assert_eq!(started.len(), 1);
        let run = runner.wait_settled(started[0], WAIT).await.unwrap();
        assert_eq!(run.trigger_type, "todo_completed");
        assert_eq!(run.step_output("note"), Some(&json!({"from": "trigger"})));

        assert!(matches!(
            runner
                .start_by_name("s", "missing", StartOptions::default())
                .await
                .unwrap_err(),
            RunnerError::UnknownWorkflow(_)
        ));
    }

    #[tokio::test]
    async fn test_recover_restarts_interrupted_run() {
        let runner = runner(ScriptedAgent::echo());
        let def = parse_workflow_yaml(DIGEST).unwrap();
        let mut orphan = WorkflowRun::new("notes", def, args(json!({"topic": "crash"})), "manual");
        orphan.status = RunStatus::Running;
        orphan.step_results[0].status = StepStatus::Running;
        orphan.step_results[0].attempts = 1;
        runner.store().save(&mut orphan).await.unwrap();

        assert_eq!(runner.recover().await.unwrap(), 1);
        let run = runner.wait_settled(orphan.id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.step_results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_status() {
        let runner = runner(ScriptedAgent::echo());
        paused_run(&runner).await;
        let def = parse_workflow_yaml(DIGEST).unwrap();
        let done = runner
            .start("notes", def, StartOptions::with_args(args(json!({"topic": "a"}))))
            .await
            .unwrap();
        runner.wait_settled(done, WAIT).await.unwrap();

        let paused = RunFilter {
            workflow_name: None,
            status: Some(RunStatus::Paused),
        };
        let listed = runner.list_runs("notes", &paused, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].workflow_name, "publish");
        assert_eq!(
            runner
                .list_runs("notes", &RunFilter::default(), 50)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_fetch_format_confirm_pauses_then_completes_once() {
        let yaml = r#"
name: briefing
steps:
  - id: fetch
    type: agent
    prompt: "Fetch today's headlines"
  - id: format
    type: transform
    transform: "{ summary: $fetch.text|upper }"
  - id: confirm
    type: approve
    approve_prompt: "Send {{ $format.summary }}?"
"#;
        let runner = runner(ScriptedAgent::echo());
        let run_id = runner
            .start("desk", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let paused = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(paused.current_step_index, 2);
        assert_eq!(
            paused.step_output("format"),
            Some(&json!({"summary": "FETCH TODAY'S HEADLINES"}))
        );
        let token = paused.resume_token.clone().unwrap();

        runner.resume(&token, true).await.unwrap();
        let done = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.resume_token.is_none());
        assert!(done.step_results.iter().all(|r| r.status == StepStatus::Completed));

        let again = runner.resume(&token, true).await;
        assert!(matches!(again, Err(RunnerError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_continue_past_failed_middle_step() {
        let yaml = r#"
name: resilient
config:
  error_strategy: continue
steps:
  - id: first
    type: transform
    transform: "{ n: 1 }"
  - id: middle
    type: agent
    prompt: "this one breaks"
  - id: last
    type: transform
    transform: "{ n: $first.n, middle: $middle }"
"#;
        let agent = ScriptedAgent::new(Duration::ZERO, |_, _| Err(StepError::failed("boom")));
        let runner = runner(agent);
        let run_id = runner
            .start("s", parse_workflow_yaml(yaml).unwrap(), StartOptions::default())
            .await
            .unwrap();

        let run = runner.wait_settled(run_id, WAIT).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.error.is_none());
        assert_eq!(run.step_results[1].status, StepStatus::Failed);
        assert_eq!(run.step_output("last"), Some(&json!({"n": 1, "middle": null})));
    }
}
