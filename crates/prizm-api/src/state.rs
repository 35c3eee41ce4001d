//! Application state wiring the engine to its SQLite stores.
//!
//! The runner and task runner are generic over repository traits; AppState
//! pins them to the concrete infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use prizm_core::event::{EventBus, EventSink};
use prizm_core::task::TaskRunner;
use prizm_core::workflow::actions::LoggingActionHandler;
use prizm_core::workflow::registry::WorkflowRegistry;
use prizm_core::workflow::runner::WorkflowRunner;
use prizm_core::workflow::step_runner::{AgentExecutor, StepRunner, UnconfiguredAgentExecutor};
use prizm_core::workflow::tools::WorkflowTools;
use prizm_infra::agent::HttpAgentExecutor;
use prizm_infra::config::load_engine_config;
use prizm_infra::sqlite::pool::database_url;
use prizm_infra::sqlite::{DatabasePool, SqliteDefinitionRepository, SqliteRunRepository};
use prizm_types::config::EngineConfig;

pub type ConcreteRunner = WorkflowRunner<SqliteRunRepository, SqliteDefinitionRepository>;

#[derive(Clone)]
pub struct AppState {
    pub runner: ConcreteRunner,
    pub tasks: TaskRunner,
    pub events: EventBus,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database under `data_dir`, load `config.toml`, and wire the
    /// runner and task runner.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        let agent: Arc<dyn AgentExecutor> = match &config.agent.endpoint {
            Some(_) => Arc::new(
                HttpAgentExecutor::from_config(&config.agent)
                    .context("failed to build agent client")?,
            ),
            None => {
                tracing::debug!("no agent endpoint configured; agent steps will fail");
                Arc::new(UnconfiguredAgentExecutor)
            }
        };
        let steps = StepRunner::new(agent);
        let events = EventBus::new(config.event_capacity);
        let sink: Arc<dyn EventSink> = Arc::new(events.clone());

        let registry = Arc::new(WorkflowRegistry::new(SqliteDefinitionRepository::new(
            db_pool.clone(),
        )));
        let runner = WorkflowRunner::new(
            SqliteRunRepository::new(db_pool),
            registry,
            steps.clone(),
            Arc::new(LoggingActionHandler),
            Arc::clone(&sink),
            &config,
        );
        let tasks = TaskRunner::new(steps, sink, &config);

        Ok(Self {
            runner,
            tasks,
            events,
            config,
            data_dir,
        })
    }

    pub fn tools(&self) -> WorkflowTools<SqliteRunRepository, SqliteDefinitionRepository> {
        WorkflowTools::new(self.runner.clone(), self.tasks.clone())
    }
}
