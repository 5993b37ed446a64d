//! Application state wiring the engine to its infrastructure.
//!
//! AppState holds the durable controller used by both the CLI and the REST
//! API. The controller is generic over its backend; AppState pins it to the
//! SQLite-journaled durable backend. In-process controllers for one-off CLI
//! runs share the same task registry.

use std::path::PathBuf;
use std::sync::Arc;

use stagecraft_core::backend::durable::DurableBackend;
use stagecraft_core::backend::in_process::InProcessBackend;
use stagecraft_core::controller::{ControllerConfig, WorkflowController};
use stagecraft_core::task::registry::TaskRegistry;
use stagecraft_infra::config::{load_engine_config, resolve_data_dir};
use stagecraft_infra::sqlite::pool::{DatabasePool, default_database_url};
use stagecraft_infra::sqlite::run::SqliteRunRepository;
use stagecraft_types::config::EngineConfig;

use crate::tasks::build_registry;

/// Durable backend pinned to SQLite.
pub type ConcreteBackend = DurableBackend<SqliteRunRepository>;

pub type ConcreteController = WorkflowController<ConcreteBackend>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ConcreteController>,
    pub runs: Arc<SqliteRunRepository>,
    pub registry: Arc<TaskRegistry>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, open the database and
    /// wire the controller.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&default_database_url()).await?;
        Self::from_parts(db_pool, config, data_dir)
    }

    pub fn from_parts(
        db_pool: DatabasePool,
        config: EngineConfig,
        data_dir: PathBuf,
    ) -> anyhow::Result<Self> {
        let runs = Arc::new(SqliteRunRepository::new(db_pool));
        let registry = Arc::new(build_registry(&config)?);
        let backend = Arc::new(DurableBackend::new(Arc::clone(&runs)));
        let controller = WorkflowController::new(
            backend,
            Arc::clone(&registry),
            ControllerConfig::from(&config),
        );

        Ok(Self {
            controller: Arc::new(controller),
            runs,
            registry,
            config: Arc::new(config),
            data_dir,
        })
    }

    /// A controller over the in-process backend. Nothing it runs is persisted.
    pub fn in_process_controller(&self) -> WorkflowController<InProcessBackend> {
        WorkflowController::new(
            Arc::new(InProcessBackend::new()),
            Arc::clone(&self.registry),
            ControllerConfig::from(self.config.as_ref()),
        )
    }

    /// Override the concurrency limit of future runs.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        let mut config = (*self.config).clone();
        config.max_concurrency = max_concurrency.max(1);
        let controller = WorkflowController::new(
            Arc::clone(self.controller.backend()),
            Arc::clone(&self.registry),
            ControllerConfig::from(&config),
        );
        self.controller = Arc::new(controller);
        self.config = Arc::new(config);
        self
    }
}
