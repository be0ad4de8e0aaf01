use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::activation::{ActivationService, DbStatusStore};
use crate::ai_client::{AiClient, AiInvoker};
use crate::config::FleetConfig;
use crate::database::FleetDatabase;
use crate::events::{EventBus, FleetEvent};
use crate::fleet::pages::{FsPageSink, NullPageSink, PageSink};
use crate::fleet::tasks::TaskRegistry;
use crate::fleet::FleetManager;
use crate::scheduler::{FleetScheduler, SchedulerCommand, SchedulerTiming};

/// Wired-up fleet backend: database, roster manager, activation service and
/// the (not yet running) scheduler actor.
pub struct FleetRuntime {
    pub config: FleetConfig,
    pub db: Arc<FleetDatabase>,
    pub manager: Arc<FleetManager>,
    pub activation: Arc<ActivationService>,
    pub command_tx: flume::Sender<SchedulerCommand>,
    scheduler: Option<FleetScheduler>,
}

impl FleetRuntime {
    pub fn bootstrap(config: FleetConfig, event_tx: flume::Sender<FleetEvent>) -> Result<Self> {
        let db = Arc::new(
            FleetDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database '{}'", config.database_path))?,
        );

        let invoker: Arc<dyn AiInvoker> = Arc::new(AiClient::new(
            config.ai_api_url.clone(),
            config.ai_api_key.clone(),
            config.ai_model.clone(),
        ));

        let pages: Arc<dyn PageSink> = match &config.page_output_dir {
            Some(dir) => {
                tracing::info!("Page sink enabled: {}", dir);
                Arc::new(FsPageSink::new(dir))
            }
            None => Arc::new(NullPageSink),
        };

        let events = EventBus::new(event_tx);
        let registry = TaskRegistry::with_ai(invoker.clone());
        let manager = Arc::new(FleetManager::new(
            registry,
            invoker.clone(),
            db.clone(),
            events.clone(),
            pages,
        ));

        let activation = Arc::new(ActivationService::new(Arc::new(DbStatusStore::new(
            db.clone(),
        ))));

        let (command_tx, command_rx) = flume::unbounded();
        let scheduler = FleetScheduler::new(
            manager.clone(),
            activation.clone(),
            invoker,
            db.clone(),
            events,
            SchedulerTiming::from_config(&config),
            command_rx,
        );

        Ok(Self {
            config,
            db,
            manager,
            activation,
            command_tx,
            scheduler: Some(scheduler),
        })
    }

    /// Start the scheduler actor. Callable once per runtime.
    pub fn spawn_scheduler(&mut self) -> Result<JoinHandle<()>> {
        let scheduler = self
            .scheduler
            .take()
            .context("Scheduler already spawned")?;
        Ok(tokio::spawn(scheduler.run()))
    }
}
