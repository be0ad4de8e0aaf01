use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};

use crate::activation::{ActivationReason, ActivationService};
use crate::ai_client::AiInvoker;
use crate::config::FleetConfig;
use crate::database::{AgentLogRow, FleetDatabase};
use crate::events::{EventBus, FleetEvent};
use crate::fleet::{FleetManager, SystemMode};

/// Manual requests from the HTTP layer. Routing them through the scheduler
/// actor keeps roster mutation single-writer.
#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    Activate(ActivationReason),
    Deactivate,
    DispatchAgent(String),
    Reinitialize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDisposition {
    Continue,
    /// Activation record absent or inactive; stop ticking until reactivated.
    Stop,
}

#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    pub auto_activate: bool,
    pub cycle_interval: Duration,
    pub agent_pause: Duration,
    pub testing_interval: ChronoDuration,
    pub activation_delay: Duration,
    pub initial_testing_delay: Duration,
}

impl SchedulerTiming {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            auto_activate: config.auto_activate,
            cycle_interval: Duration::from_secs(config.cycle_interval_secs.max(1)),
            agent_pause: Duration::from_millis(config.agent_pause_ms),
            testing_interval: ChronoDuration::minutes(config.testing_interval_mins.max(1) as i64),
            activation_delay: Duration::from_millis(config.activation_delay_ms),
            initial_testing_delay: Duration::from_secs(config.initial_testing_delay_secs),
        }
    }
}

/// The single scheduler actor. Exactly one of these runs per process; the
/// tick loop and all manual commands are serialized through one `select!`,
/// so no two dispatches of the same agent can race.
pub struct FleetScheduler {
    manager: Arc<FleetManager>,
    activation: Arc<ActivationService>,
    invoker: Arc<dyn AiInvoker>,
    db: Arc<FleetDatabase>,
    events: EventBus,
    timing: SchedulerTiming,
    commands: flume::Receiver<SchedulerCommand>,
}

impl FleetScheduler {
    pub fn new(
        manager: Arc<FleetManager>,
        activation: Arc<ActivationService>,
        invoker: Arc<dyn AiInvoker>,
        db: Arc<FleetDatabase>,
        events: EventBus,
        timing: SchedulerTiming,
        commands: flume::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            manager,
            activation,
            invoker,
            db,
            events,
            timing,
            commands,
        }
    }

    pub async fn run(self) {
        let mut ticking = false;
        let mut initial_testing_at: Option<Instant> = None;

        if self.timing.auto_activate {
            // The console flips itself on shortly after start; manual
            // deactivation afterwards is the only off switch.
            sleep(self.timing.activation_delay).await;
            if self.activate(ActivationReason::Auto).await {
                ticking = true;
                initial_testing_at = Some(Instant::now() + self.timing.initial_testing_delay);
            }
        } else if self.persisted_record_is_running() {
            // A durable record survives restarts; a previously activated
            // fleet picks the loop back up without a new activate command.
            tracing::info!("Resuming activated fleet from persisted record");
            self.manager.set_mode(SystemMode::Autonomous).await;
            ticking = true;
            initial_testing_at = Some(Instant::now() + self.timing.initial_testing_delay);
        }

        let mut ticker = tokio::time::interval(self.timing.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if ticking => {
                    match self.run_cycle().await {
                        Ok(CycleDisposition::Continue) => {}
                        Ok(CycleDisposition::Stop) => {
                            tracing::info!(
                                "Continuous loop going dormant: activation record absent or inactive"
                            );
                            ticking = false;
                        }
                        Err(e) => {
                            tracing::warn!("Operation cycle error (continuing): {}", e);
                        }
                    }
                }
                _ = sleep_until(initial_testing_at.unwrap_or_else(Instant::now)), if initial_testing_at.is_some() => {
                    initial_testing_at = None;
                    self.run_initial_testing().await;
                }
                cmd = self.commands.recv_async() => {
                    match cmd {
                        Ok(SchedulerCommand::Activate(reason)) => {
                            if self.activate(reason).await {
                                ticking = true;
                                initial_testing_at =
                                    Some(Instant::now() + self.timing.initial_testing_delay);
                            }
                        }
                        Ok(SchedulerCommand::Deactivate) => {
                            self.deactivate().await;
                            ticking = false;
                            initial_testing_at = None;
                        }
                        Ok(SchedulerCommand::DispatchAgent(id)) => {
                            if let Err(e) = self.manager.execute_agent_task(&id).await {
                                tracing::warn!("Manual dispatch of '{}' failed: {}", id, e);
                            }
                        }
                        Ok(SchedulerCommand::Reinitialize) => {
                            self.manager.reinitialize().await;
                        }
                        Err(_) => {
                            tracing::info!("All command senders dropped; scheduler exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Flip the fleet active and kick off the side effects around activation.
    /// Collaborator outages never block activation: the timeline call and the
    /// audit insert are each caught and logged individually.
    async fn activate(&self, reason: ActivationReason) -> bool {
        if let Err(e) = self.activation.start(reason) {
            tracing::error!("Activation failed: {}", e);
            return false;
        }
        self.manager.set_mode(SystemMode::Autonomous).await;

        if let Err(e) = self
            .invoker
            .invoke(
                "ui_timeline_start",
                json!({ "trigger": reason.as_str(), "started_at": Utc::now().to_rfc3339() }),
            )
            .await
        {
            tracing::warn!("Timeline start failed; activation continues: {}", e);
        }

        let row = AgentLogRow::new(
            "system",
            "Activate 24/7 autonomous fleet operation",
            "activation",
            "fleet activated",
        )
        .with_outcome("activated", reason.as_str());
        if let Err(e) = self.db.append_agent_log(&row) {
            tracing::warn!("Activation audit write failed; activation continues: {}", e);
        }

        self.events.emit(FleetEvent::Activated { reason });
        true
    }

    fn persisted_record_is_running(&self) -> bool {
        match self.activation.load() {
            Ok(Some(status)) => status.is_running(),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Could not read persisted activation record: {}", e);
                false
            }
        }
    }

    async fn deactivate(&self) {
        if let Err(e) = self.activation.deactivate() {
            tracing::warn!("Deactivation cleanup failed: {}", e);
        }
        self.manager.set_mode(SystemMode::Manual).await;
        self.events.emit(FleetEvent::Deactivated);
    }

    /// One comprehensive-testing run shortly after activation; it stamps
    /// `last_testing_cycle` so the hourly trigger has a baseline. Runs inside
    /// the actor loop, so the stamp and the cycle save never interleave.
    async fn run_initial_testing(&self) {
        match self.manager.run_comprehensive_testing().await {
            Ok(_) => {
                if let Err(e) = stamp_testing_cycle(&self.activation) {
                    tracing::warn!("Could not stamp testing cycle: {}", e);
                }
            }
            Err(e) => tracing::warn!("Initial comprehensive testing failed: {}", e),
        }
    }

    /// One tick of the continuous operation loop.
    ///
    /// Re-reads the persisted record first: an absent or inactive record
    /// cancels the loop cooperatively. Otherwise every due agent is
    /// dispatched strictly sequentially with a fixed pause between them,
    /// the hourly testing trigger is checked, and the incremented cycle
    /// counter is persisted.
    pub async fn run_cycle(&self) -> Result<CycleDisposition> {
        let Some(status) = self.activation.load()? else {
            return Ok(CycleDisposition::Stop);
        };
        if !status.is_running() {
            return Ok(CycleDisposition::Stop);
        }

        let due = self.manager.due_agent_ids(Utc::now()).await;
        let dispatched = due.len();
        for (index, id) in due.iter().enumerate() {
            if index > 0 {
                sleep(self.timing.agent_pause).await;
            }
            // Failures are already applied to the record and escalated;
            // the loop itself just keeps going.
            if let Err(e) = self.manager.execute_agent_task(id).await {
                tracing::warn!("Dispatch of '{}' failed: {}", id, e);
            }
        }

        // A missing baseline means the post-activation run has not stamped
        // yet; the trigger stays quiet until it does.
        let mut testing_stamp = None;
        if let Some(last) = status.last_testing_cycle {
            if Utc::now() - last > self.timing.testing_interval {
                match self.manager.run_comprehensive_testing().await {
                    Ok(_) => testing_stamp = Some(Utc::now()),
                    Err(e) => tracing::warn!("Comprehensive testing failed: {}", e),
                }
            }
        }

        // Dispatch can take seconds; persist onto a fresh copy of the record
        // so a baseline stamped in the meantime survives.
        let mut latest = self.activation.load()?.unwrap_or(status);
        if testing_stamp.is_some() {
            latest.last_testing_cycle = testing_stamp;
        }
        latest.total_cycles += 1;
        self.activation.save(&latest)?;

        self.events.emit(FleetEvent::CycleCompleted {
            total_cycles: latest.total_cycles,
            dispatched,
        });

        Ok(CycleDisposition::Continue)
    }
}

fn stamp_testing_cycle(activation: &ActivationService) -> Result<()> {
    if let Some(mut status) = activation.load()? {
        status.last_testing_cycle = Some(Utc::now());
        activation.save(&status)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationStatus, MemoryStatusStore};
    use crate::ai_client::testing::MockInvoker;
    use crate::fleet::pages::NullPageSink;
    use crate::fleet::tasks::TaskRegistry;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        scheduler: FleetScheduler,
        activation: Arc<ActivationService>,
        invoker: Arc<MockInvoker>,
        manager: Arc<FleetManager>,
        _commands: flume::Sender<SchedulerCommand>,
    }

    fn fixture(invoker: Arc<MockInvoker>) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Arc::new(FleetDatabase::new(dir.path().join("fleet.db")).unwrap());
        let activation = Arc::new(ActivationService::new(Arc::new(MemoryStatusStore::new())));
        let manager = Arc::new(FleetManager::new(
            TaskRegistry::with_ai(invoker.clone()),
            invoker.clone(),
            db.clone(),
            EventBus::disconnected(),
            Arc::new(NullPageSink),
        ));
        let (tx, rx) = flume::unbounded();

        let mut timing = SchedulerTiming::from_config(&FleetConfig::default());
        timing.agent_pause = Duration::from_millis(0);
        timing.auto_activate = false;
        timing.cycle_interval = Duration::from_millis(20);
        timing.initial_testing_delay = Duration::from_millis(0);

        let scheduler = FleetScheduler::new(
            manager.clone(),
            activation.clone(),
            invoker.clone(),
            db,
            EventBus::disconnected(),
            timing,
            rx,
        );

        Fixture {
            _dir: dir,
            scheduler,
            activation,
            invoker,
            manager,
            _commands: tx,
        }
    }

    #[tokio::test]
    async fn absent_record_stops_the_loop() {
        let fx = fixture(Arc::new(MockInvoker::replying(serde_json::json!({}))));
        let disposition = fx.scheduler.run_cycle().await.unwrap();
        assert_eq!(disposition, CycleDisposition::Stop);
        assert_eq!(fx.invoker.call_count(), 0);
        // Roster untouched.
        for agent in fx.manager.snapshot().await {
            assert_eq!(agent.tasks_completed, 0);
        }
    }

    #[tokio::test]
    async fn inactive_record_stops_the_loop() {
        let fx = fixture(Arc::new(MockInvoker::replying(serde_json::json!({}))));
        let status = ActivationStatus {
            is_active: false,
            is_persistent: true,
            ..Default::default()
        };
        fx.activation.save(&status).unwrap();

        assert_eq!(
            fx.scheduler.run_cycle().await.unwrap(),
            CycleDisposition::Stop
        );
    }

    #[tokio::test]
    async fn empty_roster_tick_counts_cycle_without_dispatch() {
        let fx = fixture(Arc::new(MockInvoker::replying(serde_json::json!({}))));
        fx.activation.start(ActivationReason::Manual).unwrap();
        fx.manager.set_roster_for_tests(Vec::new()).await;

        let disposition = fx.scheduler.run_cycle().await.unwrap();
        assert_eq!(disposition, CycleDisposition::Continue);
        assert_eq!(fx.invoker.call_count(), 0);

        let status = fx.activation.load().unwrap().unwrap();
        assert_eq!(status.total_cycles, 1);
    }

    #[tokio::test]
    async fn due_agents_are_dispatched_sequentially() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({"summary": "ok"})));
        let fx = fixture(invoker.clone());
        fx.activation.start(ActivationReason::Manual).unwrap();

        // Keep only the first three agents to bound the tick.
        let trimmed: Vec<_> = fx.manager.snapshot().await.into_iter().take(3).collect();
        fx.manager.set_roster_for_tests(trimmed).await;

        fx.scheduler.run_cycle().await.unwrap();
        // Agent 0 is due immediately; 1 and 2 are staggered into the future.
        assert_eq!(invoker.call_count(), 1);

        let agents = fx.manager.snapshot().await;
        assert_eq!(agents[0].tasks_completed, 1);
        assert_eq!(agents[1].tasks_completed, 0);
    }

    #[tokio::test]
    async fn testing_trigger_waits_for_baseline_then_fires() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({"summary": "green"})));
        let fx = fixture(invoker.clone());
        fx.activation.start(ActivationReason::Manual).unwrap();
        fx.manager.set_roster_for_tests(Vec::new()).await;

        // No baseline: no testing call.
        fx.scheduler.run_cycle().await.unwrap();
        assert_eq!(fx.invoker.call_count(), 0);

        // Stale baseline: testing fires and restamps.
        let mut status = fx.activation.load().unwrap().unwrap();
        status.last_testing_cycle = Some(Utc::now() - ChronoDuration::hours(2));
        fx.activation.save(&status).unwrap();

        fx.scheduler.run_cycle().await.unwrap();
        assert_eq!(fx.invoker.kinds(), vec!["comprehensive_testing".to_string()]);

        let status = fx.activation.load().unwrap().unwrap();
        let last = status.last_testing_cycle.unwrap();
        assert!(Utc::now() - last < ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn cycle_counter_accumulates_across_ticks() {
        let fx = fixture(Arc::new(MockInvoker::replying(serde_json::json!({}))));
        fx.activation.start(ActivationReason::Manual).unwrap();
        fx.manager.set_roster_for_tests(Vec::new()).await;

        for _ in 0..3 {
            fx.scheduler.run_cycle().await.unwrap();
        }
        let status = fx.activation.load().unwrap().unwrap();
        assert_eq!(status.total_cycles, 3);
        // The never-incremented consultation counter stays at zero.
        assert_eq!(status.gpt_consultations, 0);
    }

    #[tokio::test]
    async fn mid_cycle_baseline_stamp_survives_cycle_save() {
        let invoker = Arc::new(
            MockInvoker::replying(serde_json::json!({"summary": "ok"}))
                .with_delay(Duration::from_millis(100)),
        );
        let fx = fixture(invoker);
        fx.activation.start(ActivationReason::Manual).unwrap();

        let trimmed: Vec<_> = fx.manager.snapshot().await.into_iter().take(1).collect();
        fx.manager.set_roster_for_tests(trimmed).await;

        // Stamp the baseline while the cycle is still dispatching.
        let activation = fx.activation.clone();
        let stamp = async move {
            sleep(Duration::from_millis(30)).await;
            stamp_testing_cycle(&activation).unwrap();
        };
        let (disposition, _) = tokio::join!(fx.scheduler.run_cycle(), stamp);
        assert_eq!(disposition.unwrap(), CycleDisposition::Continue);

        let status = fx.activation.load().unwrap().unwrap();
        assert!(status.last_testing_cycle.is_some());
        assert_eq!(status.total_cycles, 1);
    }

    #[tokio::test]
    async fn manual_activate_runs_initial_testing_in_the_actor() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({"summary": "green"})));
        let fx = fixture(invoker.clone());
        fx.manager.set_roster_for_tests(Vec::new()).await;

        let activation = fx.activation.clone();
        let commands = fx._commands.clone();
        let actor = tokio::spawn(fx.scheduler.run());

        commands
            .send(SchedulerCommand::Activate(ActivationReason::Manual))
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let status = activation.load().unwrap().unwrap();
        assert!(status.is_active);
        assert!(status.last_testing_cycle.is_some());
        assert!(invoker.kinds().contains(&"comprehensive_testing".to_string()));

        drop(commands);
        drop(fx._commands);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn startup_resumes_persisted_activation() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({"summary": "green"})));
        let fx = fixture(invoker.clone());
        fx.activation.start(ActivationReason::Manual).unwrap();
        fx.manager.set_roster_for_tests(Vec::new()).await;

        let activation = fx.activation.clone();
        let actor = tokio::spawn(fx.scheduler.run());
        sleep(Duration::from_millis(120)).await;

        let status = activation.load().unwrap().unwrap();
        assert!(status.total_cycles >= 1);
        assert!(status.last_testing_cycle.is_some());
        assert!(invoker.kinds().contains(&"comprehensive_testing".to_string()));

        drop(fx._commands);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn startup_stays_dormant_without_persisted_activation() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({})));
        let fx = fixture(invoker.clone());

        let activation = fx.activation.clone();
        let actor = tokio::spawn(fx.scheduler.run());
        sleep(Duration::from_millis(80)).await;

        assert_eq!(invoker.call_count(), 0);
        assert!(activation.load().unwrap().is_none());

        drop(fx._commands);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn activate_survives_collaborator_outage() {
        let fx = fixture(Arc::new(MockInvoker::failing("timeline down")));
        assert!(fx.scheduler.activate(ActivationReason::Auto).await);

        let status = fx.activation.load().unwrap().unwrap();
        assert!(status.is_active);
        assert!(status.is_auto_activated);
    }
}
