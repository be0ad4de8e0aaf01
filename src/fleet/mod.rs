pub mod escalation;
pub mod pages;
pub mod roster;
pub mod tasks;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::activation::ActivationStatus;
use crate::ai_client::AiInvoker;
use crate::database::{AgentLogRow, FleetDatabase};
use crate::events::{EventBus, FleetEvent};
use crate::fleet::pages::PageSink;
use crate::fleet::tasks::{TaskKind, TaskRegistry, COMPREHENSIVE_TEST_FEATURES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Research,
    Frontend,
    Backend,
    Database,
    Testing,
    Deployment,
}

impl AgentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentCategory::Research => "research",
            AgentCategory::Frontend => "frontend",
            AgentCategory::Backend => "backend",
            AgentCategory::Database => "database",
            AgentCategory::Testing => "testing",
            AgentCategory::Deployment => "deployment",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AgentCategory::Research => "Research",
            AgentCategory::Frontend => "Frontend",
            AgentCategory::Backend => "Backend",
            AgentCategory::Database => "Database",
            AgentCategory::Testing => "Testing",
            AgentCategory::Deployment => "Deployment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "research" => Some(AgentCategory::Research),
            "frontend" => Some(AgentCategory::Frontend),
            "backend" => Some(AgentCategory::Backend),
            "database" => Some(AgentCategory::Database),
            "testing" => Some(AgentCategory::Testing),
            "deployment" => Some(AgentCategory::Deployment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Working,
    Error,
}

/// A roster record for one simulated worker. Category never changes after
/// creation; the record lives for the process session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub category: AgentCategory,
    pub status: AgentStatus,
    pub last_action: String,
    pub success_rate: f64,
    pub tasks_completed: u64,
    pub next_scheduled_run: DateTime<Utc>,
    pub assigned_tasks: Vec<TaskKind>,
}

impl AgentRecord {
    /// Deterministic task rotation: completed count selects from the
    /// category's assigned set.
    pub fn current_task(&self) -> TaskKind {
        let index = (self.tasks_completed as usize) % self.assigned_tasks.len().max(1);
        self.assigned_tasks
            .get(index)
            .copied()
            .unwrap_or(TaskKind::Monitoring)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Autonomous,
    Manual,
    /// Declared and settable, but nothing transitions into it and the
    /// scheduler does not pause on it.
    Maintenance,
}

impl SystemMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::Autonomous => "autonomous",
            SystemMode::Manual => "manual",
            SystemMode::Maintenance => "maintenance",
        }
    }
}

/// Derived statistics; computed on demand, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub active_agents: usize,
    pub total_agents: usize,
    pub average_success_rate: f64,
    pub total_tasks_completed: u64,
    pub mode: SystemMode,
    pub uptime_secs: Option<i64>,
}

/// Owns the roster and applies every dispatch outcome. All mutation funnels
/// through the scheduler actor, so there is exactly one writer at a time;
/// readers take cheap snapshots.
pub struct FleetManager {
    agents: RwLock<Vec<AgentRecord>>,
    registry: TaskRegistry,
    invoker: Arc<dyn AiInvoker>,
    db: Arc<FleetDatabase>,
    events: EventBus,
    pages: Arc<dyn PageSink>,
    mode: RwLock<SystemMode>,
    total_tasks_completed: AtomicU64,
}

impl FleetManager {
    pub fn new(
        registry: TaskRegistry,
        invoker: Arc<dyn AiInvoker>,
        db: Arc<FleetDatabase>,
        events: EventBus,
        pages: Arc<dyn PageSink>,
    ) -> Self {
        let agents = roster::initialize_agents(Utc::now());
        tracing::info!("Initialized fleet roster with {} agents", agents.len());

        Self {
            agents: RwLock::new(agents),
            registry,
            invoker,
            db,
            events,
            pages,
            mode: RwLock::new(SystemMode::Autonomous),
            total_tasks_completed: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        self.agents.read().await.clone()
    }

    pub async fn agent(&self, id: &str) -> Option<AgentRecord> {
        self.agents.read().await.iter().find(|a| a.id == id).cloned()
    }

    /// Ids of agents due for dispatch: currently `Active` with a
    /// `next_scheduled_run` in the past, in roster order.
    pub async fn due_agent_ids(&self, now: DateTime<Utc>) -> Vec<String> {
        self.agents
            .read()
            .await
            .iter()
            .filter(|a| a.status == AgentStatus::Active && a.next_scheduled_run <= now)
            .map(|a| a.id.clone())
            .collect()
    }

    pub async fn mode(&self) -> SystemMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: SystemMode) {
        *self.mode.write().await = mode;
        tracing::info!("System mode set to {}", mode.as_str());
    }

    /// Rebuild the roster from scratch. Counters on the old records are gone;
    /// the global completed-task counter survives.
    pub async fn reinitialize(&self) {
        let fresh = roster::initialize_agents(Utc::now());
        tracing::info!("Reinitializing fleet roster ({} agents)", fresh.len());
        *self.agents.write().await = fresh;
    }

    #[cfg(test)]
    pub async fn set_roster_for_tests(&self, agents: Vec<AgentRecord>) {
        *self.agents.write().await = agents;
    }

    /// Dispatch one agent through its current task handler and apply the
    /// outcome to the roster record.
    pub async fn execute_agent_task(&self, agent_id: &str) -> Result<()> {
        let (snapshot, kind) = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .iter_mut()
                .find(|a| a.id == agent_id)
                .ok_or_else(|| anyhow!("Unknown agent '{}'", agent_id))?;
            agent.status = AgentStatus::Working;
            let snapshot = agent.clone();
            let kind = snapshot.current_task();
            (snapshot, kind)
        };

        let handler = self
            .registry
            .handler(kind)
            .ok_or_else(|| anyhow!("No handler registered for task '{}'", kind.as_str()))?;

        match handler.execute(&snapshot).await {
            Ok(outcome) => {
                self.apply_success(agent_id, kind, &outcome).await;

                let row = AgentLogRow::new(
                    agent_id,
                    kind.goal(),
                    kind.goal(),
                    &outcome.summary,
                )
                .with_context(serde_json::json!({ "task": kind.as_str() }))
                .with_outcome("dispatched", "success");
                let row = match outcome.confidence {
                    Some(confidence) => row.with_confidence(confidence),
                    None => row,
                };
                if let Err(e) = self.db.append_agent_log(&row) {
                    tracing::warn!("Audit log write failed (continuing): {}", e);
                }

                if !outcome.pages.is_empty() {
                    // Page publication is a collaborator side effect; its
                    // failure never fails the task.
                    match self.pages.publish(agent_id, &outcome.pages) {
                        Ok(count) if count > 0 => self.events.emit(FleetEvent::PagesPublished {
                            agent_id: agent_id.to_string(),
                            count,
                        }),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Page sink failed for {}: {}", agent_id, e),
                    }
                }

                self.events.emit(FleetEvent::TaskCompleted {
                    agent_id: agent_id.to_string(),
                    task: kind.as_str().to_string(),
                    summary: outcome.summary.clone(),
                });
                Ok(())
            }
            Err(error) => {
                let error_text = error.to_string();
                self.apply_failure(agent_id, kind, &error_text).await;

                let row = AgentLogRow::new(agent_id, kind.goal(), kind.goal(), &error_text)
                    .with_context(serde_json::json!({ "task": kind.as_str() }))
                    .with_outcome("dispatched", "failure");
                if let Err(e) = self.db.append_agent_log(&row) {
                    tracing::warn!("Audit log write failed (continuing): {}", e);
                }

                self.events.emit(FleetEvent::TaskFailed {
                    agent_id: agent_id.to_string(),
                    task: kind.as_str().to_string(),
                    error: error_text.clone(),
                });

                // Fire-and-forget escalation; its own failure is only logged.
                let stats = self.system_stats(None).await;
                escalation::seek_assistance(
                    self.invoker.as_ref(),
                    &self.db,
                    &self.events,
                    &snapshot,
                    &error_text,
                    &stats,
                )
                .await;

                Err(error)
            }
        }
    }

    async fn apply_success(&self, agent_id: &str, kind: TaskKind, outcome: &tasks::TaskOutcome) {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.iter_mut().find(|a| a.id == agent_id) else {
            tracing::warn!("Agent '{}' disappeared mid-dispatch", agent_id);
            return;
        };
        agent.status = AgentStatus::Active;
        agent.last_action = format!("{}: {}", kind.as_str(), outcome.summary);
        agent.tasks_completed += 1;
        agent.success_rate = (agent.success_rate + 0.1).min(100.0);
        agent.next_scheduled_run = Utc::now() + roster::calculate_next_run(agent.category, false);
        self.total_tasks_completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn apply_failure(&self, agent_id: &str, kind: TaskKind, error_text: &str) {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.iter_mut().find(|a| a.id == agent_id) else {
            tracing::warn!("Agent '{}' disappeared mid-dispatch", agent_id);
            return;
        };
        agent.status = AgentStatus::Error;
        agent.last_action = format!("{} failed: {}", kind.as_str(), error_text);
        agent.success_rate = (agent.success_rate - 1.0).max(0.0);
        agent.next_scheduled_run = Utc::now() + roster::calculate_next_run(agent.category, true);
    }

    /// One comprehensive-testing invocation bundling the named feature checks.
    pub async fn run_comprehensive_testing(&self) -> Result<String> {
        let payload = serde_json::json!({
            "agent_id": "comprehensive-testing",
            "features": COMPREHENSIVE_TEST_FEATURES,
        });
        let reply = self
            .invoker
            .invoke("comprehensive_testing", payload)
            .await?;
        let outcome = tasks::TaskOutcome::from_reply(TaskKind::Testing, reply);

        let row = AgentLogRow::new(
            "comprehensive-testing",
            "Run comprehensive TMS feature testing cycle",
            "comprehensive_testing",
            &outcome.summary,
        )
        .with_outcome("testing_cycle", "success");
        if let Err(e) = self.db.append_agent_log(&row) {
            tracing::warn!("Audit log write failed (continuing): {}", e);
        }

        self.events.emit(FleetEvent::TestingCycleCompleted {
            summary: outcome.summary.clone(),
        });
        Ok(outcome.summary)
    }

    pub async fn system_stats(&self, status: Option<&ActivationStatus>) -> SystemStats {
        let agents = self.agents.read().await;
        let total_agents = agents.len();
        let active_agents = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Active || a.status == AgentStatus::Working)
            .count();
        let average_success_rate = if total_agents == 0 {
            0.0
        } else {
            agents.iter().map(|a| a.success_rate).sum::<f64>() / total_agents as f64
        };
        let uptime_secs = status
            .and_then(|s| s.start_time)
            .map(|start| (Utc::now() - start).num_seconds());

        SystemStats {
            active_agents,
            total_agents,
            average_success_rate,
            total_tasks_completed: self.total_tasks_completed.load(Ordering::SeqCst),
            mode: *self.mode.read().await,
            uptime_secs,
        }
    }
}
