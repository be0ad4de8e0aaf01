use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai_client::AiInvoker;
use crate::fleet::AgentRecord;

/// The eleven named tasks agents can be dispatched on. Wire names are
/// snake_case and double as the collaborator request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Refactoring,
    Optimization,
    UiImprovement,
    Monitoring,
    Learning,
    Research,
    Frontend,
    Backend,
    Database,
    Testing,
    Deployment,
}

pub const ALL_TASK_KINDS: [TaskKind; 11] = [
    TaskKind::Refactoring,
    TaskKind::Optimization,
    TaskKind::UiImprovement,
    TaskKind::Monitoring,
    TaskKind::Learning,
    TaskKind::Research,
    TaskKind::Frontend,
    TaskKind::Backend,
    TaskKind::Database,
    TaskKind::Testing,
    TaskKind::Deployment,
];

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Refactoring => "refactoring",
            TaskKind::Optimization => "optimization",
            TaskKind::UiImprovement => "ui_improvement",
            TaskKind::Monitoring => "monitoring",
            TaskKind::Learning => "learning",
            TaskKind::Research => "research",
            TaskKind::Frontend => "frontend",
            TaskKind::Backend => "backend",
            TaskKind::Database => "database",
            TaskKind::Testing => "testing",
            TaskKind::Deployment => "deployment",
        }
    }

    /// The goal line sent to the collaborator for this task.
    pub fn goal(self) -> &'static str {
        match self {
            TaskKind::Refactoring => "Refactor TMS components for clarity and reuse",
            TaskKind::Optimization => "Optimize slow TMS code paths and queries",
            TaskKind::UiImprovement => "Improve TMS portal UI/UX consistency",
            TaskKind::Monitoring => "Monitor TMS system health and surface anomalies",
            TaskKind::Learning => "Learn from recent TMS usage patterns and feedback",
            TaskKind::Research => "Research TMS industry trends and feature opportunities",
            TaskKind::Frontend => "Build and update TMS portal pages and components",
            TaskKind::Backend => "Implement and harden TMS backend functions",
            TaskKind::Database => "Tune TMS database schema, indexes and queries",
            TaskKind::Testing => "Run TMS feature tests and report regressions",
            TaskKind::Deployment => "Prepare and verify TMS deployment artifacts",
        }
    }
}

/// Feature checks bundled into one comprehensive-testing invocation.
pub const COMPREHENSIVE_TEST_FEATURES: [&str; 8] = [
    "brokers_portal",
    "rate_management",
    "delivery_status",
    "carrier_agreements",
    "user_management",
    "database_optimizer",
    "qa_testing",
    "devops_monitoring",
];

/// A page produced by a frontend task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedPage {
    pub path: String,
    pub content: String,
}

/// Typed result contract enforced at the collaborator boundary. Downstream
/// code never pattern-matches on optional raw-JSON fields.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub summary: String,
    pub confidence: Option<f64>,
    pub pages: Vec<GeneratedPage>,
    pub raw: Value,
}

const SUMMARY_MAX_CHARS: usize = 200;

impl TaskOutcome {
    /// Build an outcome from an arbitrary collaborator reply. The reply shape
    /// is undocumented, so parsing is tolerant: missing fields degrade to a
    /// truncated dump of the raw text and shape alone never causes an error.
    pub fn from_reply(kind: TaskKind, reply: Value) -> Self {
        let summary = reply
            .get("summary")
            .or_else(|| reply.get("result"))
            .or_else(|| reply.get("message"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                let raw = reply.to_string();
                let truncated: String = raw.chars().take(SUMMARY_MAX_CHARS).collect();
                format!("{} completed: {}", kind.as_str(), truncated)
            });

        let confidence = reply.get("confidence").and_then(|v| v.as_f64());

        let pages = reply
            .get("pages")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let path = entry
                            .get("path")
                            .or_else(|| entry.get("name"))
                            .and_then(|v| v.as_str())?;
                        let content = entry.get("content").and_then(|v| v.as_str())?;
                        Some(GeneratedPage {
                            path: path.to_string(),
                            content: content.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            summary,
            confidence,
            pages,
            raw: reply,
        }
    }
}

/// One task implementation. Registered per `TaskKind` at startup so real
/// implementations can replace the stock AI forwarders without touching the
/// scheduler.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, agent: &AgentRecord) -> Result<TaskOutcome>;
}

/// Stock handler: forwards a structured request to the AI collaborator and
/// parses the reply at the boundary.
pub struct AiTaskHandler {
    kind: TaskKind,
    invoker: Arc<dyn AiInvoker>,
}

impl AiTaskHandler {
    pub fn new(kind: TaskKind, invoker: Arc<dyn AiInvoker>) -> Self {
        Self { kind, invoker }
    }
}

#[async_trait]
impl TaskHandler for AiTaskHandler {
    async fn execute(&self, agent: &AgentRecord) -> Result<TaskOutcome> {
        let payload = serde_json::json!({
            "agent_id": agent.id,
            "agent_type": agent.category.as_str(),
            "task": self.kind.goal(),
            "priority": 5,
        });

        let reply = self.invoker.invoke(self.kind.as_str(), payload).await?;
        Ok(TaskOutcome::from_reply(self.kind, reply))
    }
}

/// Task registry populated at startup. Overwrites on duplicate registration.
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the stock AI forwarder behind every task kind.
    pub fn with_ai(invoker: Arc<dyn AiInvoker>) -> Self {
        let mut registry = Self::new();
        for kind in ALL_TASK_KINDS {
            registry.register(kind, Arc::new(AiTaskHandler::new(kind, invoker.clone())));
        }
        registry
    }

    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        tracing::debug!("Registered task handler: {}", kind.as_str());
        self.handlers.insert(kind, handler);
    }

    pub fn handler(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::testing::MockInvoker;
    use crate::fleet::roster;
    use chrono::Utc;

    #[test]
    fn ai_registry_covers_all_eleven_kinds() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({})));
        let registry = TaskRegistry::with_ai(invoker);
        assert_eq!(registry.len(), 11);
        for kind in ALL_TASK_KINDS {
            assert!(registry.handler(kind).is_some(), "missing {}", kind.as_str());
        }
    }

    #[test]
    fn outcome_parses_structured_reply() {
        let reply = serde_json::json!({
            "summary": "rebuilt rate tables",
            "confidence": 0.85,
            "pages": [
                {"path": "rates/OverviewPage.tsx", "content": "export const x = 1;"},
                {"name": "rates/DetailPage.tsx", "content": "export const y = 2;"}
            ]
        });
        let outcome = TaskOutcome::from_reply(TaskKind::Frontend, reply);
        assert_eq!(outcome.summary, "rebuilt rate tables");
        assert_eq!(outcome.confidence, Some(0.85));
        assert_eq!(outcome.pages.len(), 2);
        assert_eq!(outcome.pages[1].path, "rates/DetailPage.tsx");
    }

    #[test]
    fn outcome_degrades_on_unknown_shape() {
        let outcome = TaskOutcome::from_reply(TaskKind::Testing, serde_json::json!([1, 2, 3]));
        assert!(outcome.summary.starts_with("testing completed:"));
        assert!(outcome.pages.is_empty());
        assert!(outcome.confidence.is_none());
    }

    #[tokio::test]
    async fn handler_forwards_agent_identity() {
        let invoker = Arc::new(MockInvoker::replying(serde_json::json!({"summary": "ok"})));
        let handler = AiTaskHandler::new(TaskKind::Research, invoker.clone());
        let agents = roster::initialize_agents(Utc::now());
        let outcome = handler.execute(&agents[0]).await.unwrap();

        assert_eq!(outcome.summary, "ok");
        assert_eq!(invoker.call_count(), 1);
        let calls = invoker.calls.lock().unwrap();
        let (kind, payload) = &calls[0];
        assert_eq!(kind, "research");
        assert_eq!(payload["agent_id"], agents[0].id);
        assert_eq!(payload["agent_type"], "research");
    }
}
