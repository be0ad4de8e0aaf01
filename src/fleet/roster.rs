use chrono::{DateTime, Duration, Utc};

use crate::fleet::tasks::TaskKind;
use crate::fleet::{AgentCategory, AgentRecord, AgentStatus};

/// Fixed category quotas; the roster always totals 250.
pub const CATEGORY_QUOTAS: [(AgentCategory, usize); 6] = [
    (AgentCategory::Research, 50),
    (AgentCategory::Frontend, 80),
    (AgentCategory::Backend, 60),
    (AgentCategory::Database, 30),
    (AgentCategory::Testing, 20),
    (AgentCategory::Deployment, 10),
];

pub const TOTAL_AGENTS: usize = 250;

impl AgentCategory {
    /// Task kinds an agent of this category rotates through.
    pub fn assigned_tasks(self) -> Vec<TaskKind> {
        match self {
            AgentCategory::Research => vec![TaskKind::Research, TaskKind::Learning],
            AgentCategory::Frontend => vec![
                TaskKind::Frontend,
                TaskKind::UiImprovement,
                TaskKind::Refactoring,
            ],
            AgentCategory::Backend => vec![
                TaskKind::Backend,
                TaskKind::Optimization,
                TaskKind::Refactoring,
            ],
            AgentCategory::Database => vec![TaskKind::Database, TaskKind::Optimization],
            AgentCategory::Testing => vec![TaskKind::Testing, TaskKind::Monitoring],
            AgentCategory::Deployment => vec![TaskKind::Deployment, TaskKind::Monitoring],
        }
    }

    /// Base dispatch cadence for this category.
    fn base_interval(self) -> Duration {
        match self {
            AgentCategory::Research => Duration::minutes(5),
            AgentCategory::Frontend => Duration::minutes(3),
            AgentCategory::Backend => Duration::minutes(4),
            AgentCategory::Database => Duration::minutes(10),
            AgentCategory::Testing => Duration::minutes(15),
            AgentCategory::Deployment => Duration::minutes(30),
        }
    }
}

/// Delay until an agent's next run. Failures back off to three times the
/// category cadence.
pub fn calculate_next_run(category: AgentCategory, failed: bool) -> Duration {
    let base = category.base_interval();
    if failed {
        base * 3
    } else {
        base
    }
}

/// Deterministically build the full roster. Every agent starts `Active`;
/// the per-index stagger only spreads out the first due check.
pub fn initialize_agents(now: DateTime<Utc>) -> Vec<AgentRecord> {
    let mut agents = Vec::with_capacity(TOTAL_AGENTS);
    let mut index: usize = 0;

    for (category, quota) in CATEGORY_QUOTAS {
        for n in 1..=quota {
            agents.push(AgentRecord {
                id: format!("{}-agent-{}", category.as_str(), n),
                name: format!("{} Agent {}", category.display_name(), n),
                category,
                status: AgentStatus::Active,
                last_action: "Initialized".to_string(),
                success_rate: 100.0,
                tasks_completed: 0,
                next_scheduled_run: now + Duration::milliseconds(index as i64 * 1000),
                assigned_tasks: category.assigned_tasks(),
            });
            index += 1;
        }
    }

    agents
}
