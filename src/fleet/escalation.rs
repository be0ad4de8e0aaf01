use serde_json::json;

use crate::ai_client::AiInvoker;
use crate::database::{AgentLogRow, FleetDatabase};
use crate::events::{EventBus, FleetEvent};
use crate::fleet::{AgentRecord, SystemStats};

/// Ask the collaborator for remediation after a failed dispatch.
///
/// Fire-and-forget: the exchange is logged and surfaced as a notification,
/// and any failure here is logged at warn, never re-escalated.
pub async fn seek_assistance(
    invoker: &dyn AiInvoker,
    db: &FleetDatabase,
    events: &EventBus,
    agent: &AgentRecord,
    error_text: &str,
    stats: &SystemStats,
) {
    let payload = json!({
        "agent_id": agent.id,
        "agent_type": agent.category.as_str(),
        "error_context": error_text,
        "system_context": {
            "active_agents": stats.active_agents,
            "total_agents": stats.total_agents,
            "average_success_rate": stats.average_success_rate,
            "mode": stats.mode.as_str(),
        },
    });

    events.emit(FleetEvent::AssistanceRequested {
        agent_id: agent.id.clone(),
        error: error_text.to_string(),
    });

    let response = match invoker.invoke("gpt_assistance", payload.clone()).await {
        Ok(reply) => reply.to_string(),
        Err(e) => {
            tracing::warn!("GPT assistance call failed for {}: {}", agent.id, e);
            return;
        }
    };

    tracing::info!("GPT assistance received for {}", agent.id);

    let row = AgentLogRow::new(
        &agent.id,
        "Seek remediation for failed task",
        &payload.to_string(),
        &response,
    )
    .with_outcome("gpt_assistance", "success");
    if let Err(e) = db.append_agent_log(&row) {
        tracing::warn!("Audit log write failed (continuing): {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::testing::MockInvoker;
    use crate::fleet::roster;
    use crate::fleet::SystemMode;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_stats() -> SystemStats {
        SystemStats {
            active_agents: 249,
            total_agents: 250,
            average_success_rate: 99.0,
            total_tasks_completed: 10,
            mode: SystemMode::Autonomous,
            uptime_secs: Some(60),
        }
    }

    #[tokio::test]
    async fn assistance_logs_the_exchange() {
        let dir = tempdir().unwrap();
        let db = FleetDatabase::new(dir.path().join("fleet.db")).unwrap();
        let invoker = Arc::new(MockInvoker::replying(
            serde_json::json!({"suggestion": "restart the worker"}),
        ));
        let agents = roster::initialize_agents(Utc::now());

        seek_assistance(
            invoker.as_ref(),
            &db,
            &EventBus::disconnected(),
            &agents[0],
            "boom",
            &sample_stats(),
        )
        .await;

        assert_eq!(invoker.call_count(), 1);
        let calls = invoker.calls.lock().unwrap();
        let (kind, payload) = &calls[0];
        assert_eq!(kind, "gpt_assistance");
        assert_eq!(payload["error_context"], "boom");
        assert_eq!(payload["agent_id"], agents[0].id);

        let rows = db.recent_logs(5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_taken.as_deref(), Some("gpt_assistance"));
    }

    #[tokio::test]
    async fn assistance_failure_is_swallowed() {
        let dir = tempdir().unwrap();
        let db = FleetDatabase::new(dir.path().join("fleet.db")).unwrap();
        let invoker = Arc::new(MockInvoker::failing("escalation endpoint down"));
        let agents = roster::initialize_agents(Utc::now());

        seek_assistance(
            invoker.as_ref(),
            &db,
            &EventBus::disconnected(),
            &agents[0],
            "boom",
            &sample_stats(),
        )
        .await;

        // No audit row when the collaborator itself is unreachable.
        assert_eq!(db.recent_logs(5).unwrap().len(), 0);
    }
}
