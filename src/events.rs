use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::activation::ActivationReason;

/// Notification events emitted by the fleet core. Purely presentational from
/// the core's perspective: the server bridges them onto the WebSocket stream
/// and drops them when nobody is listening.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    Activated {
        reason: ActivationReason,
    },
    Deactivated,
    TaskCompleted {
        agent_id: String,
        task: String,
        summary: String,
    },
    TaskFailed {
        agent_id: String,
        task: String,
        error: String,
    },
    AssistanceRequested {
        agent_id: String,
        error: String,
    },
    TestingCycleCompleted {
        summary: String,
    },
    CycleCompleted {
        total_cycles: u64,
        dispatched: usize,
    },
    PagesPublished {
        agent_id: String,
        count: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

fn envelope(event_type: &str, payload: serde_json::Value) -> EventEnvelope {
    EventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

impl FleetEvent {
    pub fn into_envelope(self) -> EventEnvelope {
        match self {
            FleetEvent::Activated { reason } => envelope(
                "activated",
                serde_json::json!({ "reason": reason.as_str() }),
            ),
            FleetEvent::Deactivated => envelope("deactivated", serde_json::json!({})),
            FleetEvent::TaskCompleted {
                agent_id,
                task,
                summary,
            } => envelope(
                "task_completed",
                serde_json::json!({
                    "agent_id": agent_id,
                    "task": task,
                    "summary": summary
                }),
            ),
            FleetEvent::TaskFailed {
                agent_id,
                task,
                error,
            } => envelope(
                "task_failed",
                serde_json::json!({
                    "agent_id": agent_id,
                    "task": task,
                    "error": error
                }),
            ),
            FleetEvent::AssistanceRequested { agent_id, error } => envelope(
                "assistance_requested",
                serde_json::json!({ "agent_id": agent_id, "error": error }),
            ),
            FleetEvent::TestingCycleCompleted { summary } => envelope(
                "testing_cycle_completed",
                serde_json::json!({ "summary": summary }),
            ),
            FleetEvent::CycleCompleted {
                total_cycles,
                dispatched,
            } => envelope(
                "cycle_completed",
                serde_json::json!({
                    "total_cycles": total_cycles,
                    "dispatched": dispatched
                }),
            ),
            FleetEvent::PagesPublished { agent_id, count } => envelope(
                "pages_published",
                serde_json::json!({ "agent_id": agent_id, "count": count }),
            ),
        }
    }
}

/// Fire-and-forget sender around the core event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: flume::Sender<FleetEvent>,
}

impl EventBus {
    pub fn new(tx: flume::Sender<FleetEvent>) -> Self {
        Self { tx }
    }

    /// Build a bus whose receiver is dropped; emitted events go nowhere.
    pub fn disconnected() -> Self {
        let (tx, _rx) = flume::unbounded();
        Self { tx }
    }

    pub fn emit(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }
}
