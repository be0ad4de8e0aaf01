use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::database::FleetDatabase;

/// Storage key for the persisted activation record. Absence means
/// "never activated".
pub const STATUS_STATE_KEY: &str = "tms_autonomous_24_7_status";

/// The singleton activation record for the 24/7 fleet.
///
/// Invariant: while `is_persistent` is true the record mirrors durable
/// storage; after deactivation the stored entry is removed entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationStatus {
    pub is_active: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub total_cycles: u64,
    pub last_testing_cycle: Option<DateTime<Utc>>,
    /// Declared in the status model but no code path increments it; kept for
    /// storage-shape fidelity rather than given invented semantics.
    pub gpt_consultations: u64,
    pub is_persistent: bool,
    pub is_auto_activated: bool,
}

impl Default for ActivationStatus {
    fn default() -> Self {
        Self {
            is_active: false,
            start_time: None,
            total_cycles: 0,
            last_testing_cycle: None,
            gpt_consultations: 0,
            is_persistent: false,
            is_auto_activated: false,
        }
    }
}

impl ActivationStatus {
    /// True when the continuous loop should keep running.
    pub fn is_running(&self) -> bool {
        self.is_active && self.is_persistent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    Auto,
    Manual,
}

impl ActivationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivationReason::Auto => "auto",
            ActivationReason::Manual => "manual",
        }
    }
}

/// Durable persistence port for the activation record.
pub trait StatusStore: Send + Sync {
    fn load(&self) -> Result<Option<ActivationStatus>>;
    fn save(&self, status: &ActivationStatus) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed store: JSON under a single key in the fleet_state table.
pub struct DbStatusStore {
    db: Arc<FleetDatabase>,
}

impl DbStatusStore {
    pub fn new(db: Arc<FleetDatabase>) -> Self {
        Self { db }
    }
}

impl StatusStore for DbStatusStore {
    fn load(&self) -> Result<Option<ActivationStatus>> {
        let raw = self.db.get_state(STATUS_STATE_KEY)?;
        match raw {
            Some(json) => {
                let status = serde_json::from_str(&json)
                    .context("Failed to parse persisted activation status")?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    fn save(&self, status: &ActivationStatus) -> Result<()> {
        let json =
            serde_json::to_string(status).context("Failed to serialize activation status")?;
        self.db.set_state(STATUS_STATE_KEY, &json)
    }

    fn clear(&self) -> Result<()> {
        self.db.delete_state(STATUS_STATE_KEY)
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStatusStore {
    status: std::sync::Mutex<Option<ActivationStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_status(&self) -> Result<std::sync::MutexGuard<'_, Option<ActivationStatus>>> {
        self.status
            .lock()
            .map_err(|e| anyhow::anyhow!("Status lock poisoned: {}", e))
    }
}

impl StatusStore for MemoryStatusStore {
    fn load(&self) -> Result<Option<ActivationStatus>> {
        Ok(self.lock_status()?.clone())
    }

    fn save(&self, status: &ActivationStatus) -> Result<()> {
        *self.lock_status()? = Some(status.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.lock_status()? = None;
        Ok(())
    }
}

/// Explicit activation entry point over an injected store.
///
/// Activation is always a named call with a reason, never an implicit side
/// effect; the scheduler and the HTTP layer both go through this service.
pub struct ActivationService {
    store: Arc<dyn StatusStore>,
}

impl ActivationService {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Option<ActivationStatus>> {
        self.store.load()
    }

    /// Flip the fleet into active persistent mode and persist the record.
    /// Counters from a previous activation survive; `start_time` is stamped
    /// fresh.
    pub fn start(&self, reason: ActivationReason) -> Result<ActivationStatus> {
        let previous = self.store.load().unwrap_or_else(|e| {
            tracing::warn!("Could not read previous activation status: {}", e);
            None
        });

        let mut status = previous.unwrap_or_default();
        status.is_active = true;
        status.is_persistent = true;
        status.is_auto_activated = reason == ActivationReason::Auto;
        status.start_time = Some(Utc::now());

        self.store.save(&status)?;
        tracing::info!("Fleet activated ({})", reason.as_str());
        Ok(status)
    }

    /// Remove the durable record; the continuous loop observes the absence on
    /// its next tick and goes dormant.
    pub fn deactivate(&self) -> Result<()> {
        self.store.clear()?;
        tracing::info!("Fleet deactivated; persisted status cleared");
        Ok(())
    }

    pub fn save(&self, status: &ActivationStatus) -> Result<()> {
        self.store.save(status)
    }
}
