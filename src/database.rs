use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// One append-only audit row. Written on every task success, task failure and
/// GPT escalation; the core never reads it back except for the bounded
/// `recent_logs` view exposed over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogRow {
    pub id: String,
    pub agent_id: String,
    pub goal: String,
    pub context: Option<serde_json::Value>,
    pub prompt: String,
    pub response: String,
    pub action_taken: Option<String>,
    pub confidence: Option<f64>,
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentLogRow {
    pub fn new(agent_id: &str, goal: &str, prompt: &str, response: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            goal: goal.to_string(),
            context: None,
            prompt: prompt.to_string(),
            response: response.to_string(),
            action_taken: None,
            confidence: None,
            outcome: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_outcome(mut self, action_taken: &str, outcome: &str) -> Self {
        self.action_taken = Some(action_taken.to_string());
        self.outcome = Some(outcome.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

pub struct FleetDatabase {
    conn: Mutex<Connection>,
}

impl FleetDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS fleet_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_logs (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                goal TEXT NOT NULL,
                context TEXT,
                prompt TEXT NOT NULL,
                response TEXT NOT NULL,
                action_taken TEXT,
                confidence REAL,
                outcome TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_logs_created_at ON agent_logs(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM fleet_state WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO fleet_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_state(&self, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM fleet_state WHERE key = ?1", [key])?;
        Ok(())
    }

    pub fn append_agent_log(&self, row: &AgentLogRow) -> Result<()> {
        let conn = self.lock_conn()?;
        let context = row
            .context
            .as_ref()
            .map(|v| v.to_string());
        conn.execute(
            r#"INSERT INTO agent_logs
               (id, agent_id, goal, context, prompt, response, action_taken, confidence, outcome, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
            params![
                row.id,
                row.agent_id,
                row.goal,
                context,
                row.prompt,
                row.response,
                row.action_taken,
                row.confidence,
                row.outcome,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<AgentLogRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, agent_id, goal, context, prompt, response, action_taken, confidence, outcome, created_at
               FROM agent_logs ORDER BY created_at DESC LIMIT ?1"#,
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                let context: Option<String> = row.get(3)?;
                let created_at: String = row.get(9)?;
                Ok(AgentLogRow {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    goal: row.get(2)?,
                    context: context.and_then(|raw| serde_json::from_str(&raw).ok()),
                    prompt: row.get(4)?,
                    response: row.get(5)?,
                    action_taken: row.get(6)?,
                    confidence: row.get(7)?,
                    outcome: row.get(8)?,
                    created_at: created_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_agent_logs(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM agent_logs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp_db() -> (tempfile::TempDir, FleetDatabase) {
        let dir = tempdir().unwrap();
        let db = FleetDatabase::new(dir.path().join("fleet.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn state_round_trip() {
        let (_dir, db) = open_temp_db();
        assert!(db.get_state("missing").unwrap().is_none());

        db.set_state("k", "v1").unwrap();
        assert_eq!(db.get_state("k").unwrap().as_deref(), Some("v1"));

        db.set_state("k", "v2").unwrap();
        assert_eq!(db.get_state("k").unwrap().as_deref(), Some("v2"));

        db.delete_state("k").unwrap();
        assert!(db.get_state("k").unwrap().is_none());
    }

    #[test]
    fn audit_rows_append_and_read_back() {
        let (_dir, db) = open_temp_db();

        let row = AgentLogRow::new("frontend-agent-3", "frontend task", "improve UI", "done")
            .with_context(serde_json::json!({"priority": 5}))
            .with_outcome("dispatched", "success")
            .with_confidence(0.9);
        db.append_agent_log(&row).unwrap();

        let rows = db.recent_logs(10).unwrap();
        assert_eq!(rows.len(), 1);
        let restored = &rows[0];
        assert_eq!(restored.agent_id, "frontend-agent-3");
        assert_eq!(restored.outcome.as_deref(), Some("success"));
        assert_eq!(restored.confidence, Some(0.9));
        assert_eq!(restored.context.as_ref().unwrap()["priority"], 5);
        assert_eq!(db.count_agent_logs().unwrap(), 1);
    }

    #[test]
    fn recent_logs_respects_limit() {
        let (_dir, db) = open_temp_db();
        for n in 0..5 {
            let row = AgentLogRow::new(&format!("agent-{}", n), "goal", "prompt", "response");
            db.append_agent_log(&row).unwrap();
        }
        assert_eq!(db.recent_logs(3).unwrap().len(), 3);
        assert_eq!(db.count_agent_logs().unwrap(), 5);
    }
}
