//! # Disposition Inbox
//!
//! Every disposition a run asks for (duplicate target, existing
//! work-order) is written here before the coordinator blocks, and closed
//! with the typed answer or as abandoned when the run gives up waiting.
//! An interaction is resolved at most once.

use super::db::FoundryDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

const COLUMNS: &str = "id, run_id, kind, status, title, description, options_json, \
                       created_at, resolved_at, response_json";

/// Kind of disposition requested from the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Registry overlap: Rebuild, Narrow or Abort
    Duplicate,
    /// Existing work-order: Reuse or Regenerate
    WorkOrder,
}

/// Lifecycle of an interaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Pending,
    Responded,
    /// The run ended without an answer
    Abandoned,
}

/// Snake-case serde name of a unit variant
fn tag<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => anyhow::bail!("expected a string tag, got {}", other),
    }
}

fn untag<T: for<'de> Deserialize<'de>>(raw: String) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A persisted disposition request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub run_id: String,
    pub kind: InteractionKind,
    pub status: InteractionStatus,
    pub title: String,
    pub description: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// The typed answer, as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl Interaction {
    pub fn new(
        run_id: &str,
        kind: InteractionKind,
        title: impl Into<String>,
        description: impl Into<String>,
        options: &[&str],
    ) -> Self {
        Self {
            id: format!("int-{}", uuid::Uuid::new_v4()),
            run_id: run_id.to_string(),
            kind,
            status: InteractionStatus::Pending,
            title: title.into(),
            description: description.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            created_at: Utc::now(),
            resolved_at: None,
            response: None,
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let options_json: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let resolved_at: Option<String> = row.get(8)?;
        let response_json: Option<String> = row.get(9)?;

        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            kind: untag(row.get(2)?)?,
            status: untag(row.get(3)?)?,
            title: row.get(4)?,
            description: row.get(5)?,
            options: serde_json::from_str(&options_json).unwrap_or_default(),
            created_at: parse_time(&created_at).unwrap_or_else(Utc::now),
            resolved_at: resolved_at.as_deref().and_then(parse_time),
            response: response_json.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

/// SQLite-backed disposition inbox
pub struct InteractionManager {
    conn: Arc<Mutex<Connection>>,
}

impl InteractionManager {
    pub fn new(db: &FoundryDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Record a new request
    pub fn save(&self, interaction: &Interaction) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO interactions ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                COLUMNS
            ),
            params![
                interaction.id,
                interaction.run_id,
                tag(&interaction.kind)?,
                tag(&interaction.status)?,
                interaction.title,
                interaction.description,
                serde_json::to_string(&interaction.options)?,
                interaction.created_at.to_rfc3339(),
                interaction.resolved_at.map(|t| t.to_rfc3339()),
                interaction
                    .response
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )
        .with_context(|| format!("Failed to save interaction {}", interaction.id))?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Interaction> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM interactions WHERE id = ?1", COLUMNS),
            params![id],
            Interaction::from_row,
        )
        .optional()?
        .with_context(|| format!("Interaction not found: {}", id))
    }

    /// Close a pending interaction as responded (with the answer) or abandoned
    pub fn resolve(
        &self,
        id: &str,
        status: InteractionStatus,
        response: Option<&serde_json::Value>,
    ) -> Result<()> {
        if status == InteractionStatus::Pending {
            anyhow::bail!("Interaction {} cannot be resolved back to pending", id);
        }

        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE interactions SET status = ?1, resolved_at = ?2, response_json = ?3 \
             WHERE id = ?4 AND status = 'pending'",
            params![
                tag(&status)?,
                Utc::now().to_rfc3339(),
                response.map(serde_json::to_string).transpose()?,
                id
            ],
        )?;

        if affected == 0 {
            anyhow::bail!("No pending interaction {}", id);
        }
        Ok(())
    }

    /// Interactions still awaiting an answer, oldest first
    pub fn list_pending(&self) -> Result<Vec<Interaction>> {
        self.select("status = ?1", tag(&InteractionStatus::Pending)?)
    }

    /// Every interaction raised by one run, oldest first
    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<Interaction>> {
        self.select("run_id = ?1", run_id.to_string())
    }

    fn select(&self, filter: &str, arg: String) -> Result<Vec<Interaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM interactions WHERE {} ORDER BY created_at ASC",
            COLUMNS, filter
        ))?;
        let rows = stmt.query_map(params![arg], Interaction::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list interactions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duplicate_interaction(run_id: &str) -> Interaction {
        Interaction::new(
            run_id,
            InteractionKind::Duplicate,
            "'security-expert' overlaps existing resources",
            "security-architect (83%)",
            &["rebuild", "narrow", "abort"],
        )
    }

    #[test]
    fn test_save_and_load() {
        let db = FoundryDb::open_in_memory().unwrap();
        let manager = InteractionManager::new(&db);
        let interaction = duplicate_interaction("run-1");
        manager.save(&interaction).unwrap();

        let loaded = manager.load(&interaction.id).unwrap();
        assert_eq!(loaded.title, interaction.title);
        assert_eq!(loaded.kind, InteractionKind::Duplicate);
        assert_eq!(loaded.status, InteractionStatus::Pending);
        assert_eq!(loaded.options, vec!["rebuild", "narrow", "abort"]);
        assert!(manager.load("int-missing").is_err());
    }

    #[test]
    fn test_resolve_records_answer_once() {
        let db = FoundryDb::open_in_memory().unwrap();
        let manager = InteractionManager::new(&db);
        let interaction = duplicate_interaction("run-1");
        manager.save(&interaction).unwrap();

        let answer = serde_json::json!({ "duplicate": { "narrow": "cloud" } });
        manager
            .resolve(&interaction.id, InteractionStatus::Responded, Some(&answer))
            .unwrap();

        let loaded = manager.load(&interaction.id).unwrap();
        assert_eq!(loaded.status, InteractionStatus::Responded);
        assert!(loaded.resolved_at.is_some());
        assert_eq!(loaded.response, Some(answer));
        assert!(manager.list_pending().unwrap().is_empty());

        assert!(manager
            .resolve(&interaction.id, InteractionStatus::Abandoned, None)
            .is_err());
    }

    #[test]
    fn test_resolve_rejects_unknown_and_pending() {
        let db = FoundryDb::open_in_memory().unwrap();
        let manager = InteractionManager::new(&db);
        assert!(manager
            .resolve("int-missing", InteractionStatus::Abandoned, None)
            .is_err());

        let interaction = duplicate_interaction("run-1");
        manager.save(&interaction).unwrap();
        assert!(manager
            .resolve(&interaction.id, InteractionStatus::Pending, None)
            .is_err());
    }

    #[test]
    fn test_list_for_run() {
        let db = FoundryDb::open_in_memory().unwrap();
        let manager = InteractionManager::new(&db);
        manager.save(&duplicate_interaction("run-a")).unwrap();
        manager.save(&duplicate_interaction("run-b")).unwrap();

        let for_a = manager.list_for_run("run-a").unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].run_id, "run-a");
        assert_eq!(manager.list_pending().unwrap().len(), 2);
    }
}
