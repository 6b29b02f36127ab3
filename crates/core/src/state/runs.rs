//! # Run Archive
//!
//! Terminal runs are archived together with their completion report once
//! the report has been generated. Archived runs are read-only.

use super::db::FoundryDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::models::{Phase, PipelineRun, Route, RunStatus};

/// An archived run and its report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRun {
    pub run: PipelineRun,
    pub report: serde_json::Value,
}

/// SQLite-backed archive of finished runs
pub struct RunArchive {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl RunArchive {
    pub fn new(db: &FoundryDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Archive a terminal run
    pub fn archive(&self, run: &PipelineRun, report: &serde_json::Value) -> Result<()> {
        if !run.status.is_terminal() {
            anyhow::bail!("Run {} is still running and cannot be archived", run.id);
        }

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO pipeline_runs
            (id, target_name, route, status, current_phase, started_at, ended_at, report_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                run.id,
                run.target_name,
                serde_json::to_string(&run.route)?,
                serde_json::to_string(&run.status)?,
                run.current_phase.number(),
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(report)?,
            ],
        )
        .context("Failed to archive run")?;

        tracing::info!(run_id = %run.id, status = run.status.as_str(), "Run archived");
        Ok(())
    }

    /// Load an archived run by ID
    pub fn load(&self, id: &str) -> Result<ArchivedRun> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let row = conn
            .query_row(
                r#"
                SELECT id, target_name, route, status, current_phase, started_at, ended_at, report_json
                FROM pipeline_runs WHERE id = ?1
                "#,
                params![id],
                Self::read_row,
            )
            .context("Archived run not found")?;

        Self::decode(row)
    }

    /// Archived runs for a target, newest first
    pub fn list_for_target(&self, target_name: &str) -> Result<Vec<ArchivedRun>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, target_name, route, status, current_phase, started_at, ended_at, report_json
            FROM pipeline_runs WHERE target_name = ?1 ORDER BY started_at DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![target_name], Self::read_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list archived runs")?;

        rows.into_iter().map(Self::decode).collect()
    }

    fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawRun> {
        Ok(RawRun {
            id: row.get(0)?,
            target_name: row.get(1)?,
            route: row.get(2)?,
            status: row.get(3)?,
            current_phase: row.get(4)?,
            started_at: row.get(5)?,
            ended_at: row.get(6)?,
            report_json: row.get(7)?,
        })
    }

    fn decode(raw: RawRun) -> Result<ArchivedRun> {
        let route: Route = serde_json::from_str(&raw.route)?;
        let status: RunStatus = serde_json::from_str(&raw.status)?;
        let current_phase = Phase::ALL
            .into_iter()
            .find(|p| p.number() == raw.current_phase)
            .with_context(|| format!("Invalid phase number {}", raw.current_phase))?;

        Ok(ArchivedRun {
            run: PipelineRun {
                id: raw.id,
                target_name: raw.target_name,
                route,
                current_phase,
                status,
                started_at: parse_time(&raw.started_at)?,
                ended_at: raw.ended_at.as_deref().map(parse_time).transpose()?,
            },
            report: serde_json::from_str(&raw.report_json)?,
        })
    }
}

struct RawRun {
    id: String,
    target_name: String,
    route: String,
    status: String,
    current_phase: u8,
    started_at: String,
    ended_at: Option<String>,
    report_json: String,
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_run(target: &str, status: RunStatus, phase: Phase) -> PipelineRun {
        let mut run = PipelineRun::new();
        run.target_name = target.to_string();
        run.route = Route::Hybrid;
        run.status = status;
        run.current_phase = phase;
        run.ended_at = Some(Utc::now());
        run
    }

    #[test]
    fn test_archive_and_load() {
        let db = FoundryDb::open_in_memory().unwrap();
        let archive = RunArchive::new(&db);
        let run = finished_run("kubernetes-security", RunStatus::Failed, Phase::Delegation);

        archive
            .archive(&run, &serde_json::json!({ "status": "failed" }))
            .unwrap();

        let loaded = archive.load(&run.id).unwrap();
        assert_eq!(loaded.run.target_name, "kubernetes-security");
        assert_eq!(loaded.run.route, Route::Hybrid);
        assert_eq!(loaded.run.status, RunStatus::Failed);
        assert_eq!(loaded.run.current_phase, Phase::Delegation);
        assert!(loaded.run.ended_at.is_some());
        assert_eq!(loaded.report["status"], "failed");
    }

    #[test]
    fn test_running_run_is_rejected() {
        let db = FoundryDb::open_in_memory().unwrap();
        let archive = RunArchive::new(&db);
        let run = PipelineRun::new();
        assert!(archive.archive(&run, &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_list_for_target() {
        let db = FoundryDb::open_in_memory().unwrap();
        let archive = RunArchive::new(&db);
        for _ in 0..2 {
            let run = finished_run("rust-reviewer", RunStatus::Succeeded, Phase::Deploy);
            archive.archive(&run, &serde_json::json!({})).unwrap();
        }
        let other = finished_run("other", RunStatus::Aborted, Phase::InputAnalysis);
        archive.archive(&other, &serde_json::json!({})).unwrap();

        assert_eq!(archive.list_for_target("rust-reviewer").unwrap().len(), 2);
    }
}
