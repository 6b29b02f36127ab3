//! # Foundry Database
//!
//! Single SQLite database for registry entries, disposition interactions
//! and archived runs, stored at `.foundry/foundry.db`.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::io::get_runtime_path;

/// Ordered schema migrations; a database at version N has applied 1..=N
const MIGRATIONS: &[(i32, &str)] = &[(
    1,
    r#"
    -- name is the registry's uniqueness key
    CREATE TABLE IF NOT EXISTS registry (
        name TEXT PRIMARY KEY,
        keywords_json TEXT NOT NULL DEFAULT '[]',
        category TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS interactions (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        options_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        response_json TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_interactions_status ON interactions(status);
    CREATE INDEX IF NOT EXISTS idx_interactions_run ON interactions(run_id);

    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        target_name TEXT NOT NULL,
        route TEXT NOT NULL,
        status TEXT NOT NULL,
        current_phase INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        report_json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_runs_target ON pipeline_runs(target_name);
    "#,
)];

/// Latest schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Unified database manager for all Foundry state
pub struct FoundryDb {
    conn: Arc<Mutex<Connection>>,
}

impl FoundryDb {
    /// Open or create the database at `.foundry/foundry.db`
    pub fn open() -> Result<Self> {
        Self::open_at(get_runtime_path().join("foundry.db"))
    }

    /// Open database at a specific path (useful for testing)
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open foundry database")?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
            let tx = conn.transaction()?;
            tx.execute_batch(sql)
                .with_context(|| format!("Migration to schema v{} failed", version))?;
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;
            tracing::info!("FoundryDb migrated to schema v{}", version);
        }

        Ok(())
    }
}
