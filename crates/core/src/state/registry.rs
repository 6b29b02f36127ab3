//! # Registry Store
//!
//! Persisted index of previously created resources. The Registry Gate reads
//! it for duplicate detection; deployment is the only writer.
//!
//! The store is injected into the coordinator as `Arc<dyn RegistryStore>` so
//! concurrent runs share one index. `name` is the primary key, which is what
//! keeps it unique across writers.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::db::FoundryDb;
use crate::models::RegistryEntry;
use crate::tools::dedup::tokens;

/// Query/upsert interface over the resource registry
pub trait RegistryStore: Send + Sync {
    /// Entries whose name tokens or keywords contain any of `terms`
    /// (all entries when `terms` is empty)
    fn query(&self, terms: &[String]) -> Result<Vec<RegistryEntry>>;

    /// Exact-name lookup
    fn get(&self, name: &str) -> Result<Option<RegistryEntry>>;

    /// Insert or replace the entry keyed by `entry.name`
    fn upsert(&self, entry: &RegistryEntry) -> Result<()>;
}

/// Token-level match, so keywords stored as phrases or in mixed case
/// are found by the same tokens the Registry Gate scores with
fn matches_terms(entry: &RegistryEntry, terms: &BTreeSet<String>) -> bool {
    if terms.is_empty() {
        return true;
    }
    let entry_tokens: BTreeSet<String> = entry
        .keywords
        .iter()
        .flat_map(|k| tokens(k))
        .chain(tokens(&entry.name))
        .collect();
    terms.iter().any(|t| entry_tokens.contains(t))
}

fn normalize_terms(terms: &[String]) -> BTreeSet<String> {
    terms.iter().flat_map(|t| tokens(t)).collect()
}

/// SQLite-backed registry sharing the [`FoundryDb`] connection
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    pub fn new(db: &FoundryDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn list_all(conn: &Connection) -> Result<Vec<RegistryEntry>> {
        let mut stmt = conn.prepare(
            "SELECT name, keywords_json, category, version FROM registry ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list registry entries")?;

        rows.into_iter()
            .map(|(name, keywords_json, category, version)| {
                let keywords: BTreeSet<String> = serde_json::from_str(&keywords_json)
                    .with_context(|| format!("Corrupt keywords for registry entry '{}'", name))?;
                Ok(RegistryEntry {
                    name,
                    keywords,
                    category,
                    version,
                })
            })
            .collect()
    }
}

impl RegistryStore for SqliteRegistry {
    fn query(&self, terms: &[String]) -> Result<Vec<RegistryEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let terms = normalize_terms(terms);
        Ok(Self::list_all(&conn)?
            .into_iter()
            .filter(|e| matches_terms(e, &terms))
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<RegistryEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let row = conn
            .query_row(
                "SELECT name, keywords_json, category, version FROM registry WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query registry")?;

        row.map(|(name, keywords_json, category, version)| -> Result<RegistryEntry> {
            Ok(RegistryEntry {
                keywords: serde_json::from_str(&keywords_json)?,
                name,
                category,
                version,
            })
        })
        .transpose()
    }

    fn upsert(&self, entry: &RegistryEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let keywords_json = serde_json::to_string(&entry.keywords)?;
        conn.execute(
            r#"
            INSERT INTO registry (name, keywords_json, category, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, datetime('now'))
            ON CONFLICT(name) DO UPDATE SET
                keywords_json = excluded.keywords_json,
                category = excluded.category,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
            params![entry.name, keywords_json, entry.category, entry.version],
        )
        .with_context(|| format!("Failed to upsert registry entry '{}'", entry.name))?;

        tracing::debug!("Registry upserted '{}' v{}", entry.name, entry.version);
        Ok(())
    }
}

/// Process-local registry, for embedding and tests
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with entries
    pub fn with_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let registry = Self::new();
        if let Ok(mut map) = registry.entries.lock() {
            for entry in entries {
                map.insert(entry.name.clone(), entry);
            }
        }
        registry
    }
}

impl RegistryStore for InMemoryRegistry {
    fn query(&self, terms: &[String]) -> Result<Vec<RegistryEntry>> {
        let map = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let terms = normalize_terms(terms);
        Ok(map
            .values()
            .filter(|e| matches_terms(e, &terms))
            .cloned()
            .collect())
    }

    fn get(&self, name: &str) -> Result<Option<RegistryEntry>> {
        let map = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(map.get(name).cloned())
    }

    fn upsert(&self, entry: &RegistryEntry) -> Result<()> {
        let mut map = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        map.insert(entry.name.clone(), entry.clone());
        Ok(())
    }
}
