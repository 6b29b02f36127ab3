//! # IO Utilities
//!
//! File system helpers for the `.foundry` runtime directory and the
//! per-run artifact directories beneath it.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Get the runtime directory path (.foundry)
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("FOUNDRY_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".foundry")
}

/// Create (if needed) and return the artifact directory for one run
pub async fn ensure_run_dir(runs_root: &Path, run_id: &str) -> Result<PathBuf> {
    let dir = runs_root.join(run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create run directory: {:?}", dir))?;
    Ok(dir)
}

/// Write a value as pretty JSON, creating parent directories
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write file: {:?}", path))
}

/// Read a file referenced by a worker or a request
pub async fn read_ref(reference: &str) -> Result<String> {
    let path = Path::new(reference);
    fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_runtime_path() {
        let path = get_runtime_path();
        if std::env::var("FOUNDRY_RUNTIME_PATH").is_err() {
            assert!(path.ends_with(".foundry"));
        }
    }

    #[tokio::test]
    async fn test_write_json_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = ensure_run_dir(dir.path(), "run-1").await.unwrap();
        let path = run_dir.join("nested").join("value.json");

        write_json(&path, &serde_json::json!({ "ok": true })).await.unwrap();

        let content = read_ref(&path.to_string_lossy()).await.unwrap();
        assert!(content.contains("\"ok\": true"));
    }
}
