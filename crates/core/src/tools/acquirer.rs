//! # Resource Acquirer
//!
//! Fetches a remote repository into a scoped temporary workspace.
//!
//! ## The Protocol
//!
//! 1. **Probe**: lightweight existence check of the URL
//! 2. **Retry**: on probe failure, wait the configured backoff and probe once more
//! 3. **Register**: create the workspace and hand it to the run's [`CleanupList`]
//! 4. **Fetch**: materialize the content inside the workspace
//!
//! The workspace is registered before the fetch starts, so a failed or
//! cancelled fetch still leaves it on the list that the coordinator drains
//! on every exit path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::error::{PipelineError, PipelineResult};

/// Probe and fetch a remote source
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Cheap check that the source exists
    async fn probe(&self, url: &str) -> Result<()>;

    /// Materialize the source at `dest` (which does not exist yet)
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// HTTP(S) probe with reqwest, clone with git2
pub struct GitFetcher {
    client: reqwest::Client,
}

impl GitFetcher {
    pub fn new(probe_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .user_agent("foundry/0.1")
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn probe(&self, url: &str) -> Result<()> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .head(url)
                .send()
                .await
                .with_context(|| format!("HEAD {} failed", url))?;
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                return Ok(());
            }
            anyhow::bail!("HEAD {} returned {}", url, status);
        }

        // ssh and scp-style URLs: ask the remote for its refs
        let url = url.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut remote = git2::Remote::create_detached(url.as_str())
                .with_context(|| format!("Invalid remote: {}", url))?;
            remote
                .connect(git2::Direction::Fetch)
                .with_context(|| format!("Failed to connect to {}", url))?;
            remote.disconnect().ok();
            Ok(())
        })
        .await
        .context("Probe task panicked")?
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            git2::build::RepoBuilder::new()
                .clone(&url, &dest)
                .with_context(|| format!("Failed to clone {} into {:?}", url, dest))?;
            Ok(())
        })
        .await
        .context("Clone task panicked")?
    }
}

/// A uniquely named scratch directory holding fetched content
#[derive(Debug)]
pub struct TempWorkspace {
    dir: TempDir,
    url: String,
}

impl TempWorkspace {
    /// Create an empty workspace under `parent` (system temp dir when `None`)
    pub fn create(url: &str, parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("foundry-src-");
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create scratch dir: {:?}", parent))?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        }
        .context("Failed to create temporary workspace")?;

        Ok(Self {
            dir,
            url: url.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Where fetched content is placed
    pub fn checkout_path(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    /// Delete the workspace, reporting any I/O error
    pub fn release(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to delete workspace {:?}", path))
    }
}

/// The outcome of releasing one workspace
#[derive(Debug, Clone)]
pub struct ReleasedWorkspace {
    pub path: PathBuf,
    pub url: String,
    pub error: Option<String>,
}

/// Scoped resources owned by one run, released when the run ends.
///
/// Dropping the list also deletes any workspace still on it.
#[derive(Debug, Default)]
pub struct CleanupList {
    workspaces: Vec<TempWorkspace>,
}

impl CleanupList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a workspace; returns its checkout path
    pub fn register(&mut self, workspace: TempWorkspace) -> PathBuf {
        let path = workspace.checkout_path();
        tracing::debug!("Registered workspace {:?} for cleanup", workspace.path());
        self.workspaces.push(workspace);
        path
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    /// Release every registered workspace, in reverse creation order
    pub fn release_all(&mut self) -> Vec<ReleasedWorkspace> {
        let mut released = Vec::with_capacity(self.workspaces.len());
        while let Some(workspace) = self.workspaces.pop() {
            let path = workspace.path().to_path_buf();
            let url = workspace.url().to_string();
            let error = match workspace.release() {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!("Workspace cleanup failed: {:#}", e);
                    Some(format!("{:#}", e))
                }
            };
            released.push(ReleasedWorkspace { path, url, error });
        }
        released
    }
}

/// Probes, retries once, then fetches into a registered workspace
pub struct ResourceAcquirer {
    fetcher: Arc<dyn SourceFetcher>,
    backoff: Duration,
    scratch_dir: Option<PathBuf>,
}

impl ResourceAcquirer {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, backoff: Duration) -> Self {
        Self {
            fetcher,
            backoff,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Acquire `url`; the workspace is on `cleanup` before any content is fetched
    pub async fn acquire(&self, url: &str, cleanup: &mut CleanupList) -> PipelineResult<PathBuf> {
        if let Err(first) = self.fetcher.probe(url).await {
            tracing::warn!(
                "Probe of {} failed ({:#}), retrying in {:?}",
                url,
                first,
                self.backoff
            );
            tokio::time::sleep(self.backoff).await;

            if let Err(second) = self.fetcher.probe(url).await {
                return Err(PipelineError::Unreachable {
                    location: url.to_string(),
                    detail: format!("probe failed twice: {:#}", second),
                });
            }
        }

        let workspace = TempWorkspace::create(url, self.scratch_dir.as_deref())?;
        let checkout = cleanup.register(workspace);

        self.fetcher
            .fetch(url, &checkout)
            .await
            .map_err(|e| PipelineError::Unreachable {
                location: url.to_string(),
                detail: format!("fetch failed: {:#}", e),
            })?;

        tracing::info!("Acquired {} into {:?}", url, checkout);
        Ok(checkout)
    }
}

/// Check that a local source path exists
pub fn resolve_local(path: &Path) -> PipelineResult<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(PipelineError::Unreachable {
            location: path.display().to_string(),
            detail: "local path does not exist".to_string(),
        })
    }
}
