//! # Workers
//!
//! The narrow interface to the opaque research and build jobs, the
//! artifact schemas they produce, and the two worker-facing components of
//! the pipeline (work-order synthesis and build delegation).
//!
//! The coordinator only ever sees [`Worker::invoke`]; what a worker does
//! internally never affects the pipeline's control flow.

pub mod artifact_registry;
pub mod builder;
pub mod command_worker;
pub mod prompts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use artifact_registry::ArtifactSchema;

pub use command_worker::{CommandSpec, CommandWorker};

/// The kinds of delegated job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    WebResearch,
    RepoAnalysis,
    Build,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebResearch => "web_research",
            Self::RepoAnalysis => "repo_analysis",
            Self::Build => "build",
        }
    }

    /// Schema the worker's artifact must conform to
    pub fn expected_schema(&self) -> ArtifactSchema {
        match self {
            Self::WebResearch | Self::RepoAnalysis => ArtifactSchema::Synthesis,
            Self::Build => ArtifactSchema::BuiltResource,
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// What a worker hands back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl WorkerReply {
    pub fn succeeded(artifact_ref: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Succeeded,
            artifact_ref: Some(artifact_ref.into()),
            error_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Failed,
            artifact_ref: None,
            error_reason: Some(reason.into()),
        }
    }

    pub fn timed_out() -> Self {
        Self {
            status: ReplyStatus::TimedOut,
            artifact_ref: None,
            error_reason: None,
        }
    }
}

/// An opaque, long-running job runner.
///
/// `input_ref` is a filesystem path or URI; on success `artifact_ref`
/// points at a JSON document of [`WorkerKind::expected_schema`].
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(
        &self,
        kind: WorkerKind,
        input_ref: &str,
        timeout: Duration,
    ) -> anyhow::Result<WorkerReply>;
}
