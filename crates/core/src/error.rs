//! # Pipeline Errors
//!
//! Every failure kind is terminal for the run. The flat [`FailureKind`] is
//! what reports and archived runs record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Phase, Route};
use crate::workers::builder::UnmetThreshold;
use crate::workers::WorkerKind;

/// Result alias for pipeline policy operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// A terminal pipeline failure
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    /// Registry overlap found and no usable disposition was given
    #[error("'{target_name}' overlaps existing resource(s) {matches:?} and no disposition was given")]
    DuplicateUnresolved {
        target_name: String,
        matches: Vec<String>,
    },

    /// Remote source failed its probe twice, or a local path does not exist
    #[error("source unreachable: {location} ({detail})")]
    Unreachable { location: String, detail: String },

    /// Artifact or work-order failed its structural check
    #[error("{context} is structurally invalid: {}", .problems.join("; "))]
    StructurallyInvalid {
        context: String,
        problems: Vec<String>,
    },

    #[error("{worker} worker failed: {reason}")]
    WorkerFailed { worker: WorkerKind, reason: String },

    #[error("{worker} worker timed out after {timeout_secs}s")]
    WorkerTimedOut {
        worker: WorkerKind,
        timeout_secs: u64,
    },

    #[error("quality thresholds unmet: {}", describe_unmet(.unmet))]
    QualityThresholdUnmet { unmet: Vec<UnmetThreshold> },

    /// Format validator rejected the built resource; nothing was published
    #[error("format validation failed: {}", .diagnostics.join("; "))]
    ValidationFailed { diagnostics: Vec<String> },

    /// The caller chose Abort at a disposition
    #[error("aborted by caller during {phase}")]
    Aborted { phase: Phase },

    #[error("invalid target name '{name}': {reason}")]
    InvalidTargetName { name: String, reason: String },

    /// The route needs a source the request does not provide
    #[error("route {route} cannot be satisfied: {detail}")]
    RouteUnsatisfiable { route: Route, detail: String },

    /// A disposition was required but could not be obtained
    #[error("disposition unavailable: {detail}")]
    DispositionUnavailable { detail: String },

    /// I/O, storage or serialization failure
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl PipelineError {
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    pub fn invalid(context: impl Into<String>, problems: Vec<String>) -> Self {
        Self::StructurallyInvalid {
            context: context.into(),
            problems,
        }
    }

    /// Flat classification for reports
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::DuplicateUnresolved { .. } => FailureKind::DuplicateUnresolved,
            Self::Unreachable { .. } => FailureKind::Unreachable,
            Self::StructurallyInvalid { .. } => FailureKind::StructurallyInvalid,
            Self::WorkerFailed { .. } => FailureKind::WorkerFailed,
            Self::WorkerTimedOut { .. } => FailureKind::WorkerTimedOut,
            Self::QualityThresholdUnmet { .. } => FailureKind::QualityThresholdUnmet,
            Self::ValidationFailed { .. } => FailureKind::ValidationFailed,
            Self::Aborted { .. } => FailureKind::Aborted,
            Self::InvalidTargetName { .. } => FailureKind::InvalidTargetName,
            Self::RouteUnsatisfiable { .. } => FailureKind::RouteUnsatisfiable,
            Self::DispositionUnavailable { .. } => FailureKind::DispositionUnavailable,
            Self::Internal { .. } => FailureKind::Internal,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            detail: format!("{:#}", err),
        }
    }
}

/// Flat failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DuplicateUnresolved,
    Unreachable,
    StructurallyInvalid,
    WorkerFailed,
    WorkerTimedOut,
    QualityThresholdUnmet,
    ValidationFailed,
    Aborted,
    InvalidTargetName,
    RouteUnsatisfiable,
    DispositionUnavailable,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateUnresolved => "DuplicateUnresolved",
            Self::Unreachable => "Unreachable",
            Self::StructurallyInvalid => "StructurallyInvalid",
            Self::WorkerFailed => "WorkerFailed",
            Self::WorkerTimedOut => "WorkerTimedOut",
            Self::QualityThresholdUnmet => "QualityThresholdUnmet",
            Self::ValidationFailed => "ValidationFailed",
            Self::Aborted => "Aborted",
            Self::InvalidTargetName => "InvalidTargetName",
            Self::RouteUnsatisfiable => "RouteUnsatisfiable",
            Self::DispositionUnavailable => "DispositionUnavailable",
            Self::Internal => "Internal",
        }
    }
}

fn describe_unmet(unmet: &[UnmetThreshold]) -> String {
    unmet
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
