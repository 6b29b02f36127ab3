//! # Foundry Models
//!
//! Core data types shared by every pipeline phase: the run record, the
//! classifier output, routes, phases and registry entries.
//!
//! Artifact schemas produced by workers live in
//! [`crate::workers::artifact_registry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Execution path chosen by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Not yet routed (only valid before Phase 2)
    #[default]
    Unresolved,
    /// Single web-research worker
    WebResearch,
    /// Single repository-analysis worker
    InternalRepo,
    /// Both research workers concurrently, merged afterwards
    Hybrid,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::WebResearch => "web_research",
            Self::InternalRepo => "internal_repo",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether the route dispatches the repository-analysis worker
    pub fn needs_repo_source(&self) -> bool {
        matches!(self, Self::InternalRepo | Self::Hybrid)
    }

    /// Whether the route dispatches the web-research worker (and so needs a work-order)
    pub fn needs_work_order(&self) -> bool {
        matches!(self, Self::WebResearch | Self::Hybrid)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six ordered phases of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InputAnalysis,
    RouteSelection,
    PromptPrep,
    Delegation,
    Build,
    Deploy,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 6] = [
        Phase::InputAnalysis,
        Phase::RouteSelection,
        Phase::PromptPrep,
        Phase::Delegation,
        Phase::Build,
        Phase::Deploy,
    ];

    /// 1-based phase number
    pub fn number(&self) -> u8 {
        match self {
            Self::InputAnalysis => 1,
            Self::RouteSelection => 2,
            Self::PromptPrep => 3,
            Self::Delegation => 4,
            Self::Build => 5,
            Self::Deploy => 6,
        }
    }

    /// The phase that follows this one, `None` after Deploy
    pub fn next(&self) -> Option<Phase> {
        match self {
            Self::InputAnalysis => Some(Self::RouteSelection),
            Self::RouteSelection => Some(Self::PromptPrep),
            Self::PromptPrep => Some(Self::Delegation),
            Self::Delegation => Some(Self::Build),
            Self::Build => Some(Self::Deploy),
            Self::Deploy => None,
        }
    }

    /// Display name for reports
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::InputAnalysis => "Input Analysis",
            Self::RouteSelection => "Route Selection",
            Self::PromptPrep => "Prompt Preparation",
            Self::Delegation => "Delegation",
            Self::Build => "Build",
            Self::Deploy => "Deploy",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {} ({})", self.number(), self.display_name())
    }
}

/// Terminal or running status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One end-to-end execution of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    /// Normalized target identifier (empty until Phase 1 classifies the request)
    pub target_name: String,
    pub route: Route,
    pub current_phase: Phase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_name: String::new(),
            route: Route::Unresolved,
            current_phase: Phase::InputAnalysis,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Input-source signals detected in a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSignals {
    pub has_local_path: bool,
    pub has_remote_url: bool,
    pub has_existing_prompt_file: bool,
    pub has_free_text_domain: bool,
    /// Route named explicitly by the caller (`mode: hybrid`, `--repo-only`, ...)
    #[serde(default)]
    pub explicit_mode_override: Option<Route>,
}

impl SourceSignals {
    /// Local path or remote URL present
    pub fn has_repo_source(&self) -> bool {
        self.has_local_path || self.has_remote_url
    }
}

/// Immutable result of classifying a raw request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub raw_request: String,
    pub target_name: String,
    pub target_purpose: String,
    pub source_signals: SourceSignals,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
    /// Request text with source references and creation verbs stripped
    pub domain_text: String,
    pub classifier_version: u32,
}

impl InputDescriptor {
    /// Copy of this descriptor with a different target name (for Narrow dispositions)
    pub fn renamed(&self, target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..self.clone()
        }
    }
}

/// A persisted record of a previously created resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Unique across the store
    pub name: String,
    pub keywords: BTreeSet<String>,
    pub category: String,
    pub version: u32,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.into_iter().collect(),
            category: String::new(),
            version: 1,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}
