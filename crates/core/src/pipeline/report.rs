//! # Completion Report
//!
//! Produced for every run, passing or failing. The phase table always has
//! six rows: phases before a failure show PASS (or SKIPPED), the failing
//! phase shows FAIL with its reason, and later phases show NOT RUN.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use super::delegation::{InvocationStatus, WorkerInvocation};
use super::phase::{PhaseOutcome, PhaseRecord};
use crate::config::QualityThresholds;
use crate::error::{FailureKind, PipelineError};
use crate::models::{Phase, PipelineRun, Route, RunStatus};
use crate::workers::artifact_registry::{ArtifactSummary, QualityReport};
use crate::workers::builder::UnmetThreshold;

/// One row of the phase table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "NOT_RUN")]
    NotRun,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Skipped => "SKIPPED",
            Self::NotRun => "NOT RUN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRow {
    pub phase: Phase,
    pub number: u8,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub phase: Phase,
    pub kind: FailureKind,
    pub message: String,
}

/// What was done to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    Created,
    Modified,
    Read,
    Deleted,
}

/// Kind of resource a run touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    WorkOrder,
    Workspace,
    SynthesisArtifact,
    BuildOrder,
    BuiltResource,
    DeployedResource,
    RegistryEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub reference: String,
    pub action: ResourceAction,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, reference: impl Into<String>, action: ResourceAction) -> Self {
        Self {
            kind,
            reference: reference.into(),
            action,
        }
    }
}

/// Artifact and build quality figures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(default)]
    pub artifact: Option<ArtifactSummary>,
    #[serde(default)]
    pub quality_report: Option<QualityReport>,
    #[serde(default)]
    pub unmet_thresholds: Vec<UnmetThreshold>,
}

/// Everything the report is generated from
#[derive(Debug, Default)]
pub struct ReportInputs {
    pub metrics: QualityMetrics,
    pub resources: Vec<ResourceRecord>,
    pub invocations: Vec<WorkerInvocation>,
    pub thresholds: QualityThresholds,
    pub event_count: usize,
}

/// Final report handed back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub run_id: String,
    pub target_name: String,
    pub route: Route,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<FailureSummary>,
    pub phases: Vec<PhaseRow>,
    pub metrics: QualityMetrics,
    pub resources: Vec<ResourceRecord>,
    pub invocations: Vec<WorkerInvocation>,
    pub follow_ups: Vec<String>,
    pub event_count: usize,
}

fn phase_rows(records: &[PhaseRecord]) -> Vec<PhaseRow> {
    Phase::ALL
        .iter()
        .map(|phase| {
            let record = records.iter().find(|r| r.phase == *phase);
            let (status, reason) = match record {
                Some(r) => match r.outcome {
                    PhaseOutcome::Passed => (PhaseStatus::Pass, None),
                    PhaseOutcome::Skipped => (PhaseStatus::Skipped, None),
                    PhaseOutcome::Failed => (PhaseStatus::Fail, r.reason.clone()),
                },
                None => (PhaseStatus::NotRun, None),
            };
            PhaseRow {
                phase: *phase,
                number: phase.number(),
                name: phase.display_name().to_string(),
                status,
                reason,
            }
        })
        .collect()
}

fn remediation(err: &PipelineError) -> String {
    match err {
        PipelineError::DuplicateUnresolved { matches, .. } => format!(
            "Choose Rebuild, Narrow or Abort for the overlap with {} and rerun",
            matches.join(", ")
        ),
        PipelineError::Unreachable { location, .. } => {
            format!("Check that {} exists and is accessible, then rerun", location)
        }
        PipelineError::StructurallyInvalid { context, .. } => {
            format!("Inspect {} and fix the worker output format", context)
        }
        PipelineError::WorkerFailed { worker, .. } => {
            format!("Review the {} worker logs before rerunning", worker)
        }
        PipelineError::WorkerTimedOut {
            worker,
            timeout_secs,
        } => format!(
            "The {} worker exceeded {}s; narrow the request scope or raise its timeout",
            worker, timeout_secs
        ),
        PipelineError::QualityThresholdUnmet { unmet } => format!(
            "Strengthen the research artifact, then rebuild ({})",
            unmet
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        PipelineError::ValidationFailed { .. } => {
            "Fix the format diagnostics in the built resource and redeploy".to_string()
        }
        PipelineError::Aborted { .. } => "Run was aborted; no action required".to_string(),
        PipelineError::InvalidTargetName { name, .. } => {
            format!("Pick a different name than '{}'", name)
        }
        PipelineError::RouteUnsatisfiable { route, .. } => {
            format!("Provide a repository path or URL for route {}", route)
        }
        PipelineError::DispositionUnavailable { .. } => {
            "Attach a disposition channel so the run can ask for a choice".to_string()
        }
        PipelineError::Internal { .. } => "Check runtime directory permissions and logs".to_string(),
    }
}

fn follow_ups(
    run: &PipelineRun,
    failure: Option<(Phase, &PipelineError)>,
    inputs: &ReportInputs,
) -> Vec<String> {
    let mut actions = Vec::new();

    if let Some((phase, err)) = failure {
        actions.push(format!("{}: {}", phase, remediation(err)));
    }

    if let Some(summary) = &inputs.metrics.artifact {
        for category in &summary.gapped {
            actions.push(format!("Fill the {} gap with another research pass", category));
        }
        if summary.total_specificity < inputs.thresholds.min_specificity {
            actions.push(format!(
                "Artifact specificity {} is below {}; expect a weak build",
                summary.total_specificity, inputs.thresholds.min_specificity
            ));
        }
        if summary.contradictions > 0 {
            actions.push(format!(
                "Resolve {} contradiction(s) between web and repository guidance",
                summary.contradictions
            ));
        }
    }

    if run.status == RunStatus::Succeeded {
        if let Some(deployed) = inputs
            .resources
            .iter()
            .find(|r| r.kind == ResourceKind::DeployedResource && r.action != ResourceAction::Deleted)
        {
            actions.push(format!("Review the deployed resource at {}", deployed.reference));
        }
    }

    actions
}

/// Build the report for a finished run
pub fn generate(
    run: &PipelineRun,
    records: &[PhaseRecord],
    failure: Option<&PipelineError>,
    inputs: ReportInputs,
) -> CompletionReport {
    let failed_phase = records
        .iter()
        .find(|r| r.outcome == PhaseOutcome::Failed)
        .map(|r| r.phase)
        .unwrap_or(run.current_phase);
    let failure_pair = failure.map(|err| (failed_phase, err));

    CompletionReport {
        run_id: run.id.clone(),
        target_name: run.target_name.clone(),
        route: run.route,
        status: run.status,
        started_at: run.started_at,
        ended_at: run.ended_at,
        failure: failure_pair.map(|(phase, err)| FailureSummary {
            phase,
            kind: err.kind(),
            message: err.to_string(),
        }),
        phases: phase_rows(records),
        follow_ups: follow_ups(run, failure_pair, &inputs),
        metrics: inputs.metrics,
        resources: inputs.resources,
        invocations: inputs.invocations,
        event_count: inputs.event_count,
    }
}

impl CompletionReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phases
            .iter()
            .find(|r| r.phase == phase)
            .map(|r| r.status)
            .unwrap_or(PhaseStatus::NotRun)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "run_id": self.run_id, "error": e.to_string() })
        })
    }

    /// Human-readable rendering
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Pipeline Report: {}", self.target_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "- Run: `{}`", self.run_id);
        let _ = writeln!(out, "- Route: {}", self.route);
        let _ = writeln!(out, "- Status: {}", self.status.as_str());
        if let Some(failure) = &self.failure {
            let _ = writeln!(
                out,
                "- Failure: {} at {} ({})",
                failure.kind.as_str(),
                failure.phase,
                failure.message
            );
        }

        let _ = writeln!(out, "\n## Phases\n");
        let _ = writeln!(out, "| # | Phase | Status | Reason |");
        let _ = writeln!(out, "|---|-------|--------|--------|");
        for row in &self.phases {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                row.number,
                row.name,
                row.status.as_str(),
                row.reason.as_deref().unwrap_or("")
            );
        }

        let _ = writeln!(out, "\n## Quality\n");
        match &self.metrics.artifact {
            Some(summary) => {
                let _ = writeln!(out, "- Artifact specificity: {}", summary.total_specificity);
                for (category, count) in &summary.entry_counts {
                    let _ = writeln!(out, "- {}: {} entries", category, count);
                }
                if !summary.gapped.is_empty() {
                    let _ = writeln!(out, "- Gapped: {}", summary.gapped.join(", "));
                }
                let _ = writeln!(out, "- Contradictions: {}", summary.contradictions);
            }
            None => {
                let _ = writeln!(out, "- No artifact produced");
            }
        }
        if let Some(report) = &self.metrics.quality_report {
            let _ = writeln!(
                out,
                "- Build: specificity {}, decision frameworks {}, placeholders {}",
                report.specificity_score, report.decision_framework_count, report.placeholder_count
            );
        }
        for unmet in &self.metrics.unmet_thresholds {
            let _ = writeln!(out, "- Unmet: {}", unmet);
        }

        let _ = writeln!(out, "\n## Workers\n");
        for invocation in &self.invocations {
            let status = match invocation.status {
                InvocationStatus::Succeeded => "succeeded",
                InvocationStatus::Failed => "failed",
                InvocationStatus::TimedOut => "timed out",
                InvocationStatus::Pending | InvocationStatus::Running => "unfinished",
            };
            let _ = writeln!(
                out,
                "- {} ({}): {}{}",
                invocation.worker_kind,
                invocation.id,
                status,
                invocation
                    .error_reason
                    .as_ref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
        }

        let _ = writeln!(out, "\n## Resources\n");
        for resource in &self.resources {
            let _ = writeln!(
                out,
                "- {:?} {:?}: {}",
                resource.action, resource.kind, resource.reference
            );
        }

        let _ = writeln!(out, "\n## Follow-up\n");
        if self.follow_ups.is_empty() {
            let _ = writeln!(out, "- None");
        }
        for action in &self.follow_ups {
            let _ = writeln!(out, "- {}", action);
        }
        out
    }
}
