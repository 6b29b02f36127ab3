//! # Pipeline Coordinator
//!
//! Drives one request through the six phases.
//!
//! ```text
//! request ─▶ 1 Input Analysis ─▶ 2 Route Selection ─▶ 3 Prompt Preparation
//!                 │ duplicate?          │ acquire source       │ (skipped on InternalRepo)
//!                 ▼                     ▼                      ▼
//!            disposition          CleanupList          4 Delegation ─▶ 5 Build ─▶ 6 Deploy
//! ```
//!
//! Each phase's exit predicate is checked before the gate moves on; the
//! first failure ends the run. Temporary workspaces are released and a
//! [`CompletionReport`] is produced on every exit path.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::delegation::{DelegationEngine, InvocationHandle};
use super::deploy::{discard_published, Deployed, Deployer};
use super::events::{PipelineEvent, PipelineEventKind};
use super::phase::PhaseGate;
use super::report::{
    self, CompletionReport, QualityMetrics, ReportInputs, ResourceAction, ResourceKind,
    ResourceRecord,
};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{InputDescriptor, Phase, PipelineRun, Route};
use crate::state::io::{ensure_run_dir, write_json};
use crate::state::{
    FoundryDb, Interaction, InteractionKind, InteractionManager, InteractionStatus,
    RegistryStore, RunArchive,
};
use crate::tools::acquirer::{
    resolve_local, CleanupList, GitFetcher, ResourceAcquirer, SourceFetcher,
};
use crate::tools::classifier::Classifier;
use crate::tools::dedup::{
    check_duplicate, narrow_target, validate_target_name, DuplicateDecision,
    DuplicateDisposition, DuplicateMatch,
};
use crate::tools::merge::merge;
use crate::tools::router::{self, RouteDecision};
use crate::tools::validator::{FormatValidator, MarkdownFormatValidator};
use crate::workers::artifact_registry::{ArtifactSummary, BuiltResource, SynthesisArtifact};
use crate::workers::builder::{check_quality, BuildDelegator};
use crate::workers::prompts::{PromptRef, PromptSynthesizer, WorkOrderDisposition};
use crate::workers::{Worker, WorkerKind};

// ============================================================================
// Dispositions
// ============================================================================

/// A choice the coordinator needs from the caller before it can continue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispositionRequest {
    /// The target overlaps registry entries
    Duplicate {
        run_id: String,
        target_name: String,
        matches: Vec<DuplicateMatch>,
    },
    /// A work-order for the target is already on disk
    ExistingWorkOrder {
        run_id: String,
        target_name: String,
        path: PathBuf,
    },
}

impl DispositionRequest {
    fn to_interaction(&self) -> Interaction {
        match self {
            Self::Duplicate {
                run_id,
                target_name,
                matches,
            } => Interaction::new(
                run_id,
                InteractionKind::Duplicate,
                format!("'{}' overlaps existing resources", target_name),
                matches
                    .iter()
                    .map(|m| format!("{} ({:.0}%)", m.name, m.overlap * 100.0))
                    .collect::<Vec<_>>()
                    .join(", "),
                &["rebuild", "narrow", "abort"],
            ),
            Self::ExistingWorkOrder {
                run_id,
                target_name,
                path,
            } => Interaction::new(
                run_id,
                InteractionKind::WorkOrder,
                format!("Work-order for '{}' already exists", target_name),
                path.display().to_string(),
                &["reuse", "regenerate"],
            ),
        }
    }
}

/// The caller's typed answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionAnswer {
    Duplicate(DuplicateDisposition),
    WorkOrder(WorkOrderDisposition),
}

/// Channel the coordinator sends disposition requests on
pub type DispositionSender = mpsc::Sender<(DispositionRequest, oneshot::Sender<DispositionAnswer>)>;

// ============================================================================
// Run State
// ============================================================================

/// What the phases of one run have produced so far
#[derive(Debug, Default)]
struct RunState {
    descriptor: Option<InputDescriptor>,
    duplicate: Option<DuplicateDecision>,
    disposition: Option<DuplicateDisposition>,
    decision: Option<RouteDecision>,
    repo_path: Option<PathBuf>,
    prompt: Option<PromptRef>,
    artifact: Option<SynthesisArtifact>,
    built: Option<BuiltResource>,
    deployed: Option<Deployed>,
    metrics: QualityMetrics,
    resources: Vec<ResourceRecord>,
}

impl RunState {
    fn record(&mut self, kind: ResourceKind, reference: impl Into<String>, action: ResourceAction) {
        self.resources
            .push(ResourceRecord::new(kind, reference, action));
    }

    /// Why `phase`'s exit predicate does not hold, if it does not
    fn exit_problem(&self, phase: Phase, route: Route, config: &PipelineConfig) -> Option<String> {
        match phase {
            Phase::InputAnalysis => match (&self.descriptor, &self.duplicate) {
                (None, _) => Some("request was not classified".to_string()),
                (_, None) => Some("duplicate check did not run".to_string()),
                (_, Some(DuplicateDecision::Conflict { .. })) if self.disposition.is_none() => {
                    Some("duplicate conflict has no disposition".to_string())
                }
                _ => None,
            },
            Phase::RouteSelection => {
                if route == Route::Unresolved {
                    Some("no route selected".to_string())
                } else if route.needs_repo_source() && self.repo_path.is_none() {
                    Some("repository source not available".to_string())
                } else {
                    None
                }
            }
            Phase::PromptPrep => (route.needs_work_order() && self.prompt.is_none())
                .then(|| "no validated work-order".to_string()),
            Phase::Delegation => match &self.artifact {
                None => Some("no synthesis artifact".to_string()),
                Some(artifact) => artifact.validate().err().map(|p| p.join("; ")),
            },
            Phase::Build => match &self.built {
                None => Some("no built resource".to_string()),
                Some(built) => {
                    let unmet = check_quality(&built.quality_report, &config.quality, &config.archetype);
                    (!unmet.is_empty()).then(|| format!("{} threshold(s) unmet", unmet.len()))
                }
            },
            Phase::Deploy => self
                .deployed
                .is_none()
                .then(|| "resource was not deployed".to_string()),
        }
    }
}

fn missing(what: &str) -> PipelineError {
    PipelineError::internal(format!("{} missing from run state", what))
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs requests through the pipeline
pub struct Coordinator {
    config: PipelineConfig,
    registry: Arc<dyn RegistryStore>,
    worker: Arc<dyn Worker>,
    fetcher: Arc<dyn SourceFetcher>,
    validator: Arc<dyn FormatValidator>,
    /// Persists interactions and archived runs when present
    db: Option<Arc<FoundryDb>>,
    /// Events of the current (or last) run
    events: Vec<PipelineEvent>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
    disposition_tx: Option<DispositionSender>,
}

impl Coordinator {
    /// Coordinator with the git fetcher and markdown validator
    pub fn new(
        config: PipelineConfig,
        registry: Arc<dyn RegistryStore>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(GitFetcher::new(config.probe_timeout)?);
        Ok(Self {
            config,
            registry,
            worker,
            fetcher,
            validator: Arc::new(MarkdownFormatValidator::default()),
            db: None,
            events: Vec::new(),
            event_tx: None,
            disposition_tx: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn FormatValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Persist dispositions and archive finished runs
    pub fn with_db(mut self, db: Arc<FoundryDb>) -> Self {
        self.db = Some(db);
        self
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Set the channel dispositions are requested on
    pub fn with_disposition_channel(mut self, tx: DispositionSender) -> Self {
        self.disposition_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    /// Emit an event
    async fn emit(&mut self, event: PipelineEvent) {
        self.events.push(event.clone());
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    async fn request_disposition(&self, request: DispositionRequest) -> Option<DispositionAnswer> {
        if let Some(tx) = &self.disposition_tx {
            let (resp_tx, resp_rx) = oneshot::channel();
            if tx.send((request, resp_tx)).await.is_ok() {
                return resp_rx.await.ok();
            }
        }
        None
    }

    /// Ask the caller and wait; `None` when no answer can be obtained.
    ///
    /// The request is persisted as an interaction first so the audit trail
    /// survives a crashed run.
    async fn ask(&mut self, request: DispositionRequest) -> Option<DispositionAnswer> {
        let interaction = request.to_interaction();
        let manager = self.db.as_ref().map(|db| InteractionManager::new(db));
        if let Some(manager) = &manager {
            if let Err(e) = manager.save(&interaction) {
                tracing::warn!("Failed to persist interaction {}: {:#}", interaction.id, e);
            }
        }

        self.emit(
            PipelineEvent::new(PipelineEventKind::DispositionRequired).with_data(
                serde_json::json!({
                    "interaction_id": interaction.id,
                    "title": interaction.title,
                    "options": interaction.options,
                }),
            ),
        )
        .await;

        let answer = self.request_disposition(request).await;

        if let Some(manager) = &manager {
            let (status, response) = match &answer {
                Some(a) => (InteractionStatus::Responded, serde_json::to_value(a).ok()),
                None => (InteractionStatus::Abandoned, None),
            };
            if let Err(e) = manager.resolve(&interaction.id, status, response.as_ref()) {
                tracing::warn!("Failed to resolve interaction {}: {:#}", interaction.id, e);
            }
        }

        self.emit(
            PipelineEvent::new(PipelineEventKind::DispositionResolved).with_data(
                serde_json::json!({
                    "interaction_id": interaction.id,
                    "answer": answer,
                }),
            ),
        )
        .await;
        answer
    }

    /// Run one request to completion.
    ///
    /// Never fails: every outcome, including errors, is in the report.
    #[tracing::instrument(skip(self), fields(request_preview = %raw_request.chars().take(50).collect::<String>()))]
    pub async fn run(&mut self, raw_request: &str) -> CompletionReport {
        self.events.clear();
        let mut gate = PhaseGate::new(PipelineRun::new());
        let run_id = gate.run().id.clone();
        tracing::info!("Starting run {}", run_id);
        self.emit(
            PipelineEvent::new(PipelineEventKind::RunStarted)
                .with_data(serde_json::json!({ "run_id": run_id })),
        )
        .await;

        let engine = DelegationEngine::new(Arc::clone(&self.worker));
        let mut state = RunState::default();
        let mut cleanup = CleanupList::new();

        let outcome = self
            .execute(raw_request, &mut gate, &mut state, &mut cleanup, &engine)
            .await;

        for released in cleanup.release_all() {
            state.record(
                ResourceKind::Workspace,
                released.path.display().to_string(),
                ResourceAction::Deleted,
            );
            self.emit(
                PipelineEvent::new(PipelineEventKind::WorkspaceReleased).with_data(
                    serde_json::json!({
                        "path": released.path,
                        "url": released.url,
                        "error": released.error,
                    }),
                ),
            )
            .await;
        }

        let failure = match outcome {
            Ok(()) => {
                tracing::info!("Run {} succeeded", run_id);
                self.emit(PipelineEvent::new(PipelineEventKind::RunCompleted))
                    .await;
                None
            }
            Err(err) => {
                gate.fail(&err);
                tracing::warn!("Run {} ended at {}: {}", run_id, gate.current(), err);
                self.emit(
                    PipelineEvent::new(PipelineEventKind::RunFailed)
                        .with_phase(gate.current())
                        .with_data(serde_json::json!({
                            "kind": err.kind(),
                            "message": err.to_string(),
                        })),
                )
                .await;
                Some(err)
            }
        };

        let inputs = ReportInputs {
            metrics: state.metrics,
            resources: state.resources,
            invocations: engine.invocations(),
            thresholds: self.config.quality.clone(),
            event_count: self.events.len(),
        };
        let report = report::generate(gate.run(), gate.records(), failure.as_ref(), inputs);
        self.persist(&report, gate.run()).await;
        report
    }

    async fn execute(
        &mut self,
        raw_request: &str,
        gate: &mut PhaseGate,
        state: &mut RunState,
        cleanup: &mut CleanupList,
        engine: &DelegationEngine,
    ) -> PipelineResult<()> {
        self.enter(gate, Phase::InputAnalysis).await?;
        let result = self.analyze_input(raw_request, gate, state).await;
        self.leave(gate, state, Phase::InputAnalysis, result).await?;

        self.enter(gate, Phase::RouteSelection).await?;
        let result = self.select_route(gate, state, cleanup).await;
        self.leave(gate, state, Phase::RouteSelection, result).await?;

        if gate.run().route == Route::InternalRepo {
            gate.skip(Phase::PromptPrep)?;
            tracing::info!("Skipping {} for {}", Phase::PromptPrep, Route::InternalRepo);
            self.emit(PipelineEvent::new(PipelineEventKind::PhaseSkipped).with_phase(Phase::PromptPrep))
                .await;
        } else {
            self.enter(gate, Phase::PromptPrep).await?;
            let result = self.prepare_prompt(gate.run(), state).await;
            self.leave(gate, state, Phase::PromptPrep, result).await?;
        }

        self.enter(gate, Phase::Delegation).await?;
        let result = self.delegate(gate.run().route, state, engine).await;
        self.leave(gate, state, Phase::Delegation, result).await?;

        self.enter(gate, Phase::Build).await?;
        let result = self.build(gate.run(), state, engine).await;
        self.leave(gate, state, Phase::Build, result).await?;

        self.enter(gate, Phase::Deploy).await?;
        let result = self.deploy(state).await;
        self.leave(gate, state, Phase::Deploy, result).await?;

        Ok(())
    }

    async fn enter(&mut self, gate: &mut PhaseGate, phase: Phase) -> PipelineResult<()> {
        gate.begin(phase)?;
        tracing::info!("Entering {}", phase);
        self.emit(PipelineEvent::new(PipelineEventKind::PhaseStarted).with_phase(phase))
            .await;
        Ok(())
    }

    /// Check the exit predicate and move the gate
    async fn leave(
        &mut self,
        gate: &mut PhaseGate,
        state: &RunState,
        phase: Phase,
        result: PipelineResult<()>,
    ) -> PipelineResult<()> {
        let route = gate.run().route;
        let result = result.and_then(|()| match state.exit_problem(phase, route, &self.config) {
            None => Ok(()),
            Some(problem) => Err(PipelineError::internal(format!(
                "exit predicate of {} unmet: {}",
                phase, problem
            ))),
        });

        match result {
            Ok(()) => {
                gate.pass(phase)?;
                self.emit(PipelineEvent::new(PipelineEventKind::PhasePassed).with_phase(phase))
                    .await;
                Ok(())
            }
            Err(err) => {
                gate.fail(&err);
                self.emit(
                    PipelineEvent::new(PipelineEventKind::PhaseFailed)
                        .with_phase(phase)
                        .with_data(serde_json::json!({
                            "kind": err.kind(),
                            "message": err.to_string(),
                        })),
                )
                .await;
                Err(err)
            }
        }
    }

    // === Phase 1 ===

    async fn analyze_input(
        &mut self,
        raw_request: &str,
        gate: &mut PhaseGate,
        state: &mut RunState,
    ) -> PipelineResult<()> {
        let mut descriptor = Classifier::new(&self.config.work_order_patterns).classify(raw_request);
        validate_target_name(&descriptor.target_name).map_err(|reason| {
            PipelineError::InvalidTargetName {
                name: descriptor.target_name.clone(),
                reason,
            }
        })?;
        gate.set_target(&descriptor.target_name)?;

        let decision = check_duplicate(
            self.registry.as_ref(),
            &descriptor.target_name,
            &descriptor.target_purpose,
            self.config.duplicate_threshold,
        )?;

        if let DuplicateDecision::Conflict { matches } = &decision {
            let request = DispositionRequest::Duplicate {
                run_id: gate.run().id.clone(),
                target_name: descriptor.target_name.clone(),
                matches: matches.clone(),
            };
            let disposition = match self.ask(request).await {
                Some(DispositionAnswer::Duplicate(disposition)) => disposition,
                _ => {
                    return Err(PipelineError::DuplicateUnresolved {
                        target_name: descriptor.target_name.clone(),
                        matches: matches.iter().map(|m| m.name.clone()).collect(),
                    })
                }
            };

            match &disposition {
                DuplicateDisposition::Abort => {
                    return Err(PipelineError::Aborted {
                        phase: Phase::InputAnalysis,
                    })
                }
                DuplicateDisposition::Narrow(suffix) => {
                    let narrowed =
                        narrow_target(self.registry.as_ref(), &descriptor.target_name, suffix)?;
                    tracing::info!("Narrowed '{}' to '{}'", descriptor.target_name, narrowed);
                    gate.set_target(&narrowed)?;
                    descriptor = descriptor.renamed(narrowed);
                }
                DuplicateDisposition::Rebuild => {
                    let removed =
                        discard_published(&self.config.deploy_dir, &descriptor.target_name).await?;
                    for path in removed {
                        state.record(
                            ResourceKind::DeployedResource,
                            path.display().to_string(),
                            ResourceAction::Deleted,
                        );
                    }
                }
            }
            state.disposition = Some(disposition);
        }

        state.duplicate = Some(decision);
        state.descriptor = Some(descriptor);
        Ok(())
    }

    // === Phase 2 ===

    async fn select_route(
        &mut self,
        gate: &mut PhaseGate,
        state: &mut RunState,
        cleanup: &mut CleanupList,
    ) -> PipelineResult<()> {
        let descriptor = state.descriptor.clone().ok_or_else(|| missing("descriptor"))?;
        let decision = router::route(&descriptor);
        gate.set_route(decision.route)?;
        state.decision = Some(decision);

        if !decision.route.needs_repo_source() {
            return Ok(());
        }

        let repo_path = if let Some(local) = &descriptor.local_path {
            resolve_local(local)?
        } else if let Some(url) = &descriptor.remote_url {
            let acquirer = ResourceAcquirer::new(Arc::clone(&self.fetcher), self.config.probe_backoff)
                .with_scratch_dir(self.config.scratch_dir.clone());
            let checkout = acquirer.acquire(url, cleanup).await?;
            state.record(
                ResourceKind::Workspace,
                checkout.display().to_string(),
                ResourceAction::Created,
            );
            self.emit(
                PipelineEvent::new(PipelineEventKind::WorkspaceAcquired)
                    .with_phase(Phase::RouteSelection)
                    .with_data(serde_json::json!({ "url": url, "path": checkout })),
            )
            .await;
            checkout
        } else {
            return Err(PipelineError::RouteUnsatisfiable {
                route: decision.route,
                detail: "the request names no local path or repository URL".to_string(),
            });
        };

        state.repo_path = Some(repo_path);
        Ok(())
    }

    // === Phase 3 ===

    async fn prepare_prompt(&mut self, run: &PipelineRun, state: &mut RunState) -> PipelineResult<()> {
        let descriptor = state.descriptor.clone().ok_or_else(|| missing("descriptor"))?;
        let decision = state.decision.ok_or_else(|| missing("route decision"))?;
        let synthesizer = PromptSynthesizer::new(self.config.work_order_dir.clone());

        let (prompt, action) = match (&descriptor.prompt_file, decision.uses_existing_prompt) {
            (Some(path), true) => (synthesizer.reuse(path).await?, ResourceAction::Read),
            _ => match synthesizer.existing(&descriptor.target_name) {
                None => (
                    synthesizer
                        .synthesize(&descriptor, decision.route, false)
                        .await?,
                    ResourceAction::Created,
                ),
                Some(path) => {
                    let request = DispositionRequest::ExistingWorkOrder {
                        run_id: run.id.clone(),
                        target_name: descriptor.target_name.clone(),
                        path: path.clone(),
                    };
                    match self.ask(request).await {
                        Some(DispositionAnswer::WorkOrder(WorkOrderDisposition::Reuse)) => {
                            (synthesizer.reuse(&path).await?, ResourceAction::Read)
                        }
                        Some(DispositionAnswer::WorkOrder(WorkOrderDisposition::Regenerate)) => (
                            synthesizer
                                .synthesize(&descriptor, decision.route, true)
                                .await?,
                            ResourceAction::Modified,
                        ),
                        _ => {
                            return Err(PipelineError::DispositionUnavailable {
                                detail: format!(
                                    "no reuse/regenerate answer for {}",
                                    path.display()
                                ),
                            })
                        }
                    }
                }
            },
        };

        state.record(ResourceKind::WorkOrder, prompt.path.display().to_string(), action);
        state.prompt = Some(prompt);
        Ok(())
    }

    // === Phase 4 ===

    async fn announce(&mut self, handle: &InvocationHandle, input_ref: &str) {
        self.emit(
            PipelineEvent::new(PipelineEventKind::WorkerDispatched)
                .with_phase(Phase::Delegation)
                .with_data(serde_json::json!({
                    "invocation_id": handle.id(),
                    "kind": handle.kind(),
                    "input_ref": input_ref,
                })),
        )
        .await;
    }

    /// Emit a finished event for every terminal invocation not yet reported
    async fn report_finished(&mut self, engine: &DelegationEngine, ids: &[String]) {
        for invocation in engine.invocations() {
            if !ids.contains(&invocation.id) || !invocation.status.is_terminal() {
                continue;
            }
            self.emit(
                PipelineEvent::new(PipelineEventKind::WorkerFinished).with_data(
                    serde_json::json!({
                        "invocation_id": invocation.id,
                        "kind": invocation.worker_kind,
                        "status": invocation.status,
                        "error": invocation.error_reason,
                    }),
                ),
            )
            .await;
        }
    }

    async fn delegate(
        &mut self,
        route: Route,
        state: &mut RunState,
        engine: &DelegationEngine,
    ) -> PipelineResult<()> {
        let work_order = state
            .prompt
            .as_ref()
            .map(|p| p.path.to_string_lossy().to_string());
        let repo_path = state
            .repo_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        let input_for = |kind: WorkerKind| -> PipelineResult<String> {
            match kind {
                WorkerKind::WebResearch => work_order.clone().ok_or_else(|| missing("work-order")),
                _ => repo_path.clone().ok_or_else(|| missing("repository path")),
            }
        };

        let timeouts = self.config.timeouts.clone();
        let (artifact, summary): (SynthesisArtifact, ArtifactSummary) = match route {
            Route::WebResearch | Route::InternalRepo => {
                let kind = if route == Route::WebResearch {
                    WorkerKind::WebResearch
                } else {
                    WorkerKind::RepoAnalysis
                };
                let input = input_for(kind)?;
                let handle = engine.dispatch(kind, &input, timeouts.for_kind(kind));
                let id = handle.id().to_string();
                self.announce(&handle, &input).await;
                let result = engine.await_synthesis(handle).await;
                self.report_finished(engine, &[id]).await;
                result?
            }
            Route::Hybrid => {
                let web_input = input_for(WorkerKind::WebResearch)?;
                let repo_input = input_for(WorkerKind::RepoAnalysis)?;
                let web = engine.dispatch(
                    WorkerKind::WebResearch,
                    &web_input,
                    timeouts.web_research,
                );
                let repo = engine.dispatch(
                    WorkerKind::RepoAnalysis,
                    &repo_input,
                    timeouts.repo_analysis,
                );
                let ids = vec![web.id().to_string(), repo.id().to_string()];
                self.announce(&web, &web_input).await;
                self.announce(&repo, &repo_input).await;

                let result = engine.await_both(web, repo).await;
                self.report_finished(engine, &ids).await;
                let [(web_artifact, _), (repo_artifact, _)] = result?;

                let merged = merge(&web_artifact, &repo_artifact);
                let summary = merged
                    .validate()
                    .map_err(|problems| PipelineError::invalid("merged artifact", problems))?;
                tracing::info!(
                    "Merged web and repository artifacts ({} contradiction(s))",
                    summary.contradictions
                );
                (merged, summary)
            }
            Route::Unresolved => return Err(missing("route")),
        };

        state.metrics.artifact = Some(summary);
        state.artifact = Some(artifact);
        Ok(())
    }

    // === Phase 5 ===

    async fn build(
        &mut self,
        run: &PipelineRun,
        state: &mut RunState,
        engine: &DelegationEngine,
    ) -> PipelineResult<()> {
        let artifact = state.artifact.clone().ok_or_else(|| missing("artifact"))?;
        let run_dir = ensure_run_dir(&self.config.runs_dir(), &run.id).await?;

        self.emit(
            PipelineEvent::new(PipelineEventKind::WorkerDispatched)
                .with_phase(Phase::Build)
                .with_data(serde_json::json!({ "kind": WorkerKind::Build })),
        )
        .await;
        let before: Vec<String> = engine.invocations().into_iter().map(|i| i.id).collect();

        let result = BuildDelegator::new(
            engine,
            &self.config.quality,
            &self.config.archetype,
            self.config.timeouts.build,
        )
        .request_build(&artifact, &run.target_name, &run_dir)
        .await;

        let new_ids: Vec<String> = engine
            .invocations()
            .into_iter()
            .map(|i| i.id)
            .filter(|id| !before.contains(id))
            .collect();
        self.report_finished(engine, &new_ids).await;

        state.record(
            ResourceKind::SynthesisArtifact,
            run_dir.join("artifact.json").display().to_string(),
            ResourceAction::Created,
        );
        state.record(
            ResourceKind::BuildOrder,
            run_dir.join("build-order.json").display().to_string(),
            ResourceAction::Created,
        );
        let built = result?;
        state.record(
            ResourceKind::BuiltResource,
            built.resource_ref.clone(),
            ResourceAction::Created,
        );

        state.metrics.quality_report = Some(built.quality_report.clone());
        state.metrics.unmet_thresholds =
            check_quality(&built.quality_report, &self.config.quality, &self.config.archetype);
        BuildDelegator::new(
            engine,
            &self.config.quality,
            &self.config.archetype,
            self.config.timeouts.build,
        )
        .enforce(&built)?;

        state.built = Some(built);
        Ok(())
    }

    // === Phase 6 ===

    async fn deploy(&mut self, state: &mut RunState) -> PipelineResult<()> {
        let built = state.built.clone().ok_or_else(|| missing("built resource"))?;
        let descriptor = state.descriptor.clone().ok_or_else(|| missing("descriptor"))?;

        let deployed = Deployer::new(
            self.validator.as_ref(),
            self.registry.as_ref(),
            &self.config.deploy_dir,
        )
        .deploy(
            &built,
            &descriptor.target_name,
            &descriptor.target_purpose,
            &self.config.archetype.name,
        )
        .await?;

        let action = if deployed.replaced_previous {
            ResourceAction::Modified
        } else {
            ResourceAction::Created
        };
        state.record(
            ResourceKind::DeployedResource,
            deployed.resource_path.display().to_string(),
            action,
        );
        state.record(
            ResourceKind::RegistryEntry,
            format!("{} v{}", deployed.entry.name, deployed.entry.version),
            action,
        );
        self.emit(
            PipelineEvent::new(PipelineEventKind::ResourceDeployed)
                .with_phase(Phase::Deploy)
                .with_data(serde_json::json!({
                    "path": deployed.resource_path,
                    "name": deployed.entry.name,
                    "version": deployed.entry.version,
                })),
        )
        .await;

        state.deployed = Some(deployed);
        Ok(())
    }

    /// Write the report into the run directory and archive the run
    async fn persist(&self, report: &CompletionReport, run: &PipelineRun) {
        match ensure_run_dir(&self.config.runs_dir(), &run.id).await {
            Ok(dir) => {
                if let Err(e) = write_json(&dir.join("report.json"), report).await {
                    tracing::warn!("Failed to write report.json: {:#}", e);
                }
                if let Err(e) = tokio::fs::write(dir.join("report.md"), report.to_markdown()).await {
                    tracing::warn!("Failed to write report.md: {}", e);
                }
            }
            Err(e) => tracing::warn!("No run directory for report: {:#}", e),
        }

        if let Some(db) = &self.db {
            if let Err(e) = RunArchive::new(db).archive(run, &report.to_json()) {
                tracing::warn!("Failed to archive run {}: {:#}", run.id, e);
            }
        }
    }
}
