//! # Delegation Engine
//!
//! Dispatches worker invocations as tokio tasks bounded by a timeout and
//! collects their terminal status.
//!
//! ```text
//! Coordinator                    Worker task
//!     │                              │
//!     ├── dispatch(kind, input) ───▶ │ invoke(..) under timeout
//!     │                              │
//!     │ ◀──── WorkerReply / Elapsed ─┘
//!     │
//!     └── validate artifact → accepted or StructurallyInvalid
//! ```
//!
//! Every invocation is recorded in the engine's log and updated as it
//! settles; the log is what the completion report audits. Timeouts are
//! terminal: the engine never retries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, PipelineResult};
use crate::state::io::read_ref;
use crate::workers::artifact_registry::{
    parse_built_resource, parse_synthesis, ArtifactSchema, ArtifactSummary, BuiltResource,
    SynthesisArtifact,
};
use crate::workers::{ReplyStatus, Worker, WorkerKind, WorkerReply};

/// Lifecycle of a worker invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// One delegated unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub id: String,
    pub worker_kind: WorkerKind,
    pub input_ref: String,
    pub expected_artifact_schema: ArtifactSchema,
    pub status: InvocationStatus,
    pub dispatched_at: DateTime<Utc>,
    pub timeout_deadline: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_artifact_ref: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

type TaskOutcome = Result<anyhow::Result<WorkerReply>, tokio::time::error::Elapsed>;

/// A dispatched invocation that has not been awaited yet
pub struct InvocationHandle {
    id: String,
    kind: WorkerKind,
    timeout: Duration,
    task: JoinHandle<TaskOutcome>,
}

impl InvocationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }
}

/// Dispatches and awaits worker invocations
pub struct DelegationEngine {
    worker: Arc<dyn Worker>,
    log: Mutex<Vec<WorkerInvocation>>,
}

impl DelegationEngine {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every invocation dispatched so far, in dispatch order
    pub fn invocations(&self) -> Vec<WorkerInvocation> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn update<F: FnOnce(&mut WorkerInvocation)>(&self, id: &str, f: F) {
        if let Ok(mut log) = self.log.lock() {
            if let Some(invocation) = log.iter_mut().find(|i| i.id == id) {
                f(invocation);
            }
        }
    }

    /// Spawn the worker task; the invocation is Running once this returns
    pub fn dispatch(&self, kind: WorkerKind, input_ref: &str, timeout: Duration) -> InvocationHandle {
        let id = format!("inv-{}", uuid::Uuid::new_v4());
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let invocation = WorkerInvocation {
            id: id.clone(),
            worker_kind: kind,
            input_ref: input_ref.to_string(),
            expected_artifact_schema: kind.expected_schema(),
            status: InvocationStatus::Pending,
            dispatched_at: now,
            timeout_deadline: deadline,
            finished_at: None,
            result_artifact_ref: None,
            error_reason: None,
        };
        if let Ok(mut log) = self.log.lock() {
            log.push(invocation);
        }

        let worker = Arc::clone(&self.worker);
        let input = input_ref.to_string();
        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, worker.invoke(kind, &input, timeout)).await
        });

        self.update(&id, |i| i.status = InvocationStatus::Running);
        tracing::info!(invocation = %id, "Dispatched {} worker ({:?} bound)", kind, timeout);

        InvocationHandle {
            id,
            kind,
            timeout,
            task,
        }
    }

    /// Wait for the invocation to reach a terminal status; returns the artifact ref
    async fn settle(&self, handle: InvocationHandle) -> PipelineResult<String> {
        let InvocationHandle {
            id,
            kind,
            timeout,
            task,
        } = handle;

        let result = match task.await {
            Ok(Ok(Ok(reply))) => match reply.status {
                ReplyStatus::Succeeded => match reply.artifact_ref {
                    Some(artifact_ref) => Ok(artifact_ref),
                    None => Err(PipelineError::WorkerFailed {
                        worker: kind,
                        reason: "reported success without an artifact".to_string(),
                    }),
                },
                ReplyStatus::Failed => Err(PipelineError::WorkerFailed {
                    worker: kind,
                    reason: reply
                        .error_reason
                        .unwrap_or_else(|| "no reason given".to_string()),
                }),
                ReplyStatus::TimedOut => Err(PipelineError::WorkerTimedOut {
                    worker: kind,
                    timeout_secs: timeout.as_secs(),
                }),
            },
            Ok(Ok(Err(e))) => Err(PipelineError::WorkerFailed {
                worker: kind,
                reason: format!("{:#}", e),
            }),
            Ok(Err(_elapsed)) => Err(PipelineError::WorkerTimedOut {
                worker: kind,
                timeout_secs: timeout.as_secs(),
            }),
            Err(join_error) => Err(PipelineError::WorkerFailed {
                worker: kind,
                reason: format!("worker task aborted: {}", join_error),
            }),
        };

        let finished = Utc::now();
        match &result {
            Ok(artifact_ref) => self.update(&id, |i| {
                i.status = InvocationStatus::Succeeded;
                i.result_artifact_ref = Some(artifact_ref.clone());
                i.finished_at = Some(finished);
            }),
            Err(err) => {
                let status = match err {
                    PipelineError::WorkerTimedOut { .. } => InvocationStatus::TimedOut,
                    _ => InvocationStatus::Failed,
                };
                tracing::warn!(invocation = %id, "{} worker ended {:?}: {}", kind, status, err);
                self.update(&id, |i| {
                    i.status = status;
                    i.error_reason = Some(err.to_string());
                    i.finished_at = Some(finished);
                });
            }
        }
        result
    }

    /// Mark a succeeded invocation as failed because its artifact was rejected
    fn reject(&self, id: &str, err: &PipelineError) {
        self.update(id, |i| {
            i.status = InvocationStatus::Failed;
            i.error_reason = Some(err.to_string());
        });
    }

    /// Await a research invocation and validate its synthesis artifact
    pub async fn await_synthesis(
        &self,
        handle: InvocationHandle,
    ) -> PipelineResult<(SynthesisArtifact, ArtifactSummary)> {
        let id = handle.id.clone();
        let kind = handle.kind;
        let artifact_ref = self.settle(handle).await?;

        let loaded = load_synthesis(kind, &artifact_ref).await;
        if let Err(err) = &loaded {
            self.reject(&id, err);
        }
        loaded
    }

    /// Await a build invocation and parse its built resource
    pub async fn await_built(&self, handle: InvocationHandle) -> PipelineResult<BuiltResource> {
        let id = handle.id.clone();
        let kind = handle.kind;
        let artifact_ref = self.settle(handle).await?;

        let context = format!("{} artifact {}", kind, artifact_ref);
        let loaded = match read_ref(&artifact_ref).await {
            Ok(json) => parse_built_resource(&context, &json),
            Err(e) => Err(PipelineError::invalid(context, vec![format!("{:#}", e)])),
        };
        if let Err(err) = &loaded {
            self.reject(&id, err);
        }
        loaded
    }

    /// Await two research invocations concurrently.
    ///
    /// Both reach a terminal status before this returns; the first error
    /// (in argument order) is reported if either failed.
    pub async fn await_both(
        &self,
        first: InvocationHandle,
        second: InvocationHandle,
    ) -> PipelineResult<[(SynthesisArtifact, ArtifactSummary); 2]> {
        let (a, b) = tokio::join!(self.await_synthesis(first), self.await_synthesis(second));
        Ok([a?, b?])
    }
}

async fn load_synthesis(
    kind: WorkerKind,
    artifact_ref: &str,
) -> PipelineResult<(SynthesisArtifact, ArtifactSummary)> {
    let context = format!("{} artifact {}", kind, artifact_ref);
    let json = read_ref(artifact_ref)
        .await
        .map_err(|e| PipelineError::invalid(context.clone(), vec![format!("{:#}", e)]))?;
    let artifact = parse_synthesis(&context, &json)?;
    let summary = artifact
        .validate()
        .map_err(|problems| PipelineError::invalid(context, problems))?;
    Ok((artifact, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_artifact, FakeWorker, Script};
    use crate::workers::artifact_registry::Provenance;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_single_dispatch_succeeds_and_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(dir.path()).with_script(
            WorkerKind::WebResearch,
            Script::Artifact(sample_artifact("t", Provenance::Web)),
        );
        let engine = DelegationEngine::new(Arc::new(worker));

        let handle = engine.dispatch(WorkerKind::WebResearch, "order.md", Duration::from_secs(5));
        let (artifact, summary) = assert_ok!(engine.await_synthesis(handle).await);
        assert_eq!(artifact.target_name, "t");
        assert!(summary.total_specificity > 0);

        let log = engine.invocations();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, InvocationStatus::Succeeded);
        assert_eq!(log[0].expected_artifact_schema, ArtifactSchema::Synthesis);
        assert!(log[0].result_artifact_ref.is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(dir.path())
            .with_script(WorkerKind::WebResearch, Script::Hang);
        let engine = DelegationEngine::new(Arc::new(worker));

        let handle =
            engine.dispatch(WorkerKind::WebResearch, "order.md", Duration::from_millis(50));
        let err = engine.await_synthesis(handle).await.unwrap_err();
        assert!(matches!(err, PipelineError::WorkerTimedOut { .. }));
        assert_eq!(engine.invocations()[0].status, InvocationStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_invalid_artifact_is_failed_structurally_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = sample_artifact("t", Provenance::Repo);
        broken.anti_patterns.entries.clear();
        let worker = FakeWorker::new(dir.path())
            .with_script(WorkerKind::RepoAnalysis, Script::Artifact(broken));
        let engine = DelegationEngine::new(Arc::new(worker));

        let handle = engine.dispatch(WorkerKind::RepoAnalysis, "./repo", Duration::from_secs(5));
        let err = engine.await_synthesis(handle).await.unwrap_err();
        assert!(matches!(err, PipelineError::StructurallyInvalid { .. }));

        let log = engine.invocations();
        assert_eq!(log[0].status, InvocationStatus::Failed);
        assert!(log[0].error_reason.as_ref().unwrap().contains("anti_patterns"));
    }

    #[tokio::test]
    async fn test_worker_failure_reason_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(dir.path()).with_script(
            WorkerKind::WebResearch,
            Script::Fail("rate limited".to_string()),
        );
        let engine = DelegationEngine::new(Arc::new(worker));

        let handle = engine.dispatch(WorkerKind::WebResearch, "order.md", Duration::from_secs(5));
        match engine.await_synthesis(handle).await.unwrap_err() {
            PipelineError::WorkerFailed { worker, reason } => {
                assert_eq!(worker, WorkerKind::WebResearch);
                assert_eq!(reason, "rate limited");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hybrid_join_waits_for_both() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(dir.path())
            .with_script(
                WorkerKind::WebResearch,
                Script::Delayed(
                    Duration::from_millis(30),
                    Box::new(Script::Fail("no results".to_string())),
                ),
            )
            .with_script(
                WorkerKind::RepoAnalysis,
                Script::Delayed(
                    Duration::from_millis(100),
                    Box::new(Script::Artifact(sample_artifact("t", Provenance::Repo))),
                ),
            );
        let worker = Arc::new(worker);
        let engine = DelegationEngine::new(worker.clone());

        let web = engine.dispatch(WorkerKind::WebResearch, "order.md", Duration::from_secs(5));
        let repo = engine.dispatch(WorkerKind::RepoAnalysis, "./repo", Duration::from_secs(5));
        let err = engine.await_both(web, repo).await.unwrap_err();
        assert!(matches!(err, PipelineError::WorkerFailed { .. }));

        // the slower repo invocation still reached a terminal status (join, not race)
        let log = engine.invocations();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|i| i.status.is_terminal()));
        assert_eq!(log[1].status, InvocationStatus::Succeeded);
        assert_eq!(worker.max_concurrency(), 2);
    }
}
