//! Test doubles and fixtures shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Archetype;
use crate::tools::acquirer::SourceFetcher;
use crate::workers::artifact_registry::{
    BuiltResource, Category, Entry, Provenance, QualityReport, Stance, SynthesisArtifact,
};
use crate::workers::{Worker, WorkerKind, WorkerReply};

// ============================================================================
// Fixtures
// ============================================================================

fn entries(prefix: &str, count: usize, provenance: Provenance) -> Vec<Entry> {
    (0..count)
        .map(|i| {
            Entry::new(
                format!("{} {}", prefix, i + 1),
                format!("Concrete guidance {} for {}", i + 1, prefix),
                provenance,
                2,
            )
        })
        .collect()
}

/// Fully populated artifact; content does not depend on `provenance`
pub fn sample_artifact(target_name: &str, provenance: Provenance) -> SynthesisArtifact {
    SynthesisArtifact {
        target_name: target_name.to_string(),
        core_knowledge: Category::populated(entries("concept", 4, provenance)),
        decision_frameworks: Category::populated(
            entries("decision", 5, provenance)
                .into_iter()
                .map(|e| e.with_stance(Stance::Recommend))
                .collect(),
        ),
        anti_patterns: Category::populated(
            entries("mistake", 3, provenance)
                .into_iter()
                .map(|e| e.with_stance(Stance::Avoid))
                .collect(),
        ),
        tool_map: Category::populated(entries("tool", 3, provenance)),
        interaction_scripts: Category::populated(entries("script", 3, provenance)),
    }
}

/// A report that passes the default thresholds
pub fn sample_quality_report() -> QualityReport {
    QualityReport {
        specificity_score: 34,
        decision_framework_count: 6,
        placeholder_count: 0,
        section_coverage: Archetype::default().mandated_sections,
    }
}

/// Markdown a default format validator accepts
pub fn resource_markdown(target_name: &str) -> String {
    let mut content = format!(
        "---\nname: {}\ndescription: Domain expert for {}\n---\n",
        target_name,
        target_name.replace('-', " ")
    );
    for section in Archetype::default().mandated_sections {
        content.push_str(&format!("\n# {}\n\nGuidance.\n", section));
    }
    content
}

// ============================================================================
// Fake Worker
// ============================================================================

/// Scripted behaviour of a fake worker for one kind
#[derive(Debug, Clone)]
pub enum Script {
    /// Write the synthesis artifact and succeed
    Artifact(SynthesisArtifact),
    /// Write a resource file with `content` and a built-resource document
    Built {
        report: QualityReport,
        content: String,
    },
    /// Write arbitrary text as the artifact and succeed
    Raw(String),
    Fail(String),
    /// Never finish
    Hang,
    Delayed(Duration, Box<Script>),
}

impl Script {
    pub fn good_build(target_name: &str) -> Self {
        Self::Built {
            report: sample_quality_report(),
            content: resource_markdown(target_name),
        }
    }

    pub fn build_with_report(target_name: &str, report: QualityReport) -> Self {
        Self::Built {
            report,
            content: resource_markdown(target_name),
        }
    }
}

/// [`Worker`] that follows a [`Script`] per kind and records its calls
pub struct FakeWorker {
    dir: PathBuf,
    scripts: HashMap<WorkerKind, Script>,
    calls: Mutex<Vec<(WorkerKind, String)>>,
    counter: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeWorker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scripts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, kind: WorkerKind, script: Script) -> Self {
        self.scripts.insert(kind, script);
        self
    }

    /// `(kind, input_ref)` of every invocation, in call order
    pub fn calls(&self) -> Vec<(WorkerKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn write(&self, kind: WorkerKind, suffix: &str, content: &str) -> Result<String> {
        std::fs::create_dir_all(&self.dir)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{}-{}{}", kind.as_str(), n, suffix));
        std::fs::write(&path, content)?;
        Ok(path.to_string_lossy().to_string())
    }

    async fn perform(&self, kind: WorkerKind, script: &Script) -> Result<WorkerReply> {
        let mut script = script;
        while let Script::Delayed(delay, inner) = script {
            tokio::time::sleep(*delay).await;
            script = inner.as_ref();
        }

        match script {
            Script::Artifact(artifact) => {
                let path = self.write(kind, ".json", &serde_json::to_string(artifact)?)?;
                Ok(WorkerReply::succeeded(path))
            }
            Script::Built { report, content } => {
                let resource_ref = self.write(kind, ".md", content)?;
                let built = BuiltResource {
                    resource_ref,
                    quality_report: report.clone(),
                };
                let path = self.write(kind, ".json", &serde_json::to_string(&built)?)?;
                Ok(WorkerReply::succeeded(path))
            }
            Script::Raw(text) => Ok(WorkerReply::succeeded(self.write(kind, ".json", text)?)),
            Script::Fail(reason) => Ok(WorkerReply::failed(reason.clone())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(WorkerReply::failed("hang ended"))
            }
            Script::Delayed(..) => unreachable!("delays are unwrapped above"),
        }
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn invoke(
        &self,
        kind: WorkerKind,
        input_ref: &str,
        _timeout: Duration,
    ) -> Result<WorkerReply> {
        self.calls
            .lock()
            .unwrap()
            .push((kind, input_ref.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match self.scripts.get(&kind) {
            Some(script) => self.perform(kind, script).await,
            None => Ok(WorkerReply::failed(format!("no script for {}", kind))),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// Fake Fetcher
// ============================================================================

/// [`SourceFetcher`] that fails a configurable number of probes
#[derive(Default)]
pub struct FakeFetcher {
    failing_probes: usize,
    fail_fetch: bool,
    probes: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_probes(mut self, count: usize) -> Self {
        self.failing_probes = count;
        self
    }

    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn probe(&self, url: &str) -> Result<()> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        if n < self.failing_probes {
            anyhow::bail!("{} not reachable (probe {})", url, n + 1);
        }
        Ok(())
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        if self.fail_fetch {
            anyhow::bail!("clone of {} interrupted", url);
        }
        std::fs::write(dest.join("README.md"), format!("# {}\n", url))?;
        Ok(())
    }
}
