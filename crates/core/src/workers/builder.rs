//! # Build Delegator
//!
//! Hands the validated artifact to the build worker and gates the result on
//! the quality thresholds. A single dispatch, never concurrent.
//!
//! The build worker receives the path of `build-order.json`, which names
//! the artifact file, the archetype and its mandated sections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Archetype, QualityThresholds};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::delegation::DelegationEngine;
use crate::state::io::write_json;
use crate::workers::artifact_registry::{BuiltResource, QualityReport, SynthesisArtifact};
use crate::workers::WorkerKind;

/// One quality threshold the built resource did not reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum UnmetThreshold {
    SpecificityScore { required: u32, actual: u32 },
    DecisionFrameworkCount { required: u32, actual: u32 },
    PlaceholderCount { allowed: u32, actual: u32 },
    MissingSection { section: String },
}

impl fmt::Display for UnmetThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpecificityScore { required, actual } => {
                write!(f, "specificity_score {} < {}", actual, required)
            }
            Self::DecisionFrameworkCount { required, actual } => {
                write!(f, "decision_framework_count {} < {}", actual, required)
            }
            Self::PlaceholderCount { allowed, actual } => {
                write!(f, "placeholder_count {} > {}", actual, allowed)
            }
            Self::MissingSection { section } => write!(f, "missing section '{}'", section),
        }
    }
}

/// What the build worker is asked to produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOrder {
    pub target_name: String,
    pub artifact_ref: PathBuf,
    pub archetype: String,
    pub mandated_sections: Vec<String>,
    pub thresholds: QualityThresholds,
}

fn section_key(title: &str) -> String {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every threshold the report misses; empty means the resource may be deployed
pub fn check_quality(
    report: &QualityReport,
    thresholds: &QualityThresholds,
    archetype: &Archetype,
) -> Vec<UnmetThreshold> {
    let mut unmet = Vec::new();

    if report.specificity_score < thresholds.min_specificity {
        unmet.push(UnmetThreshold::SpecificityScore {
            required: thresholds.min_specificity,
            actual: report.specificity_score,
        });
    }
    if report.decision_framework_count < thresholds.min_decision_frameworks {
        unmet.push(UnmetThreshold::DecisionFrameworkCount {
            required: thresholds.min_decision_frameworks,
            actual: report.decision_framework_count,
        });
    }
    if report.placeholder_count > thresholds.max_placeholders {
        unmet.push(UnmetThreshold::PlaceholderCount {
            allowed: thresholds.max_placeholders,
            actual: report.placeholder_count,
        });
    }

    let covered: Vec<String> = report.section_coverage.iter().map(|s| section_key(s)).collect();
    for section in &archetype.mandated_sections {
        if !covered.contains(&section_key(section)) {
            unmet.push(UnmetThreshold::MissingSection {
                section: section.clone(),
            });
        }
    }

    unmet
}

/// Single-dispatch build through the delegation engine
pub struct BuildDelegator<'a> {
    engine: &'a DelegationEngine,
    thresholds: &'a QualityThresholds,
    archetype: &'a Archetype,
    timeout: Duration,
}

impl<'a> BuildDelegator<'a> {
    pub fn new(
        engine: &'a DelegationEngine,
        thresholds: &'a QualityThresholds,
        archetype: &'a Archetype,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            thresholds,
            archetype,
            timeout,
        }
    }

    /// Write `artifact.json` and `build-order.json` into `run_dir`
    pub async fn write_order(
        &self,
        artifact: &SynthesisArtifact,
        target_name: &str,
        run_dir: &Path,
    ) -> PipelineResult<PathBuf> {
        let artifact_path = run_dir.join("artifact.json");
        write_json(&artifact_path, artifact).await?;

        let order = BuildOrder {
            target_name: target_name.to_string(),
            artifact_ref: artifact_path,
            archetype: self.archetype.name.clone(),
            mandated_sections: self.archetype.mandated_sections.clone(),
            thresholds: self.thresholds.clone(),
        };
        let order_path = run_dir.join("build-order.json");
        write_json(&order_path, &order).await?;
        Ok(order_path)
    }

    /// Dispatch the build worker and return its output unchecked
    pub async fn request_build(
        &self,
        artifact: &SynthesisArtifact,
        target_name: &str,
        run_dir: &Path,
    ) -> PipelineResult<BuiltResource> {
        let order_path = self.write_order(artifact, target_name, run_dir).await?;
        let handle = self.engine.dispatch(
            WorkerKind::Build,
            &order_path.to_string_lossy(),
            self.timeout,
        );
        self.engine.await_built(handle).await
    }

    /// Reject a resource that misses any threshold
    pub fn enforce(&self, built: &BuiltResource) -> PipelineResult<()> {
        let unmet = check_quality(&built.quality_report, self.thresholds, self.archetype);
        if unmet.is_empty() {
            Ok(())
        } else {
            tracing::warn!("Built resource misses {} threshold(s)", unmet.len());
            Err(PipelineError::QualityThresholdUnmet { unmet })
        }
    }

    /// Build and check in one step
    pub async fn build(
        &self,
        artifact: &SynthesisArtifact,
        target_name: &str,
        run_dir: &Path,
    ) -> PipelineResult<BuiltResource> {
        let built = self.request_build(artifact, target_name, run_dir).await?;
        self.enforce(&built)?;
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_artifact, sample_quality_report, FakeWorker, Script};
    use crate::workers::artifact_registry::Provenance;
    use std::sync::Arc;

    #[test]
    fn test_passing_report_has_no_unmet_thresholds() {
        let unmet = check_quality(
            &sample_quality_report(),
            &QualityThresholds::default(),
            &Archetype::default(),
        );
        assert!(unmet.is_empty(), "{:?}", unmet);
    }

    #[test]
    fn test_each_threshold_is_reported() {
        let report = QualityReport {
            specificity_score: 12,
            decision_framework_count: 4,
            placeholder_count: 2,
            section_coverage: vec!["core knowledge".to_string(), "Tool-Map".to_string()],
        };
        let unmet = check_quality(&report, &QualityThresholds::default(), &Archetype::default());

        assert!(unmet.contains(&UnmetThreshold::SpecificityScore {
            required: 30,
            actual: 12
        }));
        assert!(unmet.contains(&UnmetThreshold::DecisionFrameworkCount {
            required: 5,
            actual: 4
        }));
        assert!(unmet.contains(&UnmetThreshold::PlaceholderCount {
            allowed: 0,
            actual: 2
        }));
        let missing: Vec<_> = unmet
            .iter()
            .filter(|u| matches!(u, UnmetThreshold::MissingSection { .. }))
            .collect();
        assert_eq!(missing.len(), 3);
        assert_eq!(unmet[2].to_string(), "placeholder_count 2 > 0");
    }

    #[test]
    fn test_thresholds_are_configuration() {
        let report = QualityReport {
            specificity_score: 12,
            ..sample_quality_report()
        };
        let relaxed = QualityThresholds {
            min_specificity: 10,
            ..QualityThresholds::default()
        };
        assert!(check_quality(&report, &relaxed, &Archetype::default()).is_empty());
    }

    #[tokio::test]
    async fn test_build_writes_order_and_enforces() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(dir.path().join("out"))
            .with_script(WorkerKind::Build, Script::good_build("kubernetes-security"));
        let engine = DelegationEngine::new(Arc::new(worker));
        let thresholds = QualityThresholds::default();
        let archetype = Archetype::default();
        let delegator =
            BuildDelegator::new(&engine, &thresholds, &archetype, Duration::from_secs(5));

        let artifact = sample_artifact("kubernetes-security", Provenance::Web);
        let built = delegator
            .build(&artifact, "kubernetes-security", dir.path())
            .await
            .unwrap();
        assert!(Path::new(&built.resource_ref).exists());

        let order: BuildOrder = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("build-order.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(order.target_name, "kubernetes-security");
        assert!(order.artifact_ref.exists());
        assert_eq!(engine.invocations()[0].worker_kind, WorkerKind::Build);
    }

    #[tokio::test]
    async fn test_placeholders_fail_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let report = QualityReport {
            placeholder_count: 1,
            ..sample_quality_report()
        };
        let worker = FakeWorker::new(dir.path().join("out"))
            .with_script(WorkerKind::Build, Script::build_with_report("t", report));
        let engine = DelegationEngine::new(Arc::new(worker));
        let thresholds = QualityThresholds::default();
        let archetype = Archetype::default();
        let delegator =
            BuildDelegator::new(&engine, &thresholds, &archetype, Duration::from_secs(5));

        let err = delegator
            .build(&sample_artifact("t", Provenance::Web), "t", dir.path())
            .await
            .unwrap_err();
        match err {
            PipelineError::QualityThresholdUnmet { unmet } => {
                assert_eq!(
                    unmet,
                    vec![UnmetThreshold::PlaceholderCount {
                        allowed: 0,
                        actual: 1
                    }]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
