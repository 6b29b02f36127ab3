//! # Pipeline Configuration
//!
//! Policy values (thresholds, timeouts, directories) for a run. Thresholds
//! are configuration rather than constants; the defaults below are the
//! values the pipeline was designed around.
//!
//! Persisted as `<runtime>/config.json`. A [`PartialConfig`] overlay can be
//! merged on top of a loaded config, field by field.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::io::get_runtime_path;
use crate::workers::WorkerKind;

/// Minimum quality a built resource must reach before deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_specificity: u32,
    pub min_decision_frameworks: u32,
    pub max_placeholders: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_specificity: 30,
            min_decision_frameworks: 5,
            max_placeholders: 0,
        }
    }
}

/// Per-kind worker timeout bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTimeouts {
    #[serde(with = "duration_secs")]
    pub web_research: Duration,
    #[serde(with = "duration_secs")]
    pub repo_analysis: Duration,
    #[serde(with = "duration_secs")]
    pub build: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            web_research: Duration::from_secs(40 * 60),
            repo_analysis: Duration::from_secs(15 * 60),
            build: Duration::from_secs(20 * 60),
        }
    }
}

impl WorkerTimeouts {
    pub fn for_kind(&self, kind: WorkerKind) -> Duration {
        match kind {
            WorkerKind::WebResearch => self.web_research,
            WorkerKind::RepoAnalysis => self.repo_analysis,
            WorkerKind::Build => self.build,
        }
    }
}

/// The shape of resource being built, and the sections it must contain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    pub name: String,
    pub mandated_sections: Vec<String>,
}

impl Default for Archetype {
    fn default() -> Self {
        Self {
            name: "domain-expert".to_string(),
            mandated_sections: vec![
                "Core Knowledge".to_string(),
                "Decision Frameworks".to_string(),
                "Anti-Patterns".to_string(),
                "Tool Map".to_string(),
                "Interaction Scripts".to_string(),
            ],
        }
    }
}

/// Configuration for one pipeline coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of all runtime state (`.foundry`)
    pub runtime_dir: PathBuf,
    /// Where synthesized work-orders are written
    pub work_order_dir: PathBuf,
    /// Runtime location deployed resources are published to
    pub deploy_dir: PathBuf,
    /// Parent directory for temporary workspaces (system temp when unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Fraction of proposed tokens an existing entry must cover to count as a duplicate
    pub duplicate_threshold: f64,
    #[serde(default)]
    pub quality: QualityThresholds,
    #[serde(default)]
    pub timeouts: WorkerTimeouts,
    /// Wait before the single probe retry
    #[serde(with = "duration_secs")]
    pub probe_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    /// File-name globs that identify an existing work-order in a request
    pub work_order_patterns: Vec<String>,
    #[serde(default)]
    pub archetype: Archetype,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::with_runtime_dir(get_runtime_path())
    }
}

impl PipelineConfig {
    /// Default config rooted at a specific runtime directory
    pub fn with_runtime_dir(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        Self {
            work_order_dir: runtime_dir.join("work-orders"),
            deploy_dir: runtime_dir.join("deployed"),
            runtime_dir,
            scratch_dir: None,
            duplicate_threshold: 0.70,
            quality: QualityThresholds::default(),
            timeouts: WorkerTimeouts::default(),
            probe_backoff: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(15),
            work_order_patterns: vec![
                "*.prompt.md".to_string(),
                "*-prompt.md".to_string(),
                "*.workorder.md".to_string(),
            ],
            archetype: Archetype::default(),
        }
    }

    /// Directory holding per-run artifacts
    pub fn runs_dir(&self) -> PathBuf {
        self.runtime_dir.join("runs")
    }

    /// Path of the persisted config file
    pub fn default_path() -> PathBuf {
        get_runtime_path().join("config.json")
    }

    /// Load a config file; a missing file yields defaults
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config: {:?}", path))
    }

    /// Reject values that make the gates meaningless
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.duplicate_threshold) || self.duplicate_threshold == 0.0 {
            anyhow::bail!(
                "duplicate_threshold must be in (0, 1], got {}",
                self.duplicate_threshold
            );
        }
        if self.archetype.mandated_sections.is_empty() {
            anyhow::bail!("archetype '{}' mandates no sections", self.archetype.name);
        }
        Ok(())
    }

    /// Overlay the set fields of a partial config
    pub fn merge(&mut self, other: PartialConfig) {
        if let Some(v) = other.duplicate_threshold {
            self.duplicate_threshold = v;
        }
        if let Some(v) = other.min_specificity {
            self.quality.min_specificity = v;
        }
        if let Some(v) = other.min_decision_frameworks {
            self.quality.min_decision_frameworks = v;
        }
        if let Some(v) = other.max_placeholders {
            self.quality.max_placeholders = v;
        }
        if let Some(secs) = other.web_research_timeout_secs {
            self.timeouts.web_research = Duration::from_secs(secs);
        }
        if let Some(secs) = other.repo_analysis_timeout_secs {
            self.timeouts.repo_analysis = Duration::from_secs(secs);
        }
        if let Some(secs) = other.build_timeout_secs {
            self.timeouts.build = Duration::from_secs(secs);
        }
        if let Some(dir) = other.deploy_dir {
            self.deploy_dir = dir;
        }
        if let Some(archetype) = other.archetype {
            self.archetype = archetype;
        }
    }
}

/// Sparse overlay for [`PipelineConfig::merge`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_specificity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_decision_frameworks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_placeholders: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_research_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_analysis_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archetype: Option<Archetype>,
}

/// Durations as fractional seconds
mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!("invalid duration: {}", secs)));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::with_runtime_dir("/tmp/foundry-test");
        assert_eq!(config.duplicate_threshold, 0.70);
        assert_eq!(config.quality.min_specificity, 30);
        assert_eq!(config.quality.min_decision_frameworks, 5);
        assert_eq!(config.quality.max_placeholders, 0);
        assert!(config.timeouts.web_research > config.timeouts.repo_analysis);
        assert_eq!(config.deploy_dir, PathBuf::from("/tmp/foundry-test/deployed"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_overlays_only_set_fields() {
        let mut config = PipelineConfig::with_runtime_dir("/tmp/foundry-test");
        config.merge(PartialConfig {
            min_specificity: Some(45),
            build_timeout_secs: Some(60),
            ..Default::default()
        });
        assert_eq!(config.quality.min_specificity, 45);
        assert_eq!(config.quality.min_decision_frameworks, 5);
        assert_eq!(config.timeouts.build, Duration::from_secs(60));
        assert_eq!(config.duplicate_threshold, 0.70);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = PipelineConfig::with_runtime_dir("/tmp/foundry-test");
        config.duplicate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = PipelineConfig::with_runtime_dir(dir.path());
        config.probe_backoff = Duration::from_millis(250);
        config.save(&path).await.unwrap();

        let loaded = PipelineConfig::load(&path).await.unwrap();
        assert_eq!(loaded.probe_backoff, Duration::from_millis(250));
        assert_eq!(loaded.work_order_patterns, config.work_order_patterns);
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = PipelineConfig::load(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert_eq!(loaded.quality, QualityThresholds::default());
    }
}
