//! # Artifact Registry
//!
//! Fixed-schema documents exchanged with workers. Research workers return a
//! [`SynthesisArtifact`]; the build worker returns a [`BuiltResource`].
//! Workers can read the expected JSON schema from [`ArtifactSchema::json_schema`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// Schemas
// ============================================================================

/// Schema a worker's artifact must conform to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSchema {
    Synthesis,
    BuiltResource,
}

impl ArtifactSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthesis => "synthesis_artifact",
            Self::BuiltResource => "built_resource",
        }
    }

    /// JSON schema document for this artifact type
    pub fn json_schema(&self) -> serde_json::Value {
        let schema = match self {
            Self::Synthesis => schemars::schema_for!(SynthesisArtifact),
            Self::BuiltResource => schemars::schema_for!(BuiltResource),
        };
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ArtifactSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Synthesis Artifact
// ============================================================================

/// Which source contributed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Web,
    Repo,
    Merged,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Repo => "repo",
            Self::Merged => "merged",
        }
    }
}

/// Direction of an entry's guidance
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Recommend,
    Avoid,
    #[default]
    Neutral,
}

impl Stance {
    /// Recommend and Avoid contradict each other; Neutral contradicts nothing
    pub fn contradicts(&self, other: &Stance) -> bool {
        matches!(
            (self, other),
            (Self::Recommend, Self::Avoid) | (Self::Avoid, Self::Recommend)
        )
    }
}

/// Opposing guidance kept next to an entry instead of being resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConflictNote {
    pub provenance: Provenance,
    pub stance: Stance,
    pub guidance: String,
}

/// One piece of knowledge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Entry {
    pub subject: String,
    pub guidance: String,
    #[serde(default)]
    pub stance: Stance,
    pub provenance: Provenance,
    /// Concrete, checkable details in the entry (versions, commands, numbers)
    #[serde(default)]
    pub specificity: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<ConflictNote>,
}

impl Entry {
    pub fn new(
        subject: impl Into<String>,
        guidance: impl Into<String>,
        provenance: Provenance,
        specificity: u32,
    ) -> Self {
        Self {
            subject: subject.into(),
            guidance: guidance.into(),
            stance: Stance::Neutral,
            provenance,
            specificity,
            conflicts_with: Vec::new(),
        }
    }

    pub fn with_stance(mut self, stance: Stance) -> Self {
        self.stance = stance;
        self
    }
}

/// Explicit record that a category was searched and nothing was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GapMarker {
    /// Locations (URLs, paths, queries) that were searched
    pub searched: Vec<String>,
    #[serde(default)]
    pub note: String,
}

/// One of the five artifact categories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Category {
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gap: Option<GapMarker>,
}

impl Category {
    pub fn populated(entries: Vec<Entry>) -> Self {
        Self { entries, gap: None }
    }

    pub fn gapped(searched: &[&str], note: &str) -> Self {
        Self {
            entries: Vec::new(),
            gap: Some(GapMarker {
                searched: searched.iter().map(|s| s.to_string()).collect(),
                note: note.to_string(),
            }),
        }
    }

    /// No entries, only a gap marker
    pub fn is_gapped(&self) -> bool {
        self.entries.is_empty() && self.gap.is_some()
    }
}

/// Names of the five categories, in document order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryName {
    CoreKnowledge,
    DecisionFrameworks,
    AntiPatterns,
    ToolMap,
    InteractionScripts,
}

impl CategoryName {
    pub const ALL: [CategoryName; 5] = [
        CategoryName::CoreKnowledge,
        CategoryName::DecisionFrameworks,
        CategoryName::AntiPatterns,
        CategoryName::ToolMap,
        CategoryName::InteractionScripts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoreKnowledge => "core_knowledge",
            Self::DecisionFrameworks => "decision_frameworks",
            Self::AntiPatterns => "anti_patterns",
            Self::ToolMap => "tool_map",
            Self::InteractionScripts => "interaction_scripts",
        }
    }
}

impl fmt::Display for CategoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Research output with exactly five categories, each populated or gapped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisArtifact {
    pub target_name: String,
    pub core_knowledge: Category,
    pub decision_frameworks: Category,
    pub anti_patterns: Category,
    pub tool_map: Category,
    pub interaction_scripts: Category,
}

/// Computed facts about a validated synthesis artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub total_specificity: u32,
    pub entry_counts: BTreeMap<String, usize>,
    pub gapped: Vec<String>,
    pub contradictions: usize,
}

impl SynthesisArtifact {
    /// Artifact with every category empty (not valid until filled or gapped)
    pub fn empty(target_name: &str) -> Self {
        Self {
            target_name: target_name.to_string(),
            core_knowledge: Category::default(),
            decision_frameworks: Category::default(),
            anti_patterns: Category::default(),
            tool_map: Category::default(),
            interaction_scripts: Category::default(),
        }
    }

    pub fn category(&self, name: CategoryName) -> &Category {
        match name {
            CategoryName::CoreKnowledge => &self.core_knowledge,
            CategoryName::DecisionFrameworks => &self.decision_frameworks,
            CategoryName::AntiPatterns => &self.anti_patterns,
            CategoryName::ToolMap => &self.tool_map,
            CategoryName::InteractionScripts => &self.interaction_scripts,
        }
    }

    pub fn category_mut(&mut self, name: CategoryName) -> &mut Category {
        match name {
            CategoryName::CoreKnowledge => &mut self.core_knowledge,
            CategoryName::DecisionFrameworks => &mut self.decision_frameworks,
            CategoryName::AntiPatterns => &mut self.anti_patterns,
            CategoryName::ToolMap => &mut self.tool_map,
            CategoryName::InteractionScripts => &mut self.interaction_scripts,
        }
    }

    /// Check the structural invariants and compute the summary.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<ArtifactSummary, Vec<String>> {
        let mut problems = Vec::new();
        let mut summary = ArtifactSummary::default();

        for name in CategoryName::ALL {
            let category = self.category(name);

            match (&category.gap, category.entries.is_empty()) {
                (None, true) => {
                    problems.push(format!("{} is empty without a GAP marker", name));
                }
                (Some(gap), _) if gap.searched.is_empty() => {
                    problems.push(format!("{} GAP marker lists no searched locations", name));
                }
                _ => {}
            }

            for (i, entry) in category.entries.iter().enumerate() {
                if entry.subject.trim().is_empty() || entry.guidance.trim().is_empty() {
                    problems.push(format!("{}[{}] has an empty subject or guidance", name, i));
                }
                summary.total_specificity =
                    summary.total_specificity.saturating_add(entry.specificity);
                summary.contradictions += entry.conflicts_with.len();
            }

            summary
                .entry_counts
                .insert(name.to_string(), category.entries.len());
            if category.is_gapped() {
                summary.gapped.push(name.to_string());
            }
        }

        if problems.is_empty() {
            Ok(summary)
        } else {
            Err(problems)
        }
    }
}

/// Parse a synthesis artifact document; malformed JSON is structurally invalid
pub fn parse_synthesis(context: &str, json: &str) -> PipelineResult<SynthesisArtifact> {
    serde_json::from_str(json).map_err(|e| PipelineError::invalid(context, vec![e.to_string()]))
}

// ============================================================================
// Built Resource
// ============================================================================

/// Quality metrics reported by the build worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QualityReport {
    pub specificity_score: u32,
    pub decision_framework_count: u32,
    pub placeholder_count: u32,
    /// Section headings present in the resource
    pub section_coverage: Vec<String>,
}

/// The build worker's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuiltResource {
    /// Path of the produced resource file
    pub resource_ref: String,
    pub quality_report: QualityReport,
}

/// Parse a built-resource document
pub fn parse_built_resource(context: &str, json: &str) -> PipelineResult<BuiltResource> {
    let built: BuiltResource = serde_json::from_str(json)
        .map_err(|e| PipelineError::invalid(context, vec![e.to_string()]))?;
    if built.resource_ref.trim().is_empty() {
        return Err(PipelineError::invalid(
            context,
            vec!["resource_ref is empty".to_string()],
        ));
    }
    Ok(built)
}
