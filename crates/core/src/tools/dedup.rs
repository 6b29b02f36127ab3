//! # Registry Gate
//!
//! Duplicate detection against the registry using token-set overlap, and
//! the naming rules a Narrow disposition is re-validated against.
//!
//! Overlap is `|proposed ∩ existing| / |proposed|`, computed separately for
//! name tokens and keyword sets; the larger of the two is compared to the
//! threshold. Tokens are whole words, never substrings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{PipelineError, PipelineResult};
use crate::models::RegistryEntry;
use crate::state::registry::RegistryStore;

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 50;

/// Words that never count towards overlap
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "from", "in", "into", "of", "on", "or", "the",
    "to", "with",
];

/// Lowercase alphanumeric word set of `text`
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction of `proposed` covered by `existing` (0.0 when `proposed` is empty)
pub fn overlap(proposed: &BTreeSet<String>, existing: &BTreeSet<String>) -> f64 {
    if proposed.is_empty() {
        return 0.0;
    }
    let shared = proposed.intersection(existing).count();
    shared as f64 / proposed.len() as f64
}

/// An existing entry that overlaps the proposed target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub name: String,
    pub overlap: f64,
    pub version: u32,
}

/// Outcome of the duplicate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DuplicateDecision {
    /// No overlapping entry; the run continues
    Proceed,
    /// Overlap found; a [`DuplicateDisposition`] is required before continuing
    Conflict { matches: Vec<DuplicateMatch> },
}

impl DuplicateDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// The caller's answer to a [`DuplicateDecision::Conflict`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDisposition {
    /// Keep the target name and discard any previously built resource
    Rebuild,
    /// Qualify the target name with a suffix
    Narrow(String),
    Abort,
}

/// Match one entry against the proposed token sets
fn score(entry: &RegistryEntry, name_tokens: &BTreeSet<String>, keywords: &BTreeSet<String>) -> f64 {
    let entry_name = tokens(&entry.name);
    let entry_keywords: BTreeSet<String> = entry
        .keywords
        .iter()
        .flat_map(|k| tokens(k))
        .chain(entry_name.iter().cloned())
        .collect();

    overlap(name_tokens, &entry_name).max(overlap(keywords, &entry_keywords))
}

/// Check a proposed target against the registry.
///
/// An exact name match is always a conflict.
pub fn check_duplicate(
    registry: &dyn RegistryStore,
    target_name: &str,
    target_purpose: &str,
    threshold: f64,
) -> PipelineResult<DuplicateDecision> {
    let name_tokens = tokens(target_name);
    let keywords: BTreeSet<String> = name_tokens
        .iter()
        .cloned()
        .chain(tokens(target_purpose))
        .collect();

    let terms: Vec<String> = keywords.iter().cloned().collect();
    let candidates = registry.query(&terms)?;

    let mut matches: Vec<DuplicateMatch> = candidates
        .iter()
        .filter_map(|entry| {
            let overlap = if entry.name == target_name {
                1.0
            } else {
                score(entry, &name_tokens, &keywords)
            };
            (overlap >= threshold).then(|| DuplicateMatch {
                name: entry.name.clone(),
                overlap,
                version: entry.version,
            })
        })
        .collect();

    if matches.is_empty() {
        tracing::debug!("No registry overlap for '{}'", target_name);
        return Ok(DuplicateDecision::Proceed);
    }

    matches.sort_by(|a, b| {
        b.overlap
            .partial_cmp(&a.overlap)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    tracing::info!(
        "'{}' overlaps {} registry entr(ies), best {} at {:.0}%",
        target_name,
        matches.len(),
        matches[0].name,
        matches[0].overlap * 100.0
    );
    Ok(DuplicateDecision::Conflict { matches })
}

/// Check the naming rules: lowercase, hyphenated, 3-50 characters
pub fn validate_target_name(name: &str) -> Result<(), String> {
    let len = name.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(format!(
            "must be {}-{} characters, got {}",
            MIN_NAME_LEN, MAX_NAME_LEN, len
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("only lowercase letters, digits and hyphens are allowed".to_string());
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err("hyphens must separate words".to_string());
    }
    Ok(())
}

/// Apply a Narrow suffix and re-validate the resulting name.
///
/// The narrowed name must satisfy [`validate_target_name`] and must not
/// already exist in the registry.
pub fn narrow_target(
    registry: &dyn RegistryStore,
    target_name: &str,
    suffix: &str,
) -> PipelineResult<String> {
    let suffix = suffix.trim().trim_matches('-');
    if suffix.is_empty() {
        return Err(PipelineError::InvalidTargetName {
            name: target_name.to_string(),
            reason: "narrowing needs a non-empty suffix".to_string(),
        });
    }
    let candidate = format!("{}-{}", target_name, suffix);

    validate_target_name(&candidate).map_err(|reason| PipelineError::InvalidTargetName {
        name: candidate.clone(),
        reason,
    })?;

    if registry.get(&candidate)?.is_some() {
        return Err(PipelineError::InvalidTargetName {
            name: candidate,
            reason: "a resource with this name already exists".to_string(),
        });
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::registry::InMemoryRegistry;

    fn entry(name: &str, keywords: &[&str]) -> RegistryEntry {
        RegistryEntry::new(name, keywords.iter().map(|k| k.to_string()))
    }

    fn security_registry() -> InMemoryRegistry {
        InMemoryRegistry::with_entries(vec![entry(
            "security-architect",
            &["security", "threat", "modeling", "cloud", "audit"],
        )])
    }

    #[test]
    fn test_tokens_are_words_not_substrings() {
        let t = tokens("Kubernetes-Security for the CLUSTER");
        assert_eq!(
            t.into_iter().collect::<Vec<_>>(),
            vec!["cluster", "kubernetes", "security"]
        );
        // "sec" is a substring of "security" but not a shared token
        assert_eq!(overlap(&tokens("sec"), &tokens("security")), 0.0);
    }

    #[test]
    fn test_overlap_fraction() {
        let proposed = tokens("security threat modeling cloud expert");
        let existing = tokens("security threat modeling cloud audit");
        assert!((overlap(&proposed, &existing) - 0.8).abs() < f64::EPSILON);
        assert_eq!(overlap(&BTreeSet::new(), &existing), 0.0);
    }

    #[test]
    fn test_eighty_percent_keyword_overlap_conflicts() {
        let registry = security_registry();
        let decision = check_duplicate(
            &registry,
            "security-expert",
            "threat modeling, cloud",
            0.70,
        )
        .unwrap();

        match decision {
            DuplicateDecision::Conflict { matches } => {
                assert_eq!(matches[0].name, "security-architect");
                assert!(matches[0].overlap >= 0.8 - f64::EPSILON);
            }
            DuplicateDecision::Proceed => panic!("expected conflict"),
        }
    }

    #[test]
    fn test_below_threshold_proceeds() {
        let registry = security_registry();
        let decision =
            check_duplicate(&registry, "kubernetes-security", "pod networking", 0.70).unwrap();
        assert!(decision.is_proceed());
    }

    #[test]
    fn test_exact_name_always_conflicts() {
        let registry = InMemoryRegistry::with_entries(vec![entry("rust-reviewer", &[])]);
        let decision = check_duplicate(&registry, "rust-reviewer", "", 1.0).unwrap();
        assert!(!decision.is_proceed());
    }

    #[test]
    fn test_overlap_at_or_above_threshold_never_proceeds() {
        let registry = security_registry();
        let purposes = [
            "security threat modeling cloud",
            "threat modeling cloud audit",
            "cloud audit security threat",
        ];
        for purpose in purposes {
            let decision = check_duplicate(&registry, "sec", purpose, 0.70).unwrap();
            assert!(!decision.is_proceed(), "purpose {:?} should conflict", purpose);
        }
    }

    #[test]
    fn test_validate_target_name() {
        assert!(validate_target_name("kubernetes-security").is_ok());
        assert!(validate_target_name("k8s").is_ok());
        assert!(validate_target_name("ab").is_err());
        assert!(validate_target_name(&"a".repeat(51)).is_err());
        assert!(validate_target_name("Security-Expert").is_err());
        assert!(validate_target_name("security_expert").is_err());
        assert!(validate_target_name("-security").is_err());
        assert!(validate_target_name("security--expert").is_err());
    }

    #[test]
    fn test_narrow_target() {
        let registry = InMemoryRegistry::with_entries(vec![entry("security-expert-cloud", &[])]);

        assert_eq!(
            narrow_target(&registry, "security-expert", "appsec").unwrap(),
            "security-expert-appsec"
        );

        let err = narrow_target(&registry, "security-expert", "cloud").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTargetName { .. }));

        let err = narrow_target(&registry, "security-expert", "Cloud Native").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTargetName { .. }));

        for blank in ["", "   ", "-", " -- "] {
            let err = narrow_target(&registry, "security-expert", blank).unwrap_err();
            assert!(matches!(err, PipelineError::InvalidTargetName { .. }), "{:?}", blank);
        }
    }

    #[test]
    fn test_phrase_and_mixed_case_keywords_still_conflict() {
        let registry = InMemoryRegistry::with_entries(vec![
            entry("xyz-agent", &["Security", "Threat", "Cloud"]),
            entry("platform-guard", &["Threat Modeling", "Cloud Audit"]),
        ]);

        let decision =
            check_duplicate(&registry, "security-threat", "security threat cloud", 0.70).unwrap();
        assert!(!decision.is_proceed());

        match check_duplicate(&registry, "threat-modeling", "cloud audit", 0.70).unwrap() {
            DuplicateDecision::Conflict { matches } => {
                assert!(matches.iter().any(|m| m.name == "platform-guard" && m.overlap >= 0.99));
            }
            DuplicateDecision::Proceed => panic!("expected conflict"),
        }
    }
}
