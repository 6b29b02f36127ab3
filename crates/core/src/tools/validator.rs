//! # Format Validator
//!
//! Synchronous, side-effect-free check of a built resource before it is
//! published. The default validator understands markdown resources with a
//! front-matter header.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Markers that mean the resource still has unfinished content
pub const PLACEHOLDER_MARKERS: &[&str] = &["{{", "}}", "TODO", "TBD", "[PLACEHOLDER]", "<insert"];

/// Validator verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub pass: bool,
    pub diagnostics: Vec<String>,
}

impl ValidationReport {
    pub fn from_diagnostics(diagnostics: Vec<String>) -> Self {
        Self {
            pass: diagnostics.is_empty(),
            diagnostics,
        }
    }
}

/// External format check
pub trait FormatValidator: Send + Sync {
    fn validate(&self, resource_ref: &str) -> ValidationReport;
}

/// Markdown resource with `---` front matter carrying the required keys
#[derive(Debug, Clone)]
pub struct MarkdownFormatValidator {
    required_keys: Vec<String>,
}

impl Default for MarkdownFormatValidator {
    fn default() -> Self {
        Self {
            required_keys: vec!["name".to_string(), "description".to_string()],
        }
    }
}

impl MarkdownFormatValidator {
    pub fn with_required_keys(keys: &[&str]) -> Self {
        Self {
            required_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Validate resource text directly
    pub fn check_content(&self, content: &str) -> Vec<String> {
        let mut diagnostics = Vec::new();

        if content.trim().is_empty() {
            diagnostics.push("resource is empty".to_string());
            return diagnostics;
        }

        match front_matter(content) {
            Some(header) => {
                for key in &self.required_keys {
                    let prefix = format!("{}:", key);
                    let present = header.lines().any(|line| {
                        line.trim_start()
                            .strip_prefix(&prefix)
                            .map(|value| !value.trim().is_empty())
                            .unwrap_or(false)
                    });
                    if !present {
                        diagnostics.push(format!("front matter is missing '{}'", key));
                    }
                }
            }
            None => diagnostics.push("missing front matter block".to_string()),
        }

        for (i, line) in content.lines().enumerate() {
            if let Some(marker) = PLACEHOLDER_MARKERS.iter().find(|m| line.contains(*m)) {
                diagnostics.push(format!("line {}: unresolved placeholder '{}'", i + 1, marker));
            }
        }

        diagnostics
    }
}

impl FormatValidator for MarkdownFormatValidator {
    fn validate(&self, resource_ref: &str) -> ValidationReport {
        let path = Path::new(resource_ref);
        let diagnostics = match std::fs::read_to_string(path) {
            Ok(content) => self.check_content(&content),
            Err(e) => vec![format!("cannot read {}: {}", resource_ref, e)],
        };
        ValidationReport::from_diagnostics(diagnostics)
    }
}

/// Text between the leading `---` line and the next `---` line
fn front_matter(content: &str) -> Option<&str> {
    let rest = content.trim_start().strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "---\nname: kubernetes-security\ndescription: Cluster hardening\n---\n\n# Core Knowledge\n";

    #[test]
    fn test_valid_markdown_passes() {
        let diagnostics = MarkdownFormatValidator::default().check_content(GOOD);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
    }

    #[test]
    fn test_missing_front_matter_key() {
        let content = "---\nname: x\n---\nbody";
        let diagnostics = MarkdownFormatValidator::default().check_content(content);
        assert_eq!(diagnostics, vec!["front matter is missing 'description'"]);
    }

    #[test]
    fn test_placeholders_are_reported() {
        let content = format!("{}\nUse {{{{tool}}}} here\nTBD\n", GOOD);
        let diagnostics = MarkdownFormatValidator::default().check_content(&content);
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn test_validate_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("res.md");
        std::fs::write(&path, GOOD).unwrap();

        let validator = MarkdownFormatValidator::default();
        assert!(validator.validate(&path.to_string_lossy()).pass);

        let report = validator.validate(&dir.path().join("absent.md").to_string_lossy());
        assert!(!report.pass);
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_custom_required_keys() {
        let validator = MarkdownFormatValidator::with_required_keys(&["name", "tools"]);
        let diagnostics = validator.check_content(GOOD);
        assert_eq!(diagnostics, vec!["front matter is missing 'tools'"]);
    }
}
