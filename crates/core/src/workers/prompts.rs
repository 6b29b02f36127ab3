//! # Prompt Synthesizer
//!
//! Materializes the work-order a research worker runs from. The default
//! template is bundled at compile time and rendered with tera.
//!
//! Every work-order, generated or supplied by the caller, must pass
//! [`check_structure`]: 6-10 `##` sections, each with at least 3 list items.
//! An existing work-order for the same target is never overwritten without
//! a [`WorkOrderDisposition::Regenerate`] answer.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{InputDescriptor, Route};

/// Default work-order template
pub const WORK_ORDER_TEMPLATE: &str = include_str!("defaults/work_order.md");

pub const MIN_SECTIONS: usize = 6;
pub const MAX_SECTIONS: usize = 10;
pub const MIN_SUB_ITEMS: usize = 3;

/// Caller's answer when a work-order already exists for the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderDisposition {
    Reuse,
    Regenerate,
}

/// One `##` section and its item count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderSection {
    pub title: String,
    pub items: usize,
}

/// A validated work-order on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRef {
    pub path: PathBuf,
    pub sections: Vec<WorkOrderSection>,
    /// An existing file was used instead of a freshly rendered one
    pub reused: bool,
}

/// Parse the section structure of a work-order and check its bounds
pub fn check_structure(content: &str) -> Result<Vec<WorkOrderSection>, Vec<String>> {
    let mut sections: Vec<WorkOrderSection> = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(title) = trimmed.strip_prefix("## ") {
            sections.push(WorkOrderSection {
                title: title.trim().to_string(),
                items: 0,
            });
        } else if is_list_item(trimmed) {
            if let Some(section) = sections.last_mut() {
                section.items += 1;
            }
        }
    }

    let mut problems = Vec::new();
    if sections.len() < MIN_SECTIONS || sections.len() > MAX_SECTIONS {
        problems.push(format!(
            "expected {}-{} sections, found {}",
            MIN_SECTIONS,
            MAX_SECTIONS,
            sections.len()
        ));
    }
    for section in &sections {
        if section.items < MIN_SUB_ITEMS {
            problems.push(format!(
                "section '{}' has {} sub-items, needs at least {}",
                section.title, section.items, MIN_SUB_ITEMS
            ));
        }
    }

    if problems.is_empty() {
        Ok(sections)
    } else {
        Err(problems)
    }
}

fn is_list_item(line: &str) -> bool {
    if line.starts_with("- ") || line.starts_with("* ") {
        return true;
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && line[digits..].starts_with(". ")
}

/// Writes and validates work-orders under one directory
pub struct PromptSynthesizer {
    work_order_dir: PathBuf,
    template: String,
}

impl PromptSynthesizer {
    pub fn new(work_order_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_order_dir: work_order_dir.into(),
            template: WORK_ORDER_TEMPLATE.to_string(),
        }
    }

    /// Replace the bundled template
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Where the work-order for `target_name` lives
    pub fn work_order_path(&self, target_name: &str) -> PathBuf {
        self.work_order_dir
            .join(format!("{}.workorder.md", target_name))
    }

    /// Path of an already existing work-order for the target
    pub fn existing(&self, target_name: &str) -> Option<PathBuf> {
        let path = self.work_order_path(target_name);
        path.exists().then_some(path)
    }

    /// Render the template for a descriptor without writing it
    pub fn render(&self, descriptor: &InputDescriptor, route: Route) -> PipelineResult<String> {
        let domain = if descriptor.target_purpose.trim().is_empty() {
            descriptor.target_name.replace('-', " ")
        } else {
            descriptor.target_purpose.clone()
        };
        let repo_source = descriptor
            .remote_url
            .clone()
            .or_else(|| {
                descriptor
                    .local_path
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_default();

        let mut context = tera::Context::new();
        context.insert("target_name", &descriptor.target_name);
        context.insert("target_purpose", &descriptor.target_purpose);
        context.insert("domain", &domain);
        context.insert("route", route.as_str());
        context.insert("repo_source", &repo_source);
        context.insert("generated_at", &Utc::now().to_rfc3339());

        tera::Tera::one_off(&self.template, &context, false)
            .map_err(|e| PipelineError::internal(format!("work-order template: {}", e)))
    }

    /// Render, check and write the work-order.
    ///
    /// Fails if a work-order already exists and `replace_existing` is false.
    pub async fn synthesize(
        &self,
        descriptor: &InputDescriptor,
        route: Route,
        replace_existing: bool,
    ) -> PipelineResult<PromptRef> {
        let path = self.work_order_path(&descriptor.target_name);
        if path.exists() && !replace_existing {
            return Err(PipelineError::internal(format!(
                "work-order {:?} exists and was not cleared for regeneration",
                path
            )));
        }

        let content = self.render(descriptor, route)?;
        let sections = check_structure(&content)
            .map_err(|problems| PipelineError::invalid("generated work-order", problems))?;

        tokio::fs::create_dir_all(&self.work_order_dir)
            .await
            .map_err(|e| PipelineError::internal(format!("create work-order dir: {}", e)))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| PipelineError::internal(format!("write {:?}: {}", path, e)))?;

        tracing::info!(
            "Work-order for '{}' written to {:?} ({} sections)",
            descriptor.target_name,
            path,
            sections.len()
        );
        Ok(PromptRef {
            path,
            sections,
            reused: false,
        })
    }

    /// Read and check an existing work-order
    pub async fn reuse(&self, path: &Path) -> PipelineResult<PromptRef> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Unreachable {
                location: path.display().to_string(),
                detail: e.to_string(),
            })?;
        let sections = check_structure(&content).map_err(|problems| {
            PipelineError::invalid(format!("work-order {}", path.display()), problems)
        })?;
        Ok(PromptRef {
            path: path.to_path_buf(),
            sections,
            reused: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::classifier::classify;

    #[test]
    fn test_bundled_template_renders_a_conforming_work_order() {
        let dir = tempfile::tempdir().unwrap();
        let synthesizer = PromptSynthesizer::new(dir.path());
        let descriptor = classify("create agent for kubernetes-security");

        let content = synthesizer.render(&descriptor, Route::WebResearch).unwrap();
        let sections = check_structure(&content).unwrap();
        assert!(sections.len() >= MIN_SECTIONS && sections.len() <= MAX_SECTIONS);
        assert!(sections.iter().all(|s| s.items >= MIN_SUB_ITEMS && s.items <= 5));
        assert!(content.contains("kubernetes-security"));
        assert!(!content.contains("{{"));
    }

    #[test]
    fn test_structure_check_counts_sections_and_items() {
        let mut content = String::new();
        for i in 0..5 {
            content.push_str(&format!("## Section {}\n- a\n- b\n- c\n", i));
        }
        let problems = check_structure(&content).unwrap_err();
        assert!(problems[0].contains("found 5"));

        content.push_str("## Thin\n1. only\n2. two\n");
        let problems = check_structure(&content).unwrap_err();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'Thin' has 2"));

        content.push_str("3. three\n");
        assert_eq!(check_structure(&content).unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_synthesize_refuses_silent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let synthesizer = PromptSynthesizer::new(dir.path());
        let descriptor = classify("create agent for kubernetes-security");

        let first = synthesizer
            .synthesize(&descriptor, Route::WebResearch, false)
            .await
            .unwrap();
        assert!(!first.reused);
        assert_eq!(synthesizer.existing("kubernetes-security"), Some(first.path.clone()));

        assert!(synthesizer
            .synthesize(&descriptor, Route::WebResearch, false)
            .await
            .is_err());
        assert!(synthesizer
            .synthesize(&descriptor, Route::WebResearch, true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reuse_checks_structure() {
        let dir = tempfile::tempdir().unwrap();
        let synthesizer = PromptSynthesizer::new(dir.path());
        let path = dir.path().join("thin.prompt.md");
        std::fs::write(&path, "## Only\n- a\n").unwrap();

        let err = synthesizer.reuse(&path).await.unwrap_err();
        assert!(matches!(err, PipelineError::StructurallyInvalid { .. }));

        let err = synthesizer
            .reuse(&dir.path().join("absent.prompt.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unreachable { .. }));
    }
}
