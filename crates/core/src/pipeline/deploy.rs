//! # Deployment & Ledger Writer
//!
//! Validate, publish, then record the resource in the registry. The three
//! steps behave as one unit: a validation failure publishes nothing, and a
//! failed registry write puts the deploy directory back the way it was.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};
use crate::models::RegistryEntry;
use crate::state::RegistryStore;
use crate::tools::dedup::tokens;
use crate::tools::validator::FormatValidator;
use crate::workers::artifact_registry::BuiltResource;

/// Outcome of a successful deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployed {
    pub resource_path: PathBuf,
    pub entry: RegistryEntry,
    /// A registry entry of the same name existed and was replaced
    pub replaced_previous: bool,
}

/// Publishes built resources into `deploy_dir` and records them
pub struct Deployer<'a> {
    validator: &'a dyn FormatValidator,
    registry: &'a dyn RegistryStore,
    deploy_dir: &'a Path,
}

fn extension_of(resource_ref: &str) -> String {
    Path::new(resource_ref)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "md".to_string())
}

/// Path a target is published at
pub fn published_path(deploy_dir: &Path, target_name: &str, extension: &str) -> PathBuf {
    deploy_dir.join(format!("{}.{}", target_name, extension))
}

/// Remove any previously published resource for `target_name`
///
/// Used when the caller chose Rebuild. Returns the removed paths.
pub async fn discard_published(deploy_dir: &Path, target_name: &str) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !deploy_dir.exists() {
        return Ok(removed);
    }

    let prefix = format!("{}.", target_name);
    let mut dir = tokio::fs::read_dir(deploy_dir)
        .await
        .with_context(|| format!("Failed to read {:?}", deploy_dir))?;
    while let Some(item) = dir.next_entry().await? {
        let name = item.file_name().to_string_lossy().to_string();
        // `<target>.<ext>` only; `<target>-suffix.<ext>` belongs to another resource
        let is_published = name
            .strip_prefix(&prefix)
            .map(|ext| !ext.is_empty() && !ext.contains('.'))
            .unwrap_or(false);
        if is_published && item.file_type().await?.is_file() {
            tokio::fs::remove_file(item.path())
                .await
                .with_context(|| format!("Failed to remove {:?}", item.path()))?;
            removed.push(item.path());
        }
    }

    if !removed.is_empty() {
        tracing::info!("Discarded {} published file(s) for {}", removed.len(), target_name);
    }
    Ok(removed)
}

impl<'a> Deployer<'a> {
    pub fn new(
        validator: &'a dyn FormatValidator,
        registry: &'a dyn RegistryStore,
        deploy_dir: &'a Path,
    ) -> Self {
        Self {
            validator,
            registry,
            deploy_dir,
        }
    }

    /// Validate, publish and upsert `built` under `target_name`
    pub async fn deploy(
        &self,
        built: &BuiltResource,
        target_name: &str,
        target_purpose: &str,
        category: &str,
    ) -> PipelineResult<Deployed> {
        let report = self.validator.validate(&built.resource_ref);
        if !report.pass {
            tracing::warn!(
                "Format validation rejected {}: {:?}",
                built.resource_ref,
                report.diagnostics
            );
            return Err(PipelineError::ValidationFailed {
                diagnostics: report.diagnostics,
            });
        }

        let previous = self.registry.get(target_name)?;
        let mut keywords = tokens(target_name);
        keywords.extend(tokens(target_purpose));
        let entry = RegistryEntry::new(target_name, keywords)
            .with_category(category)
            .with_version(previous.as_ref().map(|p| p.version + 1).unwrap_or(1));

        let dest = published_path(
            self.deploy_dir,
            target_name,
            &extension_of(&built.resource_ref),
        );
        let backup = self.publish(Path::new(&built.resource_ref), &dest).await?;

        if let Err(e) = self.registry.upsert(&entry) {
            tracing::error!("Registry upsert failed for {}, rolling back publish", target_name);
            self.roll_back(&dest, backup.as_deref()).await;
            return Err(PipelineError::internal(format!(
                "registry upsert for '{}' failed: {:#}",
                target_name, e
            )));
        }

        if let Some(backup) = backup {
            if let Err(e) = tokio::fs::remove_file(&backup).await {
                tracing::warn!("Failed to remove backup {:?}: {}", backup, e);
            }
        }

        tracing::info!("Deployed {} v{} to {:?}", target_name, entry.version, dest);
        Ok(Deployed {
            resource_path: dest,
            entry,
            replaced_previous: previous.is_some(),
        })
    }

    /// Copy to a temp file then rename into place; returns the backup of
    /// any file that was replaced
    async fn publish(&self, source: &Path, dest: &Path) -> Result<Option<PathBuf>> {
        let stamp = uuid::Uuid::new_v4().simple().to_string();
        self.publish_stamped(source, dest, &stamp).await
    }

    /// A failed publish leaves no staging file behind
    async fn publish_stamped(
        &self,
        source: &Path,
        dest: &Path,
        stamp: &str,
    ) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(self.deploy_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.deploy_dir))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let staging = self.deploy_dir.join(format!(".{}.{}.tmp", file_name, stamp));
        tokio::fs::copy(source, &staging)
            .await
            .with_context(|| format!("Failed to stage {:?}", source))?;

        let backup = if dest.exists() {
            let backup = self.deploy_dir.join(format!(".{}.{}.bak", file_name, stamp));
            if let Err(e) = tokio::fs::rename(dest, &backup).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e).with_context(|| format!("Failed to back up {:?}", dest));
            }
            Some(backup)
        } else {
            None
        };

        if let Err(e) = tokio::fs::rename(&staging, dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            self.roll_back(dest, backup.as_deref()).await;
            return Err(e).with_context(|| format!("Failed to publish {:?}", dest));
        }
        Ok(backup)
    }

    async fn roll_back(&self, dest: &Path, backup: Option<&Path>) {
        if dest.exists() {
            if let Err(e) = tokio::fs::remove_file(dest).await {
                tracing::warn!("Failed to remove {:?} during rollback: {}", dest, e);
            }
        }
        if let Some(backup) = backup {
            if let Err(e) = tokio::fs::rename(backup, dest).await {
                tracing::warn!("Failed to restore {:?}: {}", backup, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryRegistry;
    use crate::testing::{resource_markdown, sample_quality_report};
    use crate::tools::validator::MarkdownFormatValidator;

    struct FailingRegistry;

    impl RegistryStore for FailingRegistry {
        fn query(&self, _terms: &[String]) -> Result<Vec<RegistryEntry>> {
            Ok(Vec::new())
        }

        fn get(&self, _name: &str) -> Result<Option<RegistryEntry>> {
            Ok(None)
        }

        fn upsert(&self, _entry: &RegistryEntry) -> Result<()> {
            anyhow::bail!("database is locked")
        }
    }

    fn built_in(dir: &Path, target: &str, content: &str) -> BuiltResource {
        let path = dir.join(format!("{}-build.md", target));
        std::fs::write(&path, content).unwrap();
        BuiltResource {
            resource_ref: path.to_string_lossy().to_string(),
            quality_report: sample_quality_report(),
        }
    }

    #[tokio::test]
    async fn test_deploy_publishes_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_dir = dir.path().join("deployed");
        let registry = InMemoryRegistry::new();
        let validator = MarkdownFormatValidator::default();
        let built = built_in(dir.path(), "kubernetes-security", &resource_markdown("kubernetes-security"));

        let deployed = Deployer::new(&validator, &registry, &deploy_dir)
            .deploy(&built, "kubernetes-security", "kubernetes security hardening", "expert")
            .await
            .unwrap();

        assert_eq!(deployed.resource_path, deploy_dir.join("kubernetes-security.md"));
        assert!(deployed.resource_path.exists());
        assert!(!deployed.replaced_previous);

        let entry = registry.get("kubernetes-security").unwrap().unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.category, "expert");
        assert!(entry.keywords.contains("hardening"));

        let leftovers: Vec<_> = std::fs::read_dir(&deploy_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_removes_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_dir = dir.path().join("deployed");
        std::fs::create_dir_all(&deploy_dir).unwrap();
        let dest = deploy_dir.join("kubernetes-security.md");
        std::fs::write(&dest, "v1").unwrap();
        let source = dir.path().join("kubernetes-security-build.md");
        std::fs::write(&source, "v2").unwrap();

        // A non-empty directory where the backup should go blocks the rename
        let blocker = deploy_dir.join(".kubernetes-security.md.fixed.bak");
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        let registry = InMemoryRegistry::new();
        let validator = MarkdownFormatValidator::default();
        let err = Deployer::new(&validator, &registry, &deploy_dir)
            .publish_stamped(&source, &dest, "fixed")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Failed to back up"));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "v1");
        assert!(!deploy_dir.join(".kubernetes-security.md.fixed.tmp").exists());
    }

    #[tokio::test]
    async fn test_validation_failure_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_dir = dir.path().join("deployed");
        let registry = InMemoryRegistry::new();
        let validator = MarkdownFormatValidator::default();
        let built = built_in(dir.path(), "broken", "# No front matter\n\nTODO\n");

        let err = Deployer::new(&validator, &registry, &deploy_dir)
            .deploy(&built, "broken", "broken", "expert")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::ValidationFailed { .. }));
        assert!(!deploy_dir.join("broken.md").exists());
        assert!(registry.get("broken").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redeploy_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_dir = dir.path().join("deployed");
        let registry = InMemoryRegistry::with_entries(vec![RegistryEntry::new(
            "rust-async",
            vec!["rust".to_string(), "async".to_string()],
        )
        .with_version(3)]);
        let validator = MarkdownFormatValidator::default();
        let built = built_in(dir.path(), "rust-async", &resource_markdown("rust-async"));

        let deployed = Deployer::new(&validator, &registry, &deploy_dir)
            .deploy(&built, "rust-async", "rust async runtimes", "expert")
            .await
            .unwrap();

        assert!(deployed.replaced_previous);
        assert_eq!(deployed.entry.version, 4);
    }

    #[tokio::test]
    async fn test_upsert_failure_restores_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let deploy_dir = dir.path().join("deployed");
        std::fs::create_dir_all(&deploy_dir).unwrap();
        std::fs::write(deploy_dir.join("rust-async.md"), "old version").unwrap();

        let validator = MarkdownFormatValidator::default();
        let built = built_in(dir.path(), "rust-async", &resource_markdown("rust-async"));

        let err = Deployer::new(&validator, &FailingRegistry, &deploy_dir)
            .deploy(&built, "rust-async", "rust async", "expert")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Internal { .. }));
        assert_eq!(
            std::fs::read_to_string(deploy_dir.join("rust-async.md")).unwrap(),
            "old version"
        );
        assert_eq!(std::fs::read_dir(&deploy_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_discard_published_only_touches_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rust-async.md"), "a").unwrap();
        std::fs::write(dir.path().join("rust-async-tokio.md"), "b").unwrap();

        let removed = discard_published(dir.path(), "rust-async").await.unwrap();
        assert_eq!(removed, vec![dir.path().join("rust-async.md")]);
        assert!(dir.path().join("rust-async-tokio.md").exists());

        let missing = discard_published(&dir.path().join("nope"), "x").await.unwrap();
        assert!(missing.is_empty());
    }
}
