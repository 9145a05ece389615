//! Job-scoped working directory: materialize files, collect artifacts.

use crate::analysis::manifest::ensure_manifest;
use crate::error::{Error, FieldError, Result};
use crate::model::{Artifact, ArtifactKind, BuildJob, JobId};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Conventional output directories, checked in this order.
pub const ARTIFACT_DIRS: &[&str] = &[
    "dist",
    "build",
    "out",
    ".next",
    ".nuxt",
    ".output",
    ".svelte-kit",
    "public",
    "static",
];

/// The directory one worker owns for one attempt of a job.
pub struct Workspace {
    pub job_id: JobId,
    pub dir: PathBuf,
}

impl Workspace {
    /// Create `base_dir/<job_id>` and write every project file into it.
    ///
    /// Content left by an earlier attempt is wiped first. A manifest is
    /// synthesized when dependencies were supplied but none was submitted.
    /// Returns the workspace and whether a manifest was synthesized.
    pub async fn prepare(base_dir: &Path, job_id: JobId, job: &BuildJob) -> Result<(Self, bool)> {
        let dir = base_dir.join(job_id.to_string());
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let mut files = job.files.clone();
        let synthesized = !job.dependencies.is_empty()
            && ensure_manifest(
                &mut files,
                job.strategy.runtime,
                &job.project_id,
                &job.dependencies,
            );

        for file in &files {
            let target = dir.join(&file.path);
            // Payloads read back from the store are not trusted.
            if !target.starts_with(&dir) || file.path.split('/').any(|s| s == "..") {
                return Err(Error::Validation(vec![FieldError::new(
                    "files",
                    format!("path escapes workspace: {}", file.path),
                )]));
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
        }

        debug!(
            job_id = %job_id,
            dir = %dir.display(),
            files = files.len(),
            synthesized,
            "workspace prepared"
        );

        Ok((Self { job_id, dir }, synthesized))
    }

    /// Copy every conventional output directory present into
    /// `artifacts_base/<job_id>/<name>`.
    ///
    /// I/O errors skip the affected directory and are returned as warnings;
    /// they never fail the build.
    pub async fn collect_artifacts(&self, artifacts_base: &Path) -> (Vec<Artifact>, Vec<String>) {
        let source = self.dir.clone();
        let dest = artifacts_base.join(self.job_id.to_string());
        let collected = tokio::task::spawn_blocking(move || collect_blocking(&source, &dest)).await;

        match collected {
            Ok(result) => {
                info!(
                    job_id = %self.job_id,
                    artifacts = result.0.len(),
                    "artifacts collected"
                );
                result
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "artifact collection task failed");
                (Vec::new(), vec![format!("artifact collection failed: {e}")])
            }
        }
    }
}

fn collect_blocking(source: &Path, dest: &Path) -> (Vec<Artifact>, Vec<String>) {
    let mut artifacts = Vec::new();
    let mut warnings = Vec::new();

    for name in ARTIFACT_DIRS {
        let from = source.join(name);
        if !from.is_dir() {
            continue;
        }
        let to = dest.join(name);
        match copy_tree(&from, &to) {
            Ok(size_bytes) => artifacts.push(Artifact {
                name: name.to_string(),
                path: to.display().to_string(),
                size_bytes,
                kind: ArtifactKind::Directory,
            }),
            Err(e) => {
                warn!(artifact = name, error = %e, "failed to collect artifact");
                warnings.push(format!("failed to collect {name}: {e}"));
            }
        }
    }

    (artifacts, warnings)
}

/// Recursively copy `from` into `to`, returning the total bytes copied.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(to)?;
    let mut total = 0;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            total += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}
