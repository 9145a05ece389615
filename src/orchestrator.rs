//! Build submission and tracking.
//!
//! Turns a caller's [`BuildRequest`] into an immutable [`BuildJob`] on the
//! build queue, and answers status, wait and cancel requests by reading the
//! queue entry back.

use crate::analysis::{ComplexityAnalysis, ComplexityAnalyzer, DependencyResolver};
use crate::analysis::manifest::ensure_manifest;
use crate::error::{Error, FieldError, Result};
use crate::files::{detect_runtime, normalize_files, prepare_files};
use crate::model::{
    Artifact, BuildJob, BuildResult, ExecutionMode, JobId, JobMetadata, JobState, LogEntry,
    Priority, ProjectDependencies, ProjectFile, Runtime, RuntimeStrategy, StrategyChoice,
    TestResults,
};
use crate::progress::{ProgressEvent, ProgressHub, ProgressUpdate, Topic};
use crate::queue::{JobQueue, JobRecord};
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on a caller-supplied per-job timeout.
const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Fallback status poll while waiting, for workers in other processes.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A build submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildRequest {
    #[serde(alias = "chatId")]
    pub project_id: String,
    pub files: Vec<ProjectFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<ProjectDependencies>,
    #[serde(default)]
    pub strategy: StrategyChoice,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides runtime detection from marker files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl BuildRequest {
    pub fn new(project_id: impl Into<String>, files: Vec<ProjectFile>) -> Self {
        Self {
            project_id: project_id.into(),
            files,
            ..Default::default()
        }
    }

    /// Shape checks that need no file inspection.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.project_id.trim().is_empty() {
            errors.push(FieldError::new("projectId", "must not be empty"));
        }
        if self.files.is_empty() {
            errors.push(FieldError::new("files", "at least one file is required"));
        }
        match self.timeout_ms {
            Some(0) => errors.push(FieldError::new("timeoutMs", "must be positive")),
            Some(ms) if ms > MAX_TIMEOUT_MS => errors.push(FieldError::new(
                "timeoutMs",
                format!("must not exceed {MAX_TIMEOUT_MS}"),
            )),
            _ => {}
        }
        if let Some(v) = &self.runtime_version {
            if v.trim().is_empty() || v.contains(char::is_whitespace) {
                errors.push(FieldError::new("runtimeVersion", "must be a bare version tag"));
            }
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
                errors.push(FieldError::new(
                    format!("env.{key}"),
                    "invalid environment variable name",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBuildResponse {
    pub build_id: JobId,
    pub status: JobState,
    pub strategy: ExecutionMode,
    pub complexity: ComplexityAnalysis,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A point-in-time view of one build.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusView {
    pub build_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub status: JobState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<TestResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildStatusView {
    fn from_record(record: JobRecord) -> Self {
        let project_id = record.decode::<BuildJob>().ok().map(|job| job.project_id);
        let result = record.decode_result::<BuildResult>();
        let progress = if record.state == JobState::Completed {
            100
        } else {
            record.progress
        };
        let error = match record.state {
            JobState::Completed => None,
            _ => record
                .last_error
                .clone()
                .or_else(|| result.as_ref().and_then(|r| r.error.clone())),
        };
        let (logs, artifacts, test_results) = match result {
            Some(r) => (r.logs, r.artifacts, r.test_results),
            None => (Vec::new(), Vec::new(), None),
        };

        Self {
            build_id: record.id,
            project_id,
            status: record.state,
            progress,
            message: record.progress_message,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            logs,
            artifacts,
            test_results,
            error,
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }

    /// Completed, dead-lettered or cancelled.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// How long and how to wait in [`BuildOrchestrator::wait_for_completion`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Receives every live progress update while waiting.
    pub progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(300_000),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct BuildOrchestrator {
    queue: JobQueue<BuildJob>,
    hub: Arc<ProgressHub>,
    analyzer: ComplexityAnalyzer,
    resolver: DependencyResolver,
}

impl BuildOrchestrator {
    pub fn new(queue: JobQueue<BuildJob>, hub: Arc<ProgressHub>) -> Self {
        Self {
            queue,
            hub,
            analyzer: ComplexityAnalyzer::new(),
            resolver: DependencyResolver::new(),
        }
    }

    pub fn queue(&self) -> &JobQueue<BuildJob> {
        &self.queue
    }

    /// Validate, analyze and enqueue a build.
    pub async fn create_build(&self, request: BuildRequest) -> Result<CreateBuildResponse> {
        info!(
            project_id = %request.project_id,
            file_count = request.files.len(),
            "creating build"
        );

        if let Err(e) = request.validate() {
            count_submission("none", "invalid");
            return Err(e);
        }

        let (mut files, mut warnings) = match prepare_files(request.files) {
            Ok(prepared) => prepared,
            Err(e) => {
                count_submission("none", "invalid");
                return Err(e);
            }
        };
        if !warnings.is_empty() {
            warn!(warnings = ?warnings, "file validation warnings");
        }

        let dependencies = request
            .dependencies
            .or_else(|| self.resolver.resolve(&files));
        let decision = self
            .analyzer
            .decide(&files, dependencies.as_ref(), request.strategy);
        info!(
            strategy = %decision.mode,
            complexity = decision.analysis.score,
            reasoning = %decision.analysis.reasoning,
            "execution strategy decided"
        );

        let runtime = request.runtime.unwrap_or_else(|| detect_runtime(&files));
        let dependencies = dependencies.unwrap_or_default();
        if ensure_manifest(&mut files, runtime, &request.project_id, &dependencies) {
            warn!(%runtime, "no manifest found, synthesized a default one");
            warnings.push(format!("no manifest found; synthesized one for {runtime}"));
        }

        let mut strategy = RuntimeStrategy::for_project(
            runtime,
            &files,
            decision.analysis.factors.has_build_step,
        );
        strategy.version = request.runtime_version;

        let job = BuildJob {
            project_id: request.project_id,
            files,
            dependencies,
            strategy,
            execution_mode: decision.mode,
            priority: request.priority,
            metadata: JobMetadata {
                timestamp: Utc::now(),
                timeout_ms: request.timeout_ms,
                env: request.env,
            },
        };

        let build_id = match self.queue.enqueue(&job, job.priority).await {
            Ok(id) => id,
            Err(e) => {
                count_submission(decision.mode.to_string(), "error");
                return Err(e);
            }
        };
        count_submission(decision.mode.to_string(), "queued");
        info!(
            %build_id,
            project_id = %job.project_id,
            priority = %job.priority,
            strategy = %decision.mode,
            "build queued"
        );

        Ok(CreateBuildResponse {
            build_id,
            status: JobState::Pending,
            strategy: decision.mode,
            complexity: decision.analysis,
            warnings,
        })
    }

    /// Current status. Never blocks on the build itself.
    pub async fn get_status(&self, build_id: JobId) -> Result<BuildStatusView> {
        let record = self
            .queue
            .get(build_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
        Ok(BuildStatusView::from_record(record))
    }

    /// Wait until the build reaches a terminal state.
    ///
    /// Fails with [`Error::Timeout`] when `options.timeout` elapses and with
    /// [`Error::Cancelled`] when `options.cancel` fires. Neither affects the
    /// build itself.
    pub async fn wait_for_completion(
        &self,
        build_id: JobId,
        options: WaitOptions,
    ) -> Result<BuildStatusView> {
        // Subscribe before the first read so no transition falls in between.
        let mut events = self.hub.subscribe(Topic::Job(build_id));
        let deadline = tokio::time::Instant::now() + options.timeout;

        loop {
            let status = self.get_status(build_id).await?;
            if status.is_finished() {
                debug!(%build_id, status = %status.status, "build finished");
                return Ok(status);
            }

            tokio::select! {
                _ = options.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("wait for build {build_id}")));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(format!(
                        "build {build_id} did not finish within {}ms",
                        options.timeout.as_millis()
                    )));
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let (ProgressEvent::Progress(update), Some(tx)) =
                            (event.event, options.progress.as_ref())
                        {
                            let _ = tx.send(update);
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        events = self.hub.subscribe(Topic::Job(build_id));
                    }
                },
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Cancel a build that no worker has started. Returns false when the
    /// build is already running or finished.
    pub async fn cancel(&self, build_id: JobId) -> Result<bool> {
        let status = self.get_status(build_id).await?;
        if status.status != JobState::Pending {
            warn!(%build_id, status = %status.status, "cancel requested for non-pending build");
            return Ok(false);
        }
        let cancelled = self.queue.cancel(build_id).await?;
        if cancelled {
            info!(%build_id, "build cancelled");
        } else {
            warn!(%build_id, "build was claimed before it could be cancelled");
        }
        Ok(cancelled)
    }

    /// Complexity analysis without creating a build.
    pub fn estimate(
        &self,
        files: Vec<ProjectFile>,
        dependencies: Option<&ProjectDependencies>,
    ) -> ComplexityAnalysis {
        let files = normalize_files(files);
        let resolved;
        let dependencies = match dependencies {
            Some(deps) => Some(deps),
            None => {
                resolved = self.resolver.resolve(&files);
                resolved.as_ref()
            }
        };
        self.analyzer.analyze(&files, dependencies)
    }
}

fn count_submission(mode: impl Into<opentelemetry::Value>, result: &'static str) {
    metrics::builds_submitted().add(
        1,
        &[KeyValue::new("mode", mode), KeyValue::new("result", result)],
    );
}
