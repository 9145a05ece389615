//! Containerized build execution for one job attempt.
//!
//! Phases run in order: prepare, install, build, test, collect. Each updates
//! progress and appends to the attempt's log stream. Cleanup runs regardless
//! of outcome and leaves the job directory in place for diagnostics.

use super::testing::{TestPlan, TestReportParsers};
use super::workspace::Workspace;
use crate::container::{
    ContainerRuntime, ContainerSpec, LogChunk, ResourceLimits, WORKSPACE_MOUNT, image_for,
    run_container,
};
use crate::error::{Error, Result};
use crate::files::has_tests;
use crate::model::{
    Artifact, BuildJob, BuildMetrics, BuildResult, BuildStatus, JobId, JobState, LogEntry,
    LogLevel, TestResults,
};
use crate::progress::{ProgressHub, ProgressUpdate};
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Span, debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Parent of every job directory.
    pub build_dir: PathBuf,
    /// Parent of every job's collected artifacts.
    pub artifacts_dir: PathBuf,
    pub limits: ResourceLimits,
    /// Wall-clock limit per container phase unless the job sets its own.
    pub timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("/tmp/buildq/builds"),
            artifacts_dir: PathBuf::from("/tmp/buildq/artifacts"),
            limits: ResourceLimits::default(),
            timeout: Duration::from_millis(300_000),
        }
    }
}

/// A finished attempt: the result record plus the error that ended it, if any.
#[derive(Debug)]
pub struct Attempt {
    pub result: BuildResult,
    pub error: Option<Error>,
}

impl Attempt {
    /// Whether a failed attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_none_or(Error::is_retryable)
    }
}

pub struct BuildProcessor {
    runtime: Arc<dyn ContainerRuntime>,
    hub: Arc<ProgressHub>,
    parsers: TestReportParsers,
    config: ProcessorConfig,
}

/// Mutable state of one attempt.
struct AttemptState<'a> {
    job_id: JobId,
    attempt: u32,
    job: &'a BuildJob,
    logs: Vec<LogEntry>,
    /// Names of every container started for this attempt.
    containers: Vec<String>,
    artifacts: Vec<Artifact>,
    test_results: Option<TestResults>,
}

impl BuildProcessor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        hub: Arc<ProgressHub>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            runtime,
            hub,
            parsers: TestReportParsers::default(),
            config,
        }
    }

    pub fn with_parsers(mut self, parsers: TestReportParsers) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run one attempt and return its result.
    pub async fn process(&self, job_id: JobId, job: &BuildJob, attempt: u32) -> BuildResult {
        self.execute(job_id, job, attempt).await.result
    }

    /// Run one attempt, keeping the failure cause for retry classification.
    pub async fn execute(&self, job_id: JobId, job: &BuildJob, attempt: u32) -> Attempt {
        let start_time = Utc::now();
        let clock = Instant::now();
        let mut state = AttemptState {
            job_id,
            attempt,
            job,
            logs: Vec::new(),
            containers: Vec::new(),
            artifacts: Vec::new(),
            test_results: None,
        };

        self.log(
            &mut state,
            LogLevel::Info,
            format!("starting build attempt {attempt} ({})", job.strategy.runtime),
        );

        let outcome = match self.runtime.ping().await {
            Ok(()) => self.run_phases(&mut state).await,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "container runtime unavailable");
                Err(e)
            }
        };

        self.cleanup(&mut state).await;

        let error = match outcome {
            Ok(()) => {
                self.log(&mut state, LogLevel::Info, "build completed successfully");
                self.progress(&state, 100, "done", "Build completed");
                None
            }
            Err(e) => {
                self.log(&mut state, LogLevel::Error, format!("build failed: {e}"));
                Some(e)
            }
        };

        let result = BuildResult {
            job_id,
            status: if error.is_none() {
                BuildStatus::Success
            } else {
                BuildStatus::Failure
            },
            logs: state.logs,
            artifacts: state.artifacts,
            test_results: state.test_results,
            metrics: BuildMetrics {
                start_time,
                end_time: Utc::now(),
                duration_ms: clock.elapsed().as_millis() as u64,
            },
            error: error.as_ref().map(ToString::to_string),
        };

        Attempt { result, error }
    }

    async fn run_phases(&self, state: &mut AttemptState<'_>) -> Result<()> {
        let job = state.job;
        let limit = job.timeout().unwrap_or(self.config.timeout);

        // --- Prepare ---
        self.progress(state, 10, "prepare", "Preparing build environment");
        let phase_start = Instant::now();
        let prepared = Workspace::prepare(&self.config.build_dir, state.job_id, job).await;
        let workspace = self.finish_phase("prepare", phase_start, prepared)?.0;
        self.log(
            state,
            LogLevel::Info,
            format!("wrote {} files to {}", job.files.len(), workspace.dir.display()),
        );

        let image = image_for(&job.strategy);
        self.runtime.ensure_image(&image).await?;

        // --- Install ---
        if let Some(command) = job.strategy.install_command.as_deref() {
            self.progress(state, 30, "install", "Installing dependencies");
            let phase_start = Instant::now();
            let ran = self
                .run_command(state, &workspace, &image, "install", command, limit)
                .await
                .and_then(|(code, _)| exit_ok("install", code));
            self.finish_phase("install", phase_start, ran)?;
        }

        // --- Build ---
        if let Some(command) = job.strategy.build_command.as_deref() {
            self.progress(state, 60, "build", "Building project");
            let phase_start = Instant::now();
            let ran = self
                .run_command(state, &workspace, &image, "build", command, limit)
                .await
                .and_then(|(code, _)| exit_ok("build", code));
            self.finish_phase("build", phase_start, ran)?;
        }

        // --- Test ---
        if has_tests(&job.files) {
            self.progress(state, 70, "test", "Running tests");
            let phase_start = Instant::now();
            let tested = self.run_tests(state, &workspace, &image, limit).await;
            self.finish_phase("test", phase_start, tested)?;
        }

        // --- Collect ---
        self.progress(state, 90, "collect", "Collecting artifacts");
        let phase_start = Instant::now();
        let (artifacts, warnings) = workspace.collect_artifacts(&self.config.artifacts_dir).await;
        for warning in warnings {
            self.log(state, LogLevel::Warn, warning);
        }
        for artifact in &artifacts {
            self.log(
                state,
                LogLevel::Info,
                format!("collected {} ({} bytes)", artifact.name, artifact.size_bytes),
            );
        }
        state.artifacts = artifacts;
        self.finish_phase("collect", phase_start, Ok(()))?;

        Ok(())
    }

    async fn run_tests(
        &self,
        state: &mut AttemptState<'_>,
        workspace: &Workspace,
        image: &str,
        limit: Duration,
    ) -> Result<()> {
        let plan = TestPlan::for_runtime(state.job.strategy.runtime);
        let started = Instant::now();
        let (exit_code, output) = self
            .run_command(state, workspace, image, "test", plan.command, limit)
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        if plan.found_no_tests(exit_code, &output) {
            self.log(state, LogLevel::Info, "no tests found, skipping");
            state.test_results = Some(TestResults {
                executed: false,
                passed: true,
                duration_ms,
                output,
                ..Default::default()
            });
            return Ok(());
        }

        let results = self.parsers.summarize(output, exit_code, duration_ms);
        self.log(
            state,
            if results.passed {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            format!(
                "tests: {} passed, {} failed, {} skipped, {} total",
                results.passed_count, results.failed_count, results.skipped_count, results.total
            ),
        );
        let passed = results.passed;
        let failed_count = results.failed_count;
        state.test_results = Some(results);

        if passed {
            Ok(())
        } else if failed_count > 0 {
            Err(Error::Container(format!("tests failed: {failed_count} failing")))
        } else {
            Err(Error::Container(format!(
                "tests failed with exit code {exit_code}"
            )))
        }
    }

    /// Run `command` in a fresh container bound to the workspace. Returns the
    /// exit code and the combined output.
    async fn run_command(
        &self,
        state: &mut AttemptState<'_>,
        workspace: &Workspace,
        image: &str,
        phase: &str,
        command: &str,
        limit: Duration,
    ) -> Result<(i64, String)> {
        let spec = self.container_spec(state, workspace, image, phase, command);
        state.containers.push(spec.name.clone());
        debug!(container = %spec.name, command, "running phase command");

        let hub = &self.hub;
        let (job_id, project_id) = (state.job_id, state.job.project_id.as_str());
        let logs = &mut state.logs;
        let mut output = String::new();

        let outcome = run_container(self.runtime.as_ref(), &spec, limit, |chunk: LogChunk| {
            output.push_str(&chunk.text);
            for line in chunk.text.lines().filter(|l| !l.trim().is_empty()) {
                let entry = LogEntry::output(chunk.source, line);
                hub.publish_log(job_id, project_id, entry.clone());
                logs.push(entry);
            }
        })
        .await?;

        Ok((outcome.exit_code, output))
    }

    fn container_spec(
        &self,
        state: &AttemptState<'_>,
        workspace: &Workspace,
        image: &str,
        phase: &str,
        command: &str,
    ) -> ContainerSpec {
        let mut env = vec!["NODE_ENV=production".to_string(), "CI=true".to_string()];
        env.extend(
            state
                .job
                .metadata
                .env
                .iter()
                .map(|(k, v)| format!("{k}={v}")),
        );

        ContainerSpec {
            name: format!("buildq-{}-{}-{phase}", state.job_id.short(), state.attempt),
            image: image.to_string(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            workdir: WORKSPACE_MOUNT.to_string(),
            binds: vec![format!("{}:{WORKSPACE_MOUNT}", workspace.dir.display())],
            env,
            limits: self.config.limits,
        }
    }

    /// Stop any container of this attempt that is still running.
    async fn cleanup(&self, state: &mut AttemptState<'_>) {
        for name in std::mem::take(&mut state.containers) {
            match self.runtime.is_running(&name).await {
                Ok(true) => {
                    warn!(container = %name, "container still running after phase, stopping");
                    if let Err(e) = self.runtime.stop(&name).await {
                        warn!(container = %name, error = %e, "cleanup stop failed");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(container = %name, error = %e, "cleanup inspect failed"),
            }
        }
    }

    fn finish_phase<T>(&self, phase: &'static str, started: Instant, outcome: Result<T>) -> Result<T> {
        let duration_ms = started.elapsed().as_millis() as u64;
        let label = if outcome.is_ok() { "ok" } else { "error" };
        metrics::phase_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("phase", phase), KeyValue::new("result", label)],
        );
        match &outcome {
            Ok(_) => info!(phase, duration_ms, "phase completed"),
            Err(e) => warn!(phase, duration_ms, error = %e, "phase failed"),
        }
        outcome
    }

    fn progress(&self, state: &AttemptState<'_>, progress: u8, phase: &str, message: &str) {
        Span::current().record("job.phase", phase);
        self.hub.publish_progress(ProgressUpdate {
            job_id: state.job_id,
            project_id: state.job.project_id.clone(),
            status: JobState::Active,
            progress,
            message: message.to_string(),
            phase: Some(phase.to_string()),
        });
    }

    fn log(&self, state: &mut AttemptState<'_>, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::system(level, message);
        self.hub
            .publish_log(state.job_id, &state.job.project_id, entry.clone());
        state.logs.push(entry);
    }
}

fn exit_ok(phase: &str, exit_code: i64) -> Result<()> {
    if exit_code == 0 {
        Ok(())
    } else {
        Err(Error::Container(format!(
            "{phase} failed with exit code {exit_code}"
        )))
    }
}
