//! Build jobs, their execution plan, and queue lifecycle state.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::project::{ProjectDependencies, ProjectFile};

// ---------------------------------------------------------------------------
// Build Job
// ---------------------------------------------------------------------------

/// The immutable unit of work handed to the queue.
///
/// Identity lives on the queue entry, not here: retries resubmit this exact
/// payload and a dead-letter requeue gives it a fresh id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BuildJob {
    pub project_id: String,
    pub files: Vec<ProjectFile>,
    #[serde(default)]
    pub dependencies: ProjectDependencies,
    pub strategy: RuntimeStrategy,
    pub execution_mode: ExecutionMode,
    pub priority: Priority,
    pub metadata: JobMetadata,
}

impl BuildJob {
    /// Per-job timeout override, if the submitter set one.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.metadata
            .timeout_ms
            .map(std::time::Duration::from_millis)
    }
}

/// Fixed job metadata. Unknown keys are rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobMetadata {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl JobMetadata {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            timeout_ms: None,
            env: BTreeMap::new(),
        }
    }
}

/// Newtype for queue entry IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for tables and container names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| Error::NotFound(format!("malformed job id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used for ordering in the store. Higher dequeues first.
    pub fn rank(self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::Other(format!("unknown priority: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Where a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Webcontainer,
    Docker,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Webcontainer => write!(f, "webcontainer"),
            ExecutionMode::Docker => write!(f, "docker"),
        }
    }
}

/// A caller's strategy request. Anything other than `Auto` overrides the analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyChoice {
    #[default]
    Auto,
    Webcontainer,
    Docker,
}

impl StrategyChoice {
    pub fn resolve(self, recommended: ExecutionMode) -> ExecutionMode {
        match self {
            StrategyChoice::Auto => recommended,
            StrategyChoice::Webcontainer => ExecutionMode::Webcontainer,
            StrategyChoice::Docker => ExecutionMode::Docker,
        }
    }
}

impl std::str::FromStr for StrategyChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(StrategyChoice::Auto),
            "webcontainer" => Ok(StrategyChoice::Webcontainer),
            "docker" => Ok(StrategyChoice::Docker),
            other => Err(Error::Other(format!("unknown strategy: {other}"))),
        }
    }
}

/// Known runtime kinds. Each maps to a fixed image family and command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Bun,
    Deno,
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Runtime::Node => "node",
            Runtime::Python => "python",
            Runtime::Bun => "bun",
            Runtime::Deno => "deno",
        };
        write!(f, "{s}")
    }
}

/// Runtime plus the commands the processor runs for each phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeStrategy {
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
}

impl RuntimeStrategy {
    /// Default command set for a runtime. The build command is only set when
    /// the project has a build step.
    pub fn for_runtime(runtime: Runtime, has_build_step: bool) -> Self {
        let (install, build, start) = match runtime {
            Runtime::Node => ("npm install", "npm run build", "npm start"),
            Runtime::Bun => ("bun install", "bun run build", "bun run start"),
            Runtime::Deno => ("deno install", "deno task build", "deno task start"),
            Runtime::Python => (
                "pip install --no-cache-dir -r requirements.txt",
                "python -m build",
                "python main.py",
            ),
        };
        Self {
            runtime,
            version: None,
            install_command: Some(install.to_string()),
            build_command: has_build_step.then(|| build.to_string()),
            start_command: Some(start.to_string()),
        }
    }

    /// [`for_runtime`](Self::for_runtime) with the install command matched
    /// to the manifest actually in `files`. A Python project that ships only
    /// `pyproject.toml` installs itself instead of a requirements file.
    pub fn for_project(runtime: Runtime, files: &[ProjectFile], has_build_step: bool) -> Self {
        let mut strategy = Self::for_runtime(runtime, has_build_step);
        let has = |name: &str| files.iter().any(|f| f.path == name);
        if runtime == Runtime::Python && !has("requirements.txt") && has("pyproject.toml") {
            strategy.install_command = Some("pip install --no-cache-dir .".to_string());
        }
        strategy
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Waiting for a worker, possibly delayed by backoff.
    Pending,
    /// Exclusively owned by one worker for one attempt.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Attempt failed; resolves immediately to Pending or DeadLettered.
    Failed,
    /// Retry budget exhausted. Awaiting operator action.
    DeadLettered,
    /// Withdrawn before any worker picked it up. Terminal.
    Cancelled,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Failed, Pending)       // retry after backoff
                | (Failed, DeadLettered) // exhausted retries
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::DeadLettered | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead-lettered",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead-lettered" => Ok(JobState::DeadLettered),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::Other(format!("unknown job state: {other}"))),
        }
    }
}

/// Validate a state transition, returning an error if disallowed.
pub fn validate_transition(from: JobState, to: JobState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
