//! Container runtime boundary.
//!
//! The processor only talks to [`ContainerRuntime`]; the Docker engine sits
//! behind [`docker::DockerRuntime`]. Network isolation is applied by the
//! runtime itself for every container, never by the caller's
//! [`ContainerSpec`]. [`run_container`] removes every container it creates
//! once the exit status is in hand.

pub mod docker;

use crate::error::{Error, Result};
use crate::model::{LogSource, Runtime, RuntimeStrategy};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::time::Duration;
use tracing::{debug, warn};

pub use docker::DockerRuntime;

/// Mount point of the job directory inside every container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Fixed per-container resource ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: i64,
}

impl ResourceLimits {
    pub fn new(memory_bytes: i64, cpus: f64) -> Self {
        Self {
            memory_bytes,
            nano_cpus: (cpus * 1e9) as i64,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024, 1.0)
    }
}

/// Everything needed to create one job-and-attempt-scoped container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique per job, attempt and phase.
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub workdir: String,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub limits: ResourceLimits,
}

/// One chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub source: LogSource,
    pub text: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails with [`Error::ResourceUnavailable`] when the engine is unreachable.
    async fn ping(&self) -> Result<()>;

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Follow stdout/stderr until the container exits.
    async fn logs(&self, id: &str) -> Result<BoxStream<'static, Result<LogChunk>>>;

    /// Block until exit and return the exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Stop the container. Already-stopped or removed containers are not an error.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Force-remove the container. Already-removed containers are not an error.
    async fn remove(&self, id: &str) -> Result<()>;

    async fn is_running(&self, id: &str) -> Result<bool>;
}

/// Result of a container that ran to exit.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub container_id: String,
    pub exit_code: i64,
}

/// Create, start and follow a container under a wall-clock limit.
///
/// Each output chunk is handed to `on_output` as it arrives. The exit status
/// is awaited alongside the log stream, not after it. On timeout the
/// container is stopped and [`Error::Timeout`] is returned. The container is
/// removed on every path.
pub async fn run_container<F>(
    runtime: &dyn ContainerRuntime,
    spec: &ContainerSpec,
    limit: Duration,
    mut on_output: F,
) -> Result<ExecOutcome>
where
    F: FnMut(LogChunk) + Send,
{
    let id = runtime.create(spec).await?;
    debug!(container = %spec.name, id = %id, image = %spec.image, "container created");

    let followed = async {
        runtime.start(&id).await?;
        let drained = async {
            let mut logs = runtime.logs(&id).await?;
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(chunk) => on_output(chunk),
                    Err(e) => {
                        warn!(container = %spec.name, error = %e, "log stream error");
                        break;
                    }
                }
            }
            Ok::<_, Error>(())
        };
        let (exit_code, drained) = tokio::join!(runtime.wait(&id), drained);
        drained?;
        exit_code
    };

    let outcome = match tokio::time::timeout(limit, followed).await {
        Ok(Ok(exit_code)) => Ok(ExecOutcome {
            container_id: id.clone(),
            exit_code,
        }),
        Ok(Err(e)) => {
            stop_quietly(runtime, &id).await;
            Err(e)
        }
        Err(_) => {
            warn!(container = %spec.name, limit_ms = limit.as_millis() as u64, "container timed out, stopping");
            stop_quietly(runtime, &id).await;
            Err(Error::Timeout(format!(
                "{} timed out after {}ms",
                spec.name,
                limit.as_millis()
            )))
        }
    };
    remove_quietly(runtime, &id).await;
    outcome
}

async fn stop_quietly(runtime: &dyn ContainerRuntime, id: &str) {
    if let Err(e) = runtime.stop(id).await {
        warn!(id, error = %e, "failed to stop container");
    }
}

async fn remove_quietly(runtime: &dyn ContainerRuntime, id: &str) {
    if let Err(e) = runtime.remove(id).await {
        warn!(id, error = %e, "failed to remove container");
    }
}

/// Image for a runtime and optional version.
pub fn image_for(strategy: &RuntimeStrategy) -> String {
    let version = strategy.version.as_deref().filter(|v| !v.trim().is_empty());
    match strategy.runtime {
        Runtime::Node => format!("node:{}-alpine", version.unwrap_or("20")),
        Runtime::Python => format!("python:{}-slim", version.unwrap_or("3.11")),
        Runtime::Bun => format!("oven/bun:{}-alpine", version.unwrap_or("1")),
        Runtime::Deno => match version {
            Some(v) => format!("denoland/deno:alpine-{v}"),
            None => "denoland/deno:alpine".to_string(),
        },
    }
}

/// Parse a memory limit like `512m`, `2g`, `65536k` or a plain byte count.
pub fn parse_memory_limit(value: &str) -> Result<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some('b') => (&value[..value.len() - 1], 1),
        _ => (value.as_str(), 1),
    };
    digits
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::Config(format!("invalid memory limit: {value}")))
}
