//! Typed configuration from environment variables, optionally overlaid
//! with a TOML file.
//!
//! Loads once at startup and fails fast on malformed values.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::container::{ResourceLimits, parse_memory_limit};
use crate::error::{Error, Result};
use crate::notify::{DeliveryMode, NotifierConfig, WebhookTarget};
use crate::queue::{Retention, RetryPolicy};
use crate::worker::{PoolConfig, ProcessorConfig};
use secrecy::SecretString;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres store. When unset, queues live in process memory.
    pub database_url: Option<SecretString>,
    pub webhook: WebhookSettings,
    pub worker: WorkerSettings,
    pub retry: RetrySettings,
    pub retention: RetentionSettings,
    pub docker: DockerSettings,
    pub build: BuildSettings,
    pub server: ServerSettings,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub url: Option<String>,
    pub secret: Option<SecretString>,
    /// Durable retry mode instead of a single direct POST.
    pub retry_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    /// Claim lease; a worker silent for this long loses its job.
    pub lease_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_delay_ms: u64,
    pub backoff_max_delay_ms: u64,
}

/// Finished entries kept per queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSettings {
    pub keep_completed: u64,
    /// 0 keeps completed entries until the count limit evicts them.
    pub completed_max_age_secs: u64,
    pub keep_failed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerSettings {
    pub host: Option<String>,
    pub memory_limit: String,
    pub cpu_limit: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub build_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Environment, then `path` (if given) overlaid on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("cannot read config file {}: {e}", path.display()))
            })?;
            config.apply_toml(&text)?;
        }
        Ok(config)
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: secrets::optional_secret(var("DATABASE_URL")),
            webhook: WebhookSettings {
                url: var("WEBHOOK_URL"),
                secret: secrets::optional_secret(var("WEBHOOK_SECRET")),
                retry_enabled: parse_var(&var, "WEBHOOK_RETRY_ENABLED", false)?,
                max_retries: parse_var(&var, "WEBHOOK_MAX_RETRIES", 3)?,
                retry_delay_ms: parse_var(&var, "WEBHOOK_RETRY_DELAY", 5000)?,
                timeout_ms: parse_var(&var, "WEBHOOK_TIMEOUT", 10_000)?,
            },
            worker: WorkerSettings {
                concurrency: parse_var(&var, "WORKER_CONCURRENCY", 5)?,
                timeout_ms: parse_var(&var, "WORKER_TIMEOUT", 300_000)?,
                lease_ms: parse_var(&var, "WORKER_LEASE", 30_000)?,
            },
            retry: RetrySettings {
                max_attempts: parse_var(&var, "JOB_MAX_ATTEMPTS", 3)?,
                backoff_delay_ms: parse_var(&var, "JOB_BACKOFF_DELAY", 2000)?,
                backoff_max_delay_ms: parse_var(&var, "JOB_BACKOFF_MAX_DELAY", 60_000)?,
            },
            retention: RetentionSettings {
                keep_completed: parse_var(&var, "JOB_KEEP_COMPLETED", 100)?,
                completed_max_age_secs: parse_var(&var, "JOB_COMPLETED_MAX_AGE", 3600)?,
                keep_failed: parse_var(&var, "JOB_KEEP_FAILED", 500)?,
            },
            docker: DockerSettings {
                host: var("DOCKER_HOST"),
                memory_limit: var("DOCKER_MEMORY_LIMIT").unwrap_or_else(|| "512m".to_string()),
                cpu_limit: parse_var(&var, "DOCKER_CPU_LIMIT", 1.0)?,
            },
            build: BuildSettings {
                build_dir: var("BUILD_DIR")
                    .map_or_else(|| PathBuf::from("/tmp/buildq/builds"), PathBuf::from),
                artifacts_dir: var("ARTIFACTS_DIR")
                    .map_or_else(|| PathBuf::from("/tmp/buildq/artifacts"), PathBuf::from),
            },
            server: ServerSettings {
                host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_var(&var, "PORT", 3001)?,
            },
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a TOML document. Keys that are absent keep their
    /// current value.
    pub fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;

        if let Some(w) = file.worker {
            set(&mut self.worker.concurrency, w.concurrency);
            set(&mut self.worker.timeout_ms, w.timeout_ms);
            set(&mut self.worker.lease_ms, w.lease_ms);
        }
        if let Some(r) = file.retry {
            set(&mut self.retry.max_attempts, r.max_attempts);
            set(&mut self.retry.backoff_delay_ms, r.backoff_delay_ms);
            set(&mut self.retry.backoff_max_delay_ms, r.backoff_max_delay_ms);
        }
        if let Some(r) = file.retention {
            set(&mut self.retention.keep_completed, r.keep_completed);
            set(&mut self.retention.completed_max_age_secs, r.completed_max_age_secs);
            set(&mut self.retention.keep_failed, r.keep_failed);
        }
        if let Some(d) = file.docker {
            if d.host.is_some() {
                self.docker.host = d.host;
            }
            set(&mut self.docker.memory_limit, d.memory_limit);
            set(&mut self.docker.cpu_limit, d.cpu_limit);
        }
        if let Some(b) = file.build {
            set(&mut self.build.build_dir, b.build_dir);
            set(&mut self.build.artifacts_dir, b.artifacts_dir);
        }
        if let Some(h) = file.webhook {
            if h.url.is_some() {
                self.webhook.url = h.url;
            }
            set(&mut self.webhook.retry_enabled, h.retry_enabled);
            set(&mut self.webhook.max_retries, h.max_retries);
            set(&mut self.webhook.retry_delay_ms, h.retry_delay_ms);
            set(&mut self.webhook.timeout_ms, h.timeout_ms);
        }
        if let Some(s) = file.server {
            set(&mut self.server.host, s.host);
            set(&mut self.server.port, s.port);
        }
        self.validate()
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker concurrency must be at least 1".to_string()));
        }
        if self.worker.lease_ms == 0 {
            return Err(Error::Config("WORKER_LEASE must be at least 1ms".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("JOB_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if self.docker.cpu_limit.is_nan() || self.docker.cpu_limit <= 0.0 {
            return Err(Error::Config("DOCKER_CPU_LIMIT must be positive".to_string()));
        }
        parse_memory_limit(&self.docker.memory_limit)?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.backoff_delay_ms),
            max_delay: Duration::from_millis(self.retry.backoff_max_delay_ms),
        }
    }

    /// Independent budget for webhook deliveries.
    pub fn webhook_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.webhook.max_retries.max(1),
            initial_delay: Duration::from_millis(self.webhook.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry.backoff_max_delay_ms),
        }
    }

    /// Build claims; renewed by the worker while a build runs.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.worker.lease_ms)
    }

    /// Delivery claims are not renewed, so they must outlast one request.
    pub fn webhook_lease(&self) -> Duration {
        self.lease()
            .max(Duration::from_millis(self.webhook.timeout_ms.saturating_mul(2)))
    }

    pub fn retention(&self) -> Retention {
        Retention {
            keep_completed: self.retention.keep_completed,
            completed_max_age: (self.retention.completed_max_age_secs > 0)
                .then(|| Duration::from_secs(self.retention.completed_max_age_secs)),
            keep_dead: self.retention.keep_failed,
        }
    }

    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        Ok(ResourceLimits::new(
            parse_memory_limit(&self.docker.memory_limit)?,
            self.docker.cpu_limit,
        ))
    }

    pub fn processor_config(&self) -> Result<ProcessorConfig> {
        Ok(ProcessorConfig {
            build_dir: self.build.build_dir.clone(),
            artifacts_dir: self.build.artifacts_dir.clone(),
            limits: self.resource_limits()?,
            timeout: Duration::from_millis(self.worker.timeout_ms),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.worker.concurrency,
            ..Default::default()
        }
    }

    pub fn notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            mode: if self.webhook.retry_enabled {
                DeliveryMode::DurableRetry
            } else {
                DeliveryMode::Direct
            },
            target: self.webhook.url.clone().map(|url| WebhookTarget {
                url,
                secret: self.webhook.secret.clone(),
            }),
            request_timeout: Duration::from_millis(self.webhook.timeout_ms),
            ..Default::default()
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {e}")))
    }
}

fn parse_var<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

// ---------------------------------------------------------------------------
// File overlay
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    worker: Option<WorkerFile>,
    retry: Option<RetryFile>,
    retention: Option<RetentionFile>,
    docker: Option<DockerFile>,
    build: Option<BuildFile>,
    webhook: Option<WebhookFile>,
    server: Option<ServerFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerFile {
    concurrency: Option<usize>,
    timeout_ms: Option<u64>,
    lease_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryFile {
    max_attempts: Option<u32>,
    backoff_delay_ms: Option<u64>,
    backoff_max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetentionFile {
    keep_completed: Option<u64>,
    completed_max_age_secs: Option<u64>,
    keep_failed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DockerFile {
    host: Option<String>,
    memory_limit: Option<String>,
    cpu_limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFile {
    build_dir: Option<PathBuf>,
    artifacts_dir: Option<PathBuf>,
}

/// Secrets stay in the environment; the file only carries endpoints and
/// retry settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebhookFile {
    url: Option<String>,
    retry_enabled: Option<bool>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerFile {
    host: Option<String>,
    port: Option<u16>,
}
