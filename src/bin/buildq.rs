//! buildq CLI: operator interface to the build queue.

use buildq::analysis::ComplexityAnalyzer;
use buildq::config::Config;
use buildq::config::secrets::{ExposeSecret, redact_url};
use buildq::container::DockerRuntime;
use buildq::db::Db;
use buildq::model::{BuildJob, JobId, Priority, ProjectFile, StrategyChoice};
use buildq::notify::{DeliveryMode, WEBHOOK_QUEUE, WebhookNotifier};
use buildq::orchestrator::{BuildOrchestrator, BuildRequest, WaitOptions};
use buildq::progress::ProgressHub;
use buildq::queue::{JobQueue, MemoryStore, QueueStats, QueueStore};
use buildq::server::{AppState, serve};
use buildq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use buildq::worker::{BUILD_QUEUE, BuildProcessor, WorkerPool};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Directories never read into a submitted project.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "__pycache__", ".venv", "target"];

#[derive(Parser)]
#[command(name = "buildq", about = "Queue-driven containerized build execution")]
struct Cli {
    /// Optional TOML file overlaid on the environment
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API, the worker pool and webhook delivery
    Serve {
        /// Serve the API without running builds in this process
        #[arg(long)]
        no_workers: bool,
    },
    /// Run only the worker pool and webhook delivery
    Worker,
    /// Score a project directory without submitting it
    Analyze {
        /// Project directory
        dir: PathBuf,
    },
    /// Submit a project directory for building
    Submit {
        /// Project directory
        dir: PathBuf,
        /// Project id (defaults to the directory name)
        #[arg(long)]
        project_id: Option<String>,
        /// low | normal | high | critical
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// auto | webcontainer | docker
        #[arg(long, default_value = "auto")]
        strategy: StrategyChoice,
        /// Block until the build finishes
        #[arg(long)]
        wait: bool,
        /// Seconds to wait with --wait
        #[arg(long, default_value_t = 600)]
        wait_secs: u64,
    },
    /// Show a build
    Status {
        /// Build ID
        id: String,
    },
    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Queue counts for builds and webhooks
    Stats,
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered builds
    List {
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = 49)]
        end: u64,
    },
    /// Requeue a dead-lettered build under a new id
    Retry {
        /// Build ID
        id: String,
    },
    /// Purge every dead-lettered build
    Clear,
}

/// Everything a process needs to submit and run builds.
struct Runtime {
    config: Config,
    hub: Arc<ProgressHub>,
    builds: JobQueue<BuildJob>,
    notifier: Arc<WebhookNotifier>,
}

impl Runtime {
    /// Postgres when `DATABASE_URL` is set, otherwise an in-process store.
    async fn open(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn QueueStore> = match &config.database_url {
            Some(url) => {
                info!(database = %redact_url(url), "using Postgres queue store");
                let db = Db::connect(url.expose_secret()).await?;
                db.migrate().await?;
                db.listen().await?;
                Arc::new(db)
            }
            None => {
                warn!("DATABASE_URL not set, queues are in-memory and will not survive restart");
                Arc::new(MemoryStore::new())
            }
        };

        let hub = Arc::new(ProgressHub::new());
        let builds = JobQueue::new(BUILD_QUEUE, Arc::clone(&store), config.retry_policy())
            .with_lease(config.lease())
            .with_retention(config.retention());
        let deliveries = JobQueue::new(
            WEBHOOK_QUEUE,
            Arc::clone(&store),
            config.webhook_retry_policy(),
        )
        .with_lease(config.webhook_lease())
        .with_retention(config.retention());
        let notifier = Arc::new(WebhookNotifier::new(config.notifier_config(), deliveries)?);

        Ok(Self {
            config,
            hub,
            builds,
            notifier,
        })
    }

    /// For commands that only make sense against a shared store.
    async fn open_shared(config: Config) -> anyhow::Result<Self> {
        if config.database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required for this command");
        }
        Self::open(config).await
    }

    fn orchestrator(&self) -> BuildOrchestrator {
        BuildOrchestrator::new(self.builds.clone(), Arc::clone(&self.hub))
    }

    /// Start the worker pool and webhook delivery workers.
    async fn start_workers(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<tokio::task::JoinHandle<()>>> {
        let docker = DockerRuntime::connect(self.config.docker.host.as_deref())?;
        let processor = Arc::new(BuildProcessor::new(
            Arc::new(docker),
            Arc::clone(&self.hub),
            self.config.processor_config()?,
        ));
        tokio::fs::create_dir_all(&self.config.build.build_dir).await?;
        tokio::fs::create_dir_all(&self.config.build.artifacts_dir).await?;

        let pool = Arc::new(
            WorkerPool::new(
                self.builds.clone(),
                processor,
                Arc::clone(&self.hub),
                self.config.pool_config(),
            )
            .with_notifier(Arc::clone(&self.notifier)),
        );

        let mut handles = pool.spawn();
        let stop = pool.cancellation_token();
        let outer = cancel.clone();
        tokio::spawn(async move {
            outer.cancelled().await;
            stop.cancel();
        });

        if self.notifier.mode() == DeliveryMode::DurableRetry {
            handles.extend(self.notifier.spawn_delivery_workers(1, cancel.clone()));
        }
        Ok(handles)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { no_workers } => cmd_serve(config, no_workers).await,
        Command::Worker => cmd_worker(config).await,
        Command::Analyze { dir } => cmd_analyze(&dir),
        Command::Submit {
            dir,
            project_id,
            priority,
            strategy,
            wait,
            wait_secs,
        } => {
            let rt = Runtime::open_shared(config).await?;
            cmd_submit(&rt, &dir, project_id, priority, strategy, wait, wait_secs).await
        }
        Command::Status { id } => {
            let rt = Runtime::open_shared(config).await?;
            cmd_status(&rt, &id).await
        }
        Command::Dlq { action } => {
            let rt = Runtime::open_shared(config).await?;
            match action {
                DlqAction::List { start, end } => cmd_dlq_list(&rt, start, end).await,
                DlqAction::Retry { id } => {
                    let new_id = rt.builds.requeue_dead(id.parse()?).await?;
                    println!("Requeued as {new_id}");
                    Ok(())
                }
                DlqAction::Clear => {
                    let purged = rt.builds.clear_dead().await?;
                    println!("Purged {purged} dead-lettered build(s)");
                    Ok(())
                }
            }
        }
        Command::Stats => {
            let rt = Runtime::open_shared(config).await?;
            cmd_stats(&rt).await
        }
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "buildq".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        token.cancel();
    });
    cancel
}

async fn cmd_serve(config: Config, no_workers: bool) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;
    let addr = config.bind_addr()?;
    let rt = Runtime::open(config).await?;
    let cancel = shutdown_on_ctrl_c();

    let workers = if no_workers {
        Vec::new()
    } else {
        rt.start_workers(&cancel).await?
    };

    let state = Arc::new(AppState {
        orchestrator: Arc::new(rt.orchestrator()),
        hub: Arc::clone(&rt.hub),
        notifier: Some(Arc::clone(&rt.notifier)),
    });
    serve(addr, state, cancel.clone()).await?;

    for handle in workers {
        handle.await.ok();
    }
    Ok(())
}

async fn cmd_worker(config: Config) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;
    let rt = Runtime::open_shared(config).await?;
    let cancel = shutdown_on_ctrl_c();
    for handle in rt.start_workers(&cancel).await? {
        handle.await.ok();
    }
    Ok(())
}

/// Read every text file under `dir` as a project file.
fn read_project(dir: &Path) -> anyhow::Result<Vec<ProjectFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !(e.file_type().is_dir()
                && SKIPPED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir)?;
        match std::fs::read_to_string(entry.path()) {
            Ok(content) => files.push(ProjectFile::new(
                relative.to_string_lossy().replace('\\', "/"),
                content,
            )),
            Err(e) => eprintln!("skipping {}: {e}", relative.display()),
        }
    }
    Ok(files)
}

fn cmd_analyze(dir: &Path) -> anyhow::Result<()> {
    let files = read_project(dir)?;
    let analysis = ComplexityAnalyzer::new().analyze(&files, None);

    println!("Score:       {}", analysis.score);
    println!("Strategy:    {}", analysis.recommended_strategy);
    println!("Files:       {}", analysis.factors.file_count);
    println!("Size:        {} bytes", analysis.factors.total_size_bytes);
    println!("Deps:        {}", analysis.factors.dependency_count);
    println!("Heavy:       {}", analysis.factors.has_heavy_dependencies);
    println!("Native:      {}", analysis.factors.has_native_dependencies);
    println!("Build step:  {}", analysis.factors.has_build_step);
    println!("Reasoning:   {}", analysis.reasoning);
    Ok(())
}

async fn cmd_submit(
    rt: &Runtime,
    dir: &Path,
    project_id: Option<String>,
    priority: Priority,
    strategy: StrategyChoice,
    wait: bool,
    wait_secs: u64,
) -> anyhow::Result<()> {
    let project_id = match project_id {
        Some(id) => id,
        None => dir
            .canonicalize()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string()),
    };
    let mut request = BuildRequest::new(project_id, read_project(dir)?);
    request.priority = priority;
    request.strategy = strategy;

    let orchestrator = rt.orchestrator();
    let created = orchestrator.create_build(request).await?;
    println!("Build:     {}", created.build_id);
    println!("Strategy:  {}", created.strategy);
    println!("Score:     {}", created.complexity.score);
    for warning in &created.warnings {
        println!("Warning:   {warning}");
    }

    if wait {
        let status = orchestrator
            .wait_for_completion(
                created.build_id,
                WaitOptions {
                    timeout: Duration::from_secs(wait_secs),
                    ..Default::default()
                },
            )
            .await?;
        println!("Status:    {}", status.status);
        if let Some(error) = status.error {
            println!("Error:     {error}");
        }
        for artifact in &status.artifacts {
            println!("Artifact:  {} ({} bytes)", artifact.name, artifact.size_bytes);
        }
    }
    Ok(())
}

async fn cmd_status(rt: &Runtime, id: &str) -> anyhow::Result<()> {
    let id: JobId = id.parse()?;
    let status = rt.orchestrator().get_status(id).await?;

    println!("ID:         {}", status.build_id);
    println!(
        "Project:    {}",
        status.project_id.as_deref().unwrap_or("-")
    );
    println!("Status:     {}", status.status);
    println!("Progress:   {}%", status.progress);
    if let Some(message) = &status.message {
        println!("Message:    {message}");
    }
    println!("Attempts:   {}/{}", status.attempts, status.max_attempts);
    println!("Created:    {}", status.created_at);
    if let Some(finished) = status.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(error) = &status.error {
        println!("Error:      {error}");
    }
    if let Some(tests) = &status.test_results {
        println!(
            "Tests:      {} passed, {} failed, {} skipped",
            tests.passed_count, tests.failed_count, tests.skipped_count
        );
    }
    for artifact in &status.artifacts {
        println!("Artifact:   {} ({} bytes)", artifact.name, artifact.size_bytes);
    }
    if !status.logs.is_empty() {
        println!("---");
        for entry in &status.logs {
            println!(
                "{} {:<5} {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.level,
                entry.message
            );
        }
    }
    Ok(())
}

async fn cmd_dlq_list(rt: &Runtime, start: u64, end: u64) -> anyhow::Result<()> {
    let entries = rt.builds.dead_letters(start, end).await?;
    if entries.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<8}  {:<40}  FINISHED",
        "ID", "PROJECT", "ATTEMPTS", "ERROR"
    );
    println!("{}", "-".repeat(100));
    for entry in &entries {
        let project = entry
            .decode::<BuildJob>()
            .map(|job| job.project_id)
            .unwrap_or_else(|_| "-".to_string());
        let error: String = entry
            .last_error
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(40)
            .collect();
        println!(
            "{:<8}  {:<20}  {:<8}  {:<40}  {}",
            entry.id.short(),
            project,
            format!("{}/{}", entry.attempts, entry.max_attempts),
            error,
            entry
                .finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("\n{} entry(s)", entries.len());
    Ok(())
}

async fn cmd_stats(rt: &Runtime) -> anyhow::Result<()> {
    println!(
        "{:<10}  {:>8}  {:>8}  {:>9}  {:>8}  {:>9}  {:>8}",
        "QUEUE", "WAITING", "ACTIVE", "COMPLETED", "FAILED", "CANCELLED", "TOTAL"
    );
    let rows: [(&str, QueueStats); 2] = [
        (BUILD_QUEUE, rt.builds.stats().await?),
        (WEBHOOK_QUEUE, rt.notifier.stats().await?),
    ];
    for (name, s) in rows {
        println!(
            "{:<10}  {:>8}  {:>8}  {:>9}  {:>8}  {:>9}  {:>8}",
            name, s.waiting, s.active, s.completed, s.failed, s.cancelled, s.total
        );
    }
    Ok(())
}
