//! Shared test fixtures: a scripted container runtime and job builders.

#![allow(dead_code)]

use async_trait::async_trait;
use buildq::container::{ContainerRuntime, ContainerSpec, LogChunk};
use buildq::error::{Error, Result};
use buildq::model::*;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// What a phase's container does when run.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i64,
    pub stdout: String,
    /// Never exits; only a stop ends it.
    pub hang: bool,
    /// Files written into the bound workspace before exit, relative to it.
    pub writes: Vec<(String, String)>,
    /// The engine discards the exit status the moment the log stream ends,
    /// so only a wait already in flight by then sees it.
    pub vanish_on_exit: bool,
    /// Wall-clock run time before exit.
    pub runs_for: Option<Duration>,
}

impl Script {
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn output(mut self, text: &str) -> Self {
        self.stdout = text.to_string();
        self
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn writes(mut self, path: &str, content: &str) -> Self {
        self.writes.push((path.to_string(), content.to_string()));
        self
    }

    pub fn runs_for(mut self, duration: Duration) -> Self {
        self.runs_for = Some(duration);
        self
    }

    pub fn vanishing(mut self) -> Self {
        self.vanish_on_exit = true;
        self
    }
}

/// In-process stand-in for the Docker engine. Container ids are the
/// container names, and the phase is the last `-` segment of the name.
#[derive(Default)]
pub struct FakeRuntime {
    pub unavailable: bool,
    scripts: Mutex<HashMap<String, Script>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub images: Mutex<Vec<String>>,
    pub running: Mutex<HashSet<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    exited: Arc<Mutex<HashSet<String>>>,
    exit_signal: Arc<Notify>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    pub fn script(self, phase: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(phase.to_string(), script);
        self
    }

    pub fn phases_run(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|spec| phase_of(&spec.name).to_string())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    fn script_for(&self, id: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(phase_of(id))
            .cloned()
            .unwrap_or_default()
    }

    fn workspace_of(&self, id: &str) -> Option<PathBuf> {
        let created = self.created.lock().unwrap();
        let spec = created.iter().find(|s| s.name == id)?;
        let bind = spec.binds.first()?;
        let (host, _) = bind.rsplit_once(':')?;
        Some(PathBuf::from(host))
    }
}

fn phase_of(name: &str) -> &str {
    name.rsplit('-').next().unwrap_or(name)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::ResourceUnavailable("docker daemon not reachable".into()))
        } else {
            Ok(())
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.images.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.running.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<BoxStream<'static, Result<LogChunk>>> {
        let script = self.script_for(id);
        let chunks: Vec<Result<LogChunk>> = if script.stdout.is_empty() {
            Vec::new()
        } else {
            vec![Ok(LogChunk {
                source: LogSource::Stdout,
                text: script.stdout,
            })]
        };
        if !script.vanish_on_exit {
            return Ok(stream::iter(chunks).boxed());
        }
        let exited = Arc::clone(&self.exited);
        let signal = Arc::clone(&self.exit_signal);
        let id = id.to_string();
        let exit = stream::once(async move {
            exited.lock().unwrap().insert(id);
            signal.notify_waiters();
        })
        .filter_map(|()| async { None::<Result<LogChunk>> });
        Ok(stream::iter(chunks).chain(exit).boxed())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let script = self.script_for(id);
        if script.hang {
            return std::future::pending().await;
        }
        if let Some(duration) = script.runs_for {
            tokio::time::sleep(duration).await;
        }
        if script.vanish_on_exit {
            if self.exited.lock().unwrap().contains(id) {
                return Err(Error::Container(format!("no such container: {id}")));
            }
            loop {
                let exited = self.exit_signal.notified();
                if self.exited.lock().unwrap().contains(id) {
                    break;
                }
                exited.await;
            }
        }
        if let Some(dir) = self.workspace_of(id) {
            for (path, content) in &script.writes {
                let target = dir.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, content)?;
            }
        }
        self.running.lock().unwrap().remove(id);
        Ok(script.exit_code)
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.running.lock().unwrap().remove(id);
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.running.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(id))
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub fn node_job(project_id: &str, files: Vec<ProjectFile>, has_build_step: bool) -> BuildJob {
    BuildJob {
        project_id: project_id.to_string(),
        files,
        dependencies: ProjectDependencies::default(),
        strategy: RuntimeStrategy::for_runtime(Runtime::Node, has_build_step),
        execution_mode: ExecutionMode::Docker,
        priority: Priority::Normal,
        metadata: JobMetadata::now(),
    }
}

pub fn vite_project() -> Vec<ProjectFile> {
    vec![
        ProjectFile::new(
            "package.json",
            r#"{"name":"app","scripts":{"build":"vite build"}}"#,
        ),
        ProjectFile::new("index.html", "<html></html>"),
        ProjectFile::new("vite.config.ts", "export default {}"),
    ]
}
