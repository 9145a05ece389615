//! Docker engine runtime via bollard.

use super::{ContainerRuntime, ContainerSpec, LogChunk};
use crate::error::{Error, Result};
use crate::model::LogSource;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tracing::{debug, info};

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: i64 = 5;
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `host` (`unix://...` or `tcp://...`), or the local default
    /// socket when `None`.
    pub fn connect(host: Option<&str>) -> Result<Self> {
        let docker = match host {
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_socket(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(h) => {
                Docker::connect_with_http(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::ResourceUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn is_status(e: &BollardError, codes: &[u16]) -> bool {
    matches!(e, BollardError::DockerResponseServerError { status_code, .. } if codes.contains(status_code))
}

fn container_err(e: BollardError) -> Error {
    match e {
        BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::RequestTimeoutError => Error::ResourceUnavailable(e.to_string()),
        other => Error::Container(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::ResourceUnavailable(e.to_string()))
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!(image, "image present");
                return Ok(());
            }
            Err(e) if is_status(&e, &[404]) => {}
            Err(e) => return Err(container_err(e)),
        }

        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(container_err)?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(spec.workdir.clone()),
            env: Some(spec.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                memory: Some(spec.limits.memory_bytes),
                nano_cpus: Some(spec.limits.nano_cpus),
                network_mode: Some("none".to_string()),
                // Removal happens after the exit status has been read.
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(container_err)?;
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(container_err)
    }

    async fn logs(&self, id: &str) -> Result<BoxStream<'static, Result<LogChunk>>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        Some(Ok(LogChunk {
                            source: LogSource::Stdout,
                            text: String::from_utf8_lossy(&message).into_owned(),
                        }))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk {
                        source: LogSource::Stderr,
                        text: String::from_utf8_lossy(&message).into_owned(),
                    })),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(container_err(e))),
                }
            });
        Ok(stream.boxed())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut waiting = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match waiting.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(container_err(e)),
            None => Err(Error::Container(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already removed
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(container_err(e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: gone, 409: removal already in progress
            Err(e) if is_status(&e, &[404, 409]) => Ok(()),
            Err(e) => Err(container_err(e)),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_status(&e, &[404]) => Ok(false),
            Err(e) => Err(container_err(e)),
        }
    }
}
