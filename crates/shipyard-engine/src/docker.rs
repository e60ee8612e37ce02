//! Docker driver.
//!
//! Every container of a build shares one named volume mounted at the
//! workspace path and one bridge network named after the build. Containers
//! are created under their own ID so later calls can address them by name.

mod config;
#[cfg(test)]
mod mock;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{ClientVersion, Docker};
use futures::StreamExt;
use shipyard_core::image::{is_privileged, normalize_image};
use shipyard_core::{
    Build, Container, Driver, Engine, Error, LogReader, PullPolicy, Result, cancellable,
    log_pipe,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Docker Engine API version the driver speaks.
pub(crate) const API_VERSION: ClientVersion = ClientVersion {
    major_version: 1,
    minor_version: 41,
};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const REQUEST_TIMEOUT_SECS: u64 = 120;
const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// Connect to a Docker daemon.
///
/// `tcp://` and `http://` addresses are reached over HTTP, anything else is
/// treated as a local socket path. Without an address the default socket is
/// used. Local sockets must exist at connect time; HTTP addresses are not
/// contacted until the first engine call.
pub fn connect(address: Option<&str>) -> Result<Docker> {
    let docker = match address {
        Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
            Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, &API_VERSION)
        }
        Some(addr) => Docker::connect_with_local(
            addr.trim_start_matches("unix://"),
            REQUEST_TIMEOUT_SECS,
            &API_VERSION,
        ),
        None => Docker::connect_with_local(DEFAULT_SOCKET, REQUEST_TIMEOUT_SECS, &API_VERSION),
    };

    docker.map_err(|e| Error::BackendUnavailable(e.to_string()))
}

/// Map a Docker client error onto the engine error kinds.
fn docker_error(err: DockerError) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => Error::Backend(format!("{} (status {})", message, status_code)),
        DockerError::DockerStreamError { error } => Error::Backend(error),
        other => Error::BackendUnavailable(other.to_string()),
    }
}

/// Engine for a single build on a Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    volumes: Vec<String>,
    privileged_images: Vec<String>,
    /// Mounts computed when the build volume is created.
    mounts: Vec<Mount>,
    // Payload of the most recently started container; cleared on removal.
    ctn_conf: Option<Config<String>>,
    host_conf: Option<HostConfig>,
    net_conf: Option<NetworkingConfig<String>>,
}

impl DockerRuntime {
    pub fn new(docker: Docker, volumes: Vec<String>, privileged_images: Vec<String>) -> Self {
        Self {
            docker,
            volumes,
            privileged_images,
            mounts: Vec::new(),
            ctn_conf: None,
            host_conf: None,
            net_conf: None,
        }
    }

    async fn pull(&self, ctx: &CancellationToken, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        let mut stdout = tokio::io::stdout();

        while let Some(item) = cancellable(ctx, async { Ok(progress.next().await) }).await? {
            let item = item.map_err(docker_error)?;
            let mut line = serde_json::to_vec(&item)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
        }
        stdout.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl Engine for DockerRuntime {
    fn driver(&self) -> Driver {
        Driver::Docker
    }

    async fn create_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(network = %build.id, "Creating network");

        let options = CreateNetworkOptions {
            name: build.id.clone(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        cancellable(ctx, async {
            self.docker
                .create_network(options)
                .await
                .map_err(docker_error)
        })
        .await?;

        Ok(())
    }

    async fn inspect_network(
        &mut self,
        ctx: &CancellationToken,
        build: &Build,
    ) -> Result<Vec<u8>> {
        trace!(network = %build.id, "Inspecting network");

        let network = cancellable(ctx, async {
            self.docker
                .inspect_network(&build.id, None::<InspectNetworkOptions<String>>)
                .await
                .map_err(docker_error)
        })
        .await?;

        let mut out = serde_json::to_vec_pretty(&network)?;
        out.push(b'\n');
        Ok(out)
    }

    async fn remove_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(network = %build.id, "Removing network");

        cancellable(ctx, async {
            self.docker
                .remove_network(&build.id)
                .await
                .map_err(docker_error)
        })
        .await
    }

    async fn create_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(volume = %build.id, "Creating volume");

        let options = CreateVolumeOptions {
            name: build.id.clone(),
            driver: "local".to_string(),
            ..Default::default()
        };
        cancellable(ctx, async {
            self.docker
                .create_volume(options)
                .await
                .map_err(docker_error)
        })
        .await?;

        self.mounts = config::build_mounts(&build.id, &self.volumes);
        Ok(())
    }

    async fn inspect_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<Vec<u8>> {
        trace!(volume = %build.id, "Inspecting volume");

        let volume = cancellable(ctx, async {
            self.docker
                .inspect_volume(&build.id)
                .await
                .map_err(docker_error)
        })
        .await?;

        let mut out = serde_json::to_vec_pretty(&volume)?;
        out.push(b'\n');
        Ok(out)
    }

    async fn remove_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(volume = %build.id, "Removing volume");

        cancellable(ctx, async {
            self.docker
                .remove_volume(&build.id, Some(RemoveVolumeOptions { force: true }))
                .await
                .map_err(docker_error)
        })
        .await
    }

    async fn setup_build(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "No build setup needed for docker");
        Ok(())
    }

    async fn assemble_build(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "No build assembly needed for docker");
        Ok(())
    }

    async fn remove_build(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "No build removal needed for docker");
        Ok(())
    }

    async fn setup_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, pull = %ctn.pull, "Setting up container");

        let image = normalize_image(&ctn.image)?;

        match ctn.pull {
            PullPolicy::Always => self.pull(ctx, &image).await,
            PullPolicy::NotPresent => {
                let found = cancellable(ctx, async {
                    self.docker.inspect_image(&image).await.map_err(docker_error)
                })
                .await;

                match found {
                    Ok(_) => {
                        debug!(image = %image, "Image already present");
                        Ok(())
                    }
                    Err(Error::NotFound(_)) => self.pull(ctx, &image).await,
                    Err(e) => Err(e),
                }
            }
            PullPolicy::Never | PullPolicy::OnStart => Ok(()),
        }
    }

    async fn run_container(
        &mut self,
        ctx: &CancellationToken,
        build: &Build,
        ctn: &Container,
    ) -> Result<()> {
        let image = normalize_image(&ctn.image)?;

        if ctn.pull == PullPolicy::OnStart {
            self.pull(ctx, &image).await?;
        }

        let privileged = is_privileged(&ctn.image, &self.privileged_images);
        let host_conf = config::host_config(&self.mounts, privileged);
        let net_conf = config::network_config(&build.id, &ctn.name);
        let mut ctn_conf = config::container_config(ctn, &image);
        ctn_conf.host_config = Some(host_conf.clone());
        ctn_conf.networking_config = Some(net_conf.clone());

        info!(container = %ctn.id, image = %image, privileged, "Creating container");
        let options = CreateContainerOptions {
            name: ctn.id.clone(),
            platform: None,
        };
        let payload = ctn_conf.clone();
        cancellable(ctx, async {
            self.docker
                .create_container(Some(options), payload)
                .await
                .map_err(docker_error)
        })
        .await?;

        self.ctn_conf = Some(ctn_conf);
        self.host_conf = Some(host_conf);
        self.net_conf = Some(net_conf);

        info!(container = %ctn.id, "Starting container");
        cancellable(ctx, async {
            self.docker
                .start_container(&ctn.id, None::<StartContainerOptions<String>>)
                .await
                .map_err(docker_error)
        })
        .await
    }

    async fn wait_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, "Waiting for container");

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(&ctn.id, Some(options));

        match cancellable(ctx, async { Ok(wait.next().await) }).await? {
            Some(Ok(response)) => {
                debug!(container = %ctn.id, status = response.status_code, "Container stopped");
                Ok(())
            }
            // A non-zero exit is reported by inspection, not by waiting.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                debug!(container = %ctn.id, status = code, "Container stopped");
                Ok(())
            }
            Some(Err(e)) => Err(docker_error(e)),
            None => Ok(()),
        }
    }

    async fn tail_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &Container,
    ) -> Result<LogReader> {
        trace!(container = %ctn.id, "Capturing container logs");

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(&ctn.id, Some(options));
        let (reader, mut writer, stop) = log_pipe(ctx, LOG_BUFFER_SIZE);

        let id = ctn.id.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(container = %id, "Log reader closed");
                        break;
                    }
                    next = logs.next() => next,
                };

                match next {
                    Some(Ok(output)) => {
                        if writer.write_all(&output.into_bytes()).await.is_err() {
                            debug!(container = %id, "Log reader closed");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(container = %id, error = %e, "Unable to copy container logs");
                        break;
                    }
                    None => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(reader)
    }

    async fn inspect_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &mut Container,
    ) -> Result<()> {
        trace!(container = %ctn.id, "Inspecting container");

        let info = cancellable(ctx, async {
            self.docker
                .inspect_container(&ctn.id, None::<InspectContainerOptions>)
                .await
                .map_err(docker_error)
        })
        .await?;

        if let Some(code) = info.state.and_then(|state| state.exit_code) {
            ctn.exit_code = Some(code as i32);
        }
        Ok(())
    }

    async fn remove_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, "Removing container");

        let info = cancellable(ctx, async {
            self.docker
                .inspect_container(&ctn.id, None::<InspectContainerOptions>)
                .await
                .map_err(docker_error)
        })
        .await?;

        let active = info.state.is_some_and(|state| {
            state.paused.unwrap_or(false)
                || state.restarting.unwrap_or(false)
                || state.running.unwrap_or(false)
        });

        if active {
            debug!(container = %ctn.id, "Killing container");
            cancellable(ctx, async {
                self.docker
                    .kill_container(&ctn.id, Some(KillContainerOptions { signal: "SIGKILL" }))
                    .await
                    .map_err(docker_error)
            })
            .await?;
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        };
        cancellable(ctx, async {
            self.docker
                .remove_container(&ctn.id, Some(options))
                .await
                .map_err(docker_error)
        })
        .await?;

        self.ctn_conf = None;
        self.host_conf = None;
        self.net_conf = None;
        Ok(())
    }

    async fn create_image(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        let image = normalize_image(&ctn.image)?;
        self.pull(ctx, &image).await
    }

    async fn inspect_image(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<Vec<u8>> {
        if ctn.pull == PullPolicy::OnStart {
            return Ok(format!(
                "skipped for container {} due to pull policy {}\n",
                ctn.id, ctn.pull
            )
            .into_bytes());
        }

        let image = normalize_image(&ctn.image)?;
        trace!(image = %image, "Inspecting image");

        let info = cancellable(ctx, async {
            self.docker.inspect_image(&image).await.map_err(docker_error)
        })
        .await?;

        Ok(format!("{}\n", info.id.unwrap_or_default()).into_bytes())
    }
}
