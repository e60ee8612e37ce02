//! Runtime drivers for Shipyard.
//!
//! Provides `Engine` implementations for running pipeline containers:
//! - Docker (one container per step on a single daemon)
//! - Kubernetes (one pod per build)
//!
//! A [`Backend`] holds the long-lived client for the configured driver and
//! hands out a fresh [`Runtime`] per build.

pub mod docker;
pub mod kubernetes;

pub use docker::DockerRuntime;
pub use kubernetes::{Backoff, KubernetesRuntime};
pub use shipyard_core::{Engine, LogReader};

use async_trait::async_trait;
use bollard::Docker;
use shipyard_core::{Build, Container, Driver, Error, Result, RuntimeSetup};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Client shared by every build on one backend.
#[derive(Clone)]
enum BackendClient {
    Docker(Docker),
    Kubernetes(kube::Client),
}

/// Connection to the configured runtime backend.
///
/// Cloning is cheap; clones share the underlying client.
#[derive(Clone)]
pub struct Backend {
    setup: RuntimeSetup,
    client: BackendClient,
}

impl Backend {
    /// Validate `setup` and build a client for its driver.
    pub async fn connect(setup: &RuntimeSetup) -> Result<Self> {
        setup.validate()?;

        let client = match setup.driver {
            Driver::Docker => {
                let address = setup
                    .config
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned());
                BackendClient::Docker(docker::connect(address.as_deref())?)
            }
            Driver::Kubernetes => {
                BackendClient::Kubernetes(kubernetes::connect(setup.config.as_deref()).await?)
            }
        };

        info!(driver = %setup.driver, "Runtime backend configured");
        Ok(Self {
            setup: setup.clone(),
            client,
        })
    }

    pub fn driver(&self) -> Driver {
        self.setup.driver
    }

    /// A fresh engine for one build.
    pub fn engine(&self) -> Result<Runtime> {
        let volumes = self.setup.volumes.clone();
        let privileged = self.setup.privileged_images.clone();

        match &self.client {
            BackendClient::Docker(docker) => Ok(Runtime::Docker(DockerRuntime::new(
                docker.clone(),
                volumes,
                privileged,
            ))),
            BackendClient::Kubernetes(client) => {
                let namespace = self.setup.namespace.as_deref().ok_or_else(|| {
                    Error::InvalidInput("no runtime namespace provided in setup".to_string())
                })?;
                Ok(Runtime::Kubernetes(KubernetesRuntime::new(
                    client.clone(),
                    namespace,
                    volumes,
                    privileged,
                )))
            }
        }
    }
}

/// Engine for one build on whichever driver is configured.
pub enum Runtime {
    Docker(DockerRuntime),
    Kubernetes(KubernetesRuntime),
}

macro_rules! dispatch {
    ($self:ident, $engine:ident => $call:expr) => {
        match $self {
            Runtime::Docker($engine) => $call,
            Runtime::Kubernetes($engine) => $call,
        }
    };
}

#[async_trait]
impl Engine for Runtime {
    fn driver(&self) -> Driver {
        dispatch!(self, e => e.driver())
    }

    async fn create_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.create_network(ctx, build).await)
    }

    async fn inspect_network(
        &mut self,
        ctx: &CancellationToken,
        build: &Build,
    ) -> Result<Vec<u8>> {
        dispatch!(self, e => e.inspect_network(ctx, build).await)
    }

    async fn remove_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.remove_network(ctx, build).await)
    }

    async fn create_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.create_volume(ctx, build).await)
    }

    async fn inspect_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<Vec<u8>> {
        dispatch!(self, e => e.inspect_volume(ctx, build).await)
    }

    async fn remove_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.remove_volume(ctx, build).await)
    }

    async fn setup_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.setup_build(ctx, build).await)
    }

    async fn assemble_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.assemble_build(ctx, build).await)
    }

    async fn remove_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        dispatch!(self, e => e.remove_build(ctx, build).await)
    }

    async fn setup_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        dispatch!(self, e => e.setup_container(ctx, ctn).await)
    }

    async fn run_container(
        &mut self,
        ctx: &CancellationToken,
        build: &Build,
        ctn: &Container,
    ) -> Result<()> {
        dispatch!(self, e => e.run_container(ctx, build, ctn).await)
    }

    async fn wait_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        dispatch!(self, e => e.wait_container(ctx, ctn).await)
    }

    async fn tail_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &Container,
    ) -> Result<LogReader> {
        dispatch!(self, e => e.tail_container(ctx, ctn).await)
    }

    async fn inspect_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &mut Container,
    ) -> Result<()> {
        dispatch!(self, e => e.inspect_container(ctx, ctn).await)
    }

    async fn remove_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        dispatch!(self, e => e.remove_container(ctx, ctn).await)
    }

    async fn create_image(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        dispatch!(self, e => e.create_image(ctx, ctn).await)
    }

    async fn inspect_image(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<Vec<u8>> {
        dispatch!(self, e => e.inspect_image(ctx, ctn).await)
    }
}
