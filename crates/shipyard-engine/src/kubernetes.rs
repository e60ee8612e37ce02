//! Kubernetes driver.
//!
//! A build maps onto a single pod. Because the pod starts every declared
//! container at once, each step is first declared with an inert placeholder
//! image. The pod is submitted on the first `run_container`, and every
//! `run_container` then patches its slot's image, which makes the kubelet
//! restart that one container with the real image.
//!
//! Callers must run steps in increasing number order.

mod backoff;
#[cfg(test)]
mod mock;
mod pod;

pub use backoff::Backoff;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, HostAlias, HostPathVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, DeleteParams, LogParams, Patch, PatchParams, PostParams, PropagationPolicy, WatchEvent,
    WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use shipyard_core::image::{is_privileged, normalize_image};
use shipyard_core::volume::{WORKSPACE_MOUNT, parse_volume};
use shipyard_core::{
    Build, Container, Driver, Engine, Error, LogReader, Result, cancellable, log_pipe,
};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const LOOPBACK: &str = "127.0.0.1";
const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// Build a client from a kubeconfig file, or from the in-cluster service
/// account when no path is given.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?
        }
        None => {
            debug!("Using in-cluster configuration");
            Config::incluster().map_err(|e| Error::BackendUnavailable(e.to_string()))?
        }
    };

    Client::try_from(config).map_err(kube_error)
}

/// Map a Kubernetes client error onto the engine error kinds.
fn kube_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 404 => Error::NotFound(response.message),
        kube::Error::Api(response) => Error::Backend(format!(
            "{} ({}, status {})",
            response.message, response.reason, response.code
        )),
        other => Error::BackendUnavailable(other.to_string()),
    }
}

/// Engine for a single build, run as one pod.
pub struct KubernetesRuntime {
    pods: Api<Pod>,
    namespace: String,
    volumes: Vec<String>,
    privileged_images: Vec<String>,
    /// Pod specification, submitted on the first `run_container`.
    pod: Pod,
    created: bool,
    mounts: Vec<VolumeMount>,
    backoff: Backoff,
}

impl KubernetesRuntime {
    pub fn new(
        client: Client,
        namespace: &str,
        volumes: Vec<String>,
        privileged_images: Vec<String>,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            volumes,
            privileged_images,
            pod: empty_pod(),
            created: false,
            mounts: Vec::new(),
            backoff: Backoff::default(),
        }
    }

    /// Replace the schedule used while waiting for log endpoints.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// The pod specification as currently assembled.
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    fn spec_mut(&mut self) -> &mut PodSpec {
        self.pod.spec.get_or_insert_with(PodSpec::default)
    }

    fn pod_name(&self) -> Result<String> {
        self.pod.metadata.name.clone().ok_or_else(|| {
            Error::PreconditionViolated("pod has no name, build was not set up".to_string())
        })
    }

    /// Name of the pod, if it has been submitted.
    fn submitted_name(&self) -> Result<String> {
        if !self.created {
            return Err(Error::PreconditionViolated(
                "pod has not been created".to_string(),
            ));
        }
        self.pod_name()
    }

    async fn create_pod(&mut self, ctx: &CancellationToken) -> Result<()> {
        let mounts = self.mounts.clone();
        pod::attach_mounts(&mut self.pod, &mounts);

        let name = self.pod_name()?;
        info!(pod = %name, namespace = %self.namespace, "Creating pod");

        cancellable(ctx, async {
            self.pods
                .create(&PostParams::default(), &self.pod)
                .await
                .map_err(kube_error)
        })
        .await?;

        self.created = true;
        Ok(())
    }

    async fn delete_pod(&mut self, ctx: &CancellationToken) -> Result<()> {
        if !self.created {
            trace!("Pod was never created, nothing to remove");
            return Ok(());
        }

        let name = self.pod_name()?;
        info!(pod = %name, namespace = %self.namespace, "Removing pod");

        let params = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        let deleted = cancellable(ctx, async {
            self.pods.delete(&name, &params).await.map_err(kube_error)
        })
        .await;

        match deleted {
            Ok(_) => {}
            Err(Error::NotFound(_)) => debug!(pod = %name, "Pod already gone"),
            Err(e) => return Err(e),
        }

        self.pod = empty_pod();
        self.created = false;
        Ok(())
    }
}

fn empty_pod() -> Pod {
    Pod {
        metadata: ObjectMeta::default(),
        spec: Some(PodSpec::default()),
        status: None,
    }
}

#[async_trait]
impl Engine for KubernetesRuntime {
    fn driver(&self) -> Driver {
        Driver::Kubernetes
    }

    async fn create_network(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Creating network");

        let detached = build.all_steps().filter(|step| step.detach);
        let hostnames: Vec<String> = build
            .services
            .iter()
            .chain(detached)
            .map(|ctn| format!("{}.local", ctn.name))
            .collect();

        let alias = HostAlias {
            ip: LOOPBACK.to_string(),
            hostnames: Some(hostnames),
        };
        self.spec_mut()
            .host_aliases
            .get_or_insert_with(Vec::new)
            .push(alias);
        Ok(())
    }

    async fn inspect_network(
        &mut self,
        _ctx: &CancellationToken,
        build: &Build,
    ) -> Result<Vec<u8>> {
        trace!(build = %build.id, "Inspecting network");
        let aliases = self.spec_mut().host_aliases.clone().unwrap_or_default();
        Ok(serde_json::to_vec(&aliases)?)
    }

    async fn remove_network(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Removing network");
        self.spec_mut().host_aliases = None;
        Ok(())
    }

    async fn create_volume(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Creating volume");

        let mut volumes = vec![Volume {
            name: build.id.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: build.id.clone(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            ..Default::default()
        }];

        for (index, volume) in self.volumes.iter().enumerate() {
            let spec = match parse_volume(volume) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(volume = %volume, error = %e, "Skipping malformed host volume");
                    continue;
                }
            };

            // Volume names must be DNS labels, so no underscore here.
            let name = format!("{}-{}", build.id, index);
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: spec.destination.clone(),
                read_only: Some(spec.read_only()),
                ..Default::default()
            });
            volumes.push(Volume {
                name,
                host_path: Some(HostPathVolumeSource {
                    path: spec.source,
                    type_: None,
                }),
                ..Default::default()
            });
        }

        self.spec_mut().volumes = Some(volumes);
        self.mounts = mounts;
        Ok(())
    }

    async fn inspect_volume(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<Vec<u8>> {
        trace!(build = %build.id, "Inspecting volume");
        let volumes = self.spec_mut().volumes.clone().unwrap_or_default();
        Ok(serde_json::to_vec(&volumes)?)
    }

    async fn remove_volume(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Removing volume");
        self.spec_mut().volumes = None;
        self.mounts.clear();
        Ok(())
    }

    async fn setup_build(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Setting up build");

        self.pod.metadata = ObjectMeta {
            name: Some(build.id.clone()),
            labels: Some(BTreeMap::from([(
                "pipeline".to_string(),
                build.id.clone(),
            )])),
            ..Default::default()
        };
        self.spec_mut().restart_policy = Some("Never".to_string());
        Ok(())
    }

    async fn assemble_build(&mut self, _ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Assembling build");
        let mounts = self.mounts.clone();
        pod::attach_mounts(&mut self.pod, &mounts);
        Ok(())
    }

    async fn remove_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()> {
        trace!(build = %build.id, "Removing build");
        self.delete_pod(ctx).await
    }

    async fn setup_container(&mut self, _ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, "Setting up container");

        let privileged = is_privileged(&ctn.image, &self.privileged_images);
        let container = pod::placeholder(ctn, privileged)?;
        self.spec_mut().containers.push(container);
        Ok(())
    }

    async fn run_container(
        &mut self,
        ctx: &CancellationToken,
        _build: &Build,
        ctn: &Container,
    ) -> Result<()> {
        trace!(container = %ctn.id, "Running container");

        let slot = pod::container_slot(ctn)?;
        let declared = self
            .spec_mut()
            .containers
            .get(slot)
            .map(|container| container.name == ctn.id)
            .unwrap_or(false);
        if !declared {
            return Err(Error::PreconditionViolated(format!(
                "container {} was not set up in slot {}",
                ctn.id, slot
            )));
        }

        let image = normalize_image(&ctn.image)?;

        if !self.created {
            self.create_pod(ctx).await?;
        }
        let name = self.submitted_name()?;

        info!(pod = %name, container = %ctn.id, image = %image, "Patching container image");
        let patch = Patch::Strategic(pod::image_patch(&ctn.id, &image));
        cancellable(ctx, async {
            self.pods
                .patch(&name, &PatchParams::default(), &patch)
                .await
                .map_err(kube_error)
        })
        .await?;

        let container = &mut self.spec_mut().containers[slot];
        container.image = Some(image);
        container.image_pull_policy = Some(pod::image_pull_policy(ctn.pull).to_string());

        Ok(())
    }

    async fn wait_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        let name = self.submitted_name()?;
        trace!(pod = %name, container = %ctn.id, "Waiting for container");

        let selector = format!("pipeline={}", name);
        let params = WatchParams::default().labels(&selector);

        // The server closes watches periodically; start a new one until the
        // container settles.
        loop {
            let events = cancellable(ctx, async {
                self.pods.watch(&params, "0").await.map_err(kube_error)
            })
            .await?;
            let mut events = Box::pin(events);

            loop {
                let event = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(Error::Cancelled),
                    event = events.next() => event,
                };

                match event {
                    None => {
                        debug!(pod = %name, "Watch closed, restarting");
                        break;
                    }
                    Some(Err(e)) => return Err(kube_error(e)),
                    Some(Ok(WatchEvent::Added(object) | WatchEvent::Modified(object))) => {
                        if pod::container_completed(&object, &ctn.id) {
                            return Ok(());
                        }
                    }
                    Some(Ok(WatchEvent::Deleted(object))) => {
                        if pod::container_completed(&object, &ctn.id) {
                            return Ok(());
                        }
                        return Err(Error::NotFound(format!(
                            "pod {} was deleted before container {} finished",
                            name, ctn.id
                        )));
                    }
                    Some(Ok(WatchEvent::Error(e))) => {
                        return Err(Error::Backend(format!(
                            "unable to watch pod {}: {}",
                            name, e.message
                        )));
                    }
                    Some(Ok(WatchEvent::Bookmark(_))) => {}
                }
            }
        }
    }

    async fn tail_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &Container,
    ) -> Result<LogReader> {
        let name = self.submitted_name()?;
        trace!(pod = %name, container = %ctn.id, "Capturing logs with exponential backoff");

        let (ready_tx, ready_rx) = oneshot::channel();
        let (reader, writer, stop) = log_pipe(ctx, LOG_BUFFER_SIZE);
        let source = LogSource {
            pods: self.pods.clone(),
            pod: name,
            container: ctn.id.clone(),
            backoff: self.backoff,
        };
        tokio::spawn(source.stream(stop, ready_tx, writer));

        cancellable(ctx, async {
            ready_rx.await.map_err(|_| {
                Error::LogsUnavailable(format!("log task for container {} stopped", ctn.id))
            })?
        })
        .await?;

        Ok(reader)
    }

    async fn inspect_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &mut Container,
    ) -> Result<()> {
        let name = self.submitted_name()?;
        trace!(pod = %name, container = %ctn.id, "Inspecting container");

        let object = cancellable(ctx, async { self.pods.get(&name).await.map_err(kube_error) })
            .await?;

        match pod::exit_code(&object, &ctn.id) {
            Some(code) => ctn.exit_code = Some(code),
            None => debug!(container = %ctn.id, "Container has not terminated"),
        }
        Ok(())
    }

    async fn remove_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, "Removing container");
        self.delete_pod(ctx).await
    }

    async fn create_image(&mut self, _ctx: &CancellationToken, ctn: &Container) -> Result<()> {
        trace!(container = %ctn.id, "Images are pulled by the kubelet");
        Ok(())
    }

    async fn inspect_image(
        &mut self,
        _ctx: &CancellationToken,
        ctn: &Container,
    ) -> Result<Vec<u8>> {
        trace!(container = %ctn.id, "Images are pulled by the kubelet");
        Ok(Vec::new())
    }
}

/// Log endpoint of one container, polled until it yields output.
struct LogSource {
    pods: Api<Pod>,
    pod: String,
    container: String,
    backoff: Backoff,
}

impl LogSource {
    /// Open the log stream with backoff, report readiness on `ready`, then
    /// copy the stream into `writer` until it ends or `stop` fires.
    async fn stream(
        self,
        stop: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
        mut writer: DuplexStream,
    ) {
        let params = LogParams {
            container: Some(self.container.clone()),
            follow: true,
            ..Default::default()
        };
        let mut delays = self.backoff.delays();
        let mut attempts = 0;

        let logs = loop {
            attempts += 1;
            if ready.is_closed() {
                return;
            }

            let opened = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let _ = ready.send(Err(Error::Cancelled));
                    return;
                }
                opened = self.pods.log_stream(&self.pod, &params) => opened,
            };

            match opened {
                Ok(logs) => {
                    let mut logs = Box::pin(logs);
                    let has_output = tokio::select! {
                        biased;
                        _ = stop.cancelled() => {
                            let _ = ready.send(Err(Error::Cancelled));
                            return;
                        }
                        filled = logs.fill_buf() => match filled {
                            Ok(buf) => !buf.is_empty(),
                            Err(e) => {
                                debug!(container = %self.container, error = %e, "Unable to read logs");
                                false
                            }
                        },
                    };
                    if has_output {
                        break logs;
                    }
                    trace!(container = %self.container, attempts, "No logs available yet");
                }
                Err(e) => {
                    debug!(container = %self.container, error = %e, "Unable to open log stream");
                }
            }

            let Some(delay) = delays.next() else {
                let _ = ready.send(Err(Error::LogsUnavailable(format!(
                    "no output from container {} after {} attempts",
                    self.container, attempts
                ))));
                return;
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    let _ = ready.send(Err(Error::Cancelled));
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if ready.send(Ok(())).is_err() {
            return;
        }

        let mut logs = logs.compat();
        tokio::select! {
            _ = stop.cancelled() => {}
            copied = tokio::io::copy(&mut logs, &mut writer) => {
                if let Err(e) = copied {
                    debug!(container = %self.container, error = %e, "Log copy stopped");
                }
            }
        }
        let _ = writer.shutdown().await;
    }
}
