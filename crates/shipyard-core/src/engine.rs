//! Engine trait and cancellation helpers.
//!
//! An engine runs the containers of a single build against one backend.
//! Callers drive it in a fixed order: network, volume, build setup, every
//! container's setup, then run/tail/wait/inspect per container, then
//! teardown. Teardown operations must be safe on partially created
//! resources, since they also run after failures.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::pipeline::{Build, Container};
use crate::setup::Driver;
use crate::{Error, Result};

/// Live combined stdout/stderr of a container.
///
/// If consumed, it must be read until it reports end of stream.
pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Reader half of a log pipe; dropping it stops the producer.
struct PipeReader {
    inner: DuplexStream,
    _stop: DropGuard,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// In-memory pipe for streaming container logs to a caller.
///
/// The returned token fires when `ctx` is cancelled or the reader is
/// dropped, so the task feeding the writer can stop even while the backend
/// stream is quiet.
pub fn log_pipe(
    ctx: &CancellationToken,
    capacity: usize,
) -> (LogReader, DuplexStream, CancellationToken) {
    let stop = ctx.child_token();
    let (reader, writer) = tokio::io::duplex(capacity);
    let reader = PipeReader {
        inner: reader,
        _stop: stop.clone().drop_guard(),
    };
    (Box::pin(reader), writer, stop)
}

/// Race `fut` against the cancellation of `ctx`.
pub async fn cancellable<T, F>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Capability set every runtime driver implements.
///
/// One instance serves exactly one build. Methods take `&mut self` because
/// drivers assemble backend requests across calls.
#[async_trait]
pub trait Engine: Send {
    /// Which driver this engine is.
    fn driver(&self) -> Driver;

    // Network

    /// Create the network for the build.
    async fn create_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    /// Describe the build network.
    async fn inspect_network(&mut self, ctx: &CancellationToken, build: &Build)
    -> Result<Vec<u8>>;

    /// Remove the build network.
    async fn remove_network(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    // Volume

    /// Create the shared workspace volume and host mounts for the build.
    async fn create_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    /// Describe the build volume.
    async fn inspect_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<Vec<u8>>;

    /// Remove the build volume.
    async fn remove_volume(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    // Build

    /// Prepare build-level resources before any container is set up.
    async fn setup_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    /// Finalize build-level resources after every container is set up.
    async fn assemble_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    /// Remove build-level resources.
    async fn remove_build(&mut self, ctx: &CancellationToken, build: &Build) -> Result<()>;

    // Container

    /// Prepare a container before any container of the build runs.
    async fn setup_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()>;

    /// Start a container.
    async fn run_container(
        &mut self,
        ctx: &CancellationToken,
        build: &Build,
        ctn: &Container,
    ) -> Result<()>;

    /// Block until the container stops running.
    async fn wait_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()>;

    /// Open a live stream of the container output.
    async fn tail_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &Container,
    ) -> Result<LogReader>;

    /// Record the exit code of a finished container on `ctn`.
    async fn inspect_container(
        &mut self,
        ctx: &CancellationToken,
        ctn: &mut Container,
    ) -> Result<()>;

    /// Stop and delete a container.
    async fn remove_container(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()>;

    // Image

    /// Fetch the container image.
    async fn create_image(&mut self, ctx: &CancellationToken, ctn: &Container) -> Result<()>;

    /// Describe the container image.
    async fn inspect_image(&mut self, ctx: &CancellationToken, ctn: &Container)
    -> Result<Vec<u8>>;
}
