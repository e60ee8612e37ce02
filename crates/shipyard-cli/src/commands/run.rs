//! Pipeline execution command.
//!
//! Drives one build through a runtime engine: resources first, then every
//! step in order, then teardown regardless of how the steps went.

use anyhow::{Context, Result};
use shipyard_config::load_pipeline;
use shipyard_core::{Build, Container, Error, LogReader, RuntimeSetup};
use shipyard_engine::{Backend, Engine};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long to wait for buffered log output once a step has finished.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Outcome {
    Succeeded,
    Failed { step: String, exit_code: i32 },
}

/// Run a pipeline file on the configured runtime.
pub async fn run(setup: RuntimeSetup, path: &Path, build_id: Option<String>) -> Result<()> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline: {}", path.display()))?;

    let build_id = build_id.unwrap_or_else(|| Uuid::now_v7().to_string());
    let build = pipeline
        .compile(&build_id)
        .with_context(|| format!("Failed to compile pipeline: {}", pipeline.name))?;

    let backend = Backend::connect(&setup)
        .await
        .context("Failed to connect to runtime backend")?;
    let mut engine = backend.engine()?;

    let ctx = CancellationToken::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling build");
            interrupt.cancel();
        }
    });

    info!(
        build = %build.id,
        pipeline = %pipeline.name,
        driver = %backend.driver(),
        "Starting build"
    );
    let outcome = execute(&ctx, &mut engine, &build).await;

    // Teardown gets its own token so it still runs after an interrupt.
    teardown(&CancellationToken::new(), &mut engine, &build).await;

    match outcome.with_context(|| format!("Build {} errored", build.id))? {
        Outcome::Succeeded => {
            info!(build = %build.id, "Build succeeded");
            Ok(())
        }
        Outcome::Failed { step, exit_code } => {
            anyhow::bail!("Step '{}' failed with exit code {}", step, exit_code)
        }
    }
}

fn runnable_steps(build: &Build) -> impl Iterator<Item = &Container> {
    build.all_steps().filter(|step| !step.is_init())
}

async fn execute<E: Engine>(
    ctx: &CancellationToken,
    engine: &mut E,
    build: &Build,
) -> shipyard_core::Result<Outcome> {
    engine.create_network(ctx, build).await?;
    engine.create_volume(ctx, build).await?;
    engine.setup_build(ctx, build).await?;
    for step in runnable_steps(build) {
        engine.setup_container(ctx, step).await?;
    }
    engine.assemble_build(ctx, build).await?;

    for step in runnable_steps(build) {
        let mut step = step.clone();
        info!(step = %step.name, image = %step.image, "Running step");
        engine.run_container(ctx, build, &step).await?;

        if step.detach {
            debug!(step = %step.name, "Step detached");
            continue;
        }

        let logs = engine.tail_container(ctx, &step).await?;
        let printer = tokio::spawn(print_logs(logs));

        engine.wait_container(ctx, &step).await?;
        if tokio::time::timeout(LOG_DRAIN_TIMEOUT, printer).await.is_err() {
            warn!(step = %step.name, "Timed out draining step logs");
        }

        engine.inspect_container(ctx, &mut step).await?;
        match step.exit_code {
            Some(0) | None => info!(step = %step.name, "Step succeeded"),
            Some(exit_code) => {
                error!(step = %step.name, exit_code, "Step failed");
                return Ok(Outcome::Failed {
                    step: step.name,
                    exit_code,
                });
            }
        }
    }

    Ok(Outcome::Succeeded)
}

async fn print_logs(mut logs: LogReader) {
    let mut stdout = tokio::io::stdout();
    if let Err(e) = tokio::io::copy(&mut logs, &mut stdout).await {
        warn!(error = %e, "Failed to copy step logs");
    }
}

async fn teardown<E: Engine>(ctx: &CancellationToken, engine: &mut E, build: &Build) {
    for step in runnable_steps(build) {
        report("remove container", engine.remove_container(ctx, step).await);
    }
    report("remove volume", engine.remove_volume(ctx, build).await);
    report("remove network", engine.remove_network(ctx, build).await);
    report("remove build", engine.remove_build(ctx, build).await);
}

fn report(action: &str, result: shipyard_core::Result<()>) {
    match result {
        Ok(()) => {}
        Err(Error::NotFound(what)) => debug!(action, %what, "Already gone"),
        Err(e) => warn!(action, error = %e, "Teardown step failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shipyard_core::{Driver, Result};
    use std::sync::{Arc, Mutex};

    /// Engine that records calls and reports a fixed exit code per step name.
    #[derive(Default)]
    struct RecordingEngine {
        calls: Arc<Mutex<Vec<String>>>,
        exit_codes: Vec<(&'static str, i32)>,
    }

    impl RecordingEngine {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Engine for RecordingEngine {
        fn driver(&self) -> Driver {
            Driver::Docker
        }

        async fn create_network(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("create_network");
            Ok(())
        }

        async fn inspect_network(&mut self, _: &CancellationToken, _: &Build) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn remove_network(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("remove_network");
            Ok(())
        }

        async fn create_volume(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("create_volume");
            Ok(())
        }

        async fn inspect_volume(&mut self, _: &CancellationToken, _: &Build) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn remove_volume(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("remove_volume");
            Ok(())
        }

        async fn setup_build(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("setup_build");
            Ok(())
        }

        async fn assemble_build(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("assemble_build");
            Ok(())
        }

        async fn remove_build(&mut self, _: &CancellationToken, _: &Build) -> Result<()> {
            self.record("remove_build");
            Ok(())
        }

        async fn setup_container(&mut self, _: &CancellationToken, ctn: &Container) -> Result<()> {
            self.record(format!("setup_container {}", ctn.name));
            Ok(())
        }

        async fn run_container(
            &mut self,
            _: &CancellationToken,
            _: &Build,
            ctn: &Container,
        ) -> Result<()> {
            self.record(format!("run_container {}", ctn.name));
            Ok(())
        }

        async fn wait_container(&mut self, _: &CancellationToken, ctn: &Container) -> Result<()> {
            self.record(format!("wait_container {}", ctn.name));
            Ok(())
        }

        async fn tail_container(
            &mut self,
            _: &CancellationToken,
            ctn: &Container,
        ) -> Result<LogReader> {
            self.record(format!("tail_container {}", ctn.name));
            Ok(Box::pin(std::io::Cursor::new(Vec::new())))
        }

        async fn inspect_container(
            &mut self,
            _: &CancellationToken,
            ctn: &mut Container,
        ) -> Result<()> {
            self.record(format!("inspect_container {}", ctn.name));
            ctn.exit_code = Some(
                self.exit_codes
                    .iter()
                    .find(|(name, _)| *name == ctn.name)
                    .map(|(_, code)| *code)
                    .unwrap_or(0),
            );
            Ok(())
        }

        async fn remove_container(&mut self, _: &CancellationToken, ctn: &Container) -> Result<()> {
            self.record(format!("remove_container {}", ctn.name));
            Ok(())
        }

        async fn create_image(&mut self, _: &CancellationToken, _: &Container) -> Result<()> {
            Ok(())
        }

        async fn inspect_image(&mut self, _: &CancellationToken, _: &Container) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn build() -> Build {
        let kdl = r#"
            pipeline "demo"

            step "cache" detach=#true {
                image "redis:7"
            }

            step "test" {
                image "alpine"
                run "make test"
            }

            step "publish" {
                image "alpine"
                run "make publish"
            }
        "#;
        shipyard_config::parse_pipeline(kdl)
            .unwrap()
            .compile("b1")
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_runs_steps_in_order() {
        let mut engine = RecordingEngine::default();
        let ctx = CancellationToken::new();

        let outcome = execute(&ctx, &mut engine, &build()).await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded);

        let calls = engine.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "create_network",
                "create_volume",
                "setup_build",
                "setup_container cache",
                "setup_container test",
                "setup_container publish",
                "assemble_build",
                "run_container cache",
                "run_container test",
                "tail_container test",
                "wait_container test",
                "inspect_container test",
                "run_container publish",
                "tail_container publish",
                "wait_container publish",
                "inspect_container publish",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_stops_at_first_failure() {
        let mut engine = RecordingEngine {
            exit_codes: vec![("test", 2)],
            ..Default::default()
        };
        let ctx = CancellationToken::new();

        let outcome = execute(&ctx, &mut engine, &build()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                step: "test".to_string(),
                exit_code: 2
            }
        );

        let calls = engine.calls.lock().unwrap().clone();
        assert!(!calls.iter().any(|call| call == "run_container publish"));
    }

    #[tokio::test]
    async fn test_teardown_removes_everything() {
        let mut engine = RecordingEngine::default();
        let ctx = CancellationToken::new();

        teardown(&ctx, &mut engine, &build()).await;

        let calls = engine.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "remove_container cache",
                "remove_container test",
                "remove_container publish",
                "remove_volume",
                "remove_network",
                "remove_build",
            ]
        );
    }
}
