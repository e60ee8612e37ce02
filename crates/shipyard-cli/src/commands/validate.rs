//! Pipeline validation command.

use anyhow::{Context, Result};
use shipyard_config::load_pipeline;
use std::path::Path;
use uuid::Uuid;

/// Parse and compile a pipeline without running it.
pub fn validate(path: &Path, json: bool) -> Result<()> {
    let pipeline = load_pipeline(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    let build = pipeline
        .compile(&Uuid::now_v7().to_string())
        .with_context(|| format!("Configuration error in {}", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&build)?);
        return Ok(());
    }

    println!("Configuration is valid");
    println!("  Pipeline: {}", pipeline.name);
    println!("  Services: {}", build.services.len());
    println!("  Stages:   {}", pipeline.stages.len());
    println!("  Steps:    {}", build.all_steps().filter(|s| !s.is_init()).count());
    Ok(())
}
