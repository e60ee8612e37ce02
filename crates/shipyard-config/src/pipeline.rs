//! Pipeline configuration parsing and compilation.
//!
//! A pipeline file declares services and either flat steps or stages of
//! steps:
//!
//! ```kdl
//! pipeline "demo"
//!
//! service "postgres" {
//!     image "postgres:16"
//! }
//!
//! stage "test" {
//!     step "unit" pull="always" {
//!         image "golang:1.22"
//!         run "go test ./..."
//!     }
//! }
//! ```
//!
//! [`Pipeline::compile`] turns the parsed file into the [`Build`] handed to a
//! runtime engine.

use crate::nodes::*;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use shipyard_core::pipeline::{INIT_IMAGE, INIT_NAME};
use shipyard_core::volume::WORKSPACE_MOUNT;
use shipyard_core::{Build, Container, PullPolicy, Stage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

/// Interpreter used when a step declares commands but no entrypoint.
const DEFAULT_ENTRYPOINT: [&str; 2] = ["/bin/sh", "-c"];

// Names end up in pod, volume and container names, so they must be DNS labels.
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

const MAX_NAME_LEN: usize = 63;

/// A parsed pipeline file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub name: String,
    pub services: Vec<StepConfig>,
    pub steps: Vec<StepConfig>,
    pub stages: Vec<StageConfig>,
}

/// A `step` or `service` node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepConfig {
    pub name: String,
    pub image: String,
    pub pull: PullPolicy,
    pub detach: bool,
    pub commands: Vec<String>,
    pub entrypoint: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub directory: Option<String>,
}

/// A `stage` node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub needs: Vec<String>,
    pub steps: Vec<StepConfig>,
}

/// Read and parse a pipeline file.
pub fn load_pipeline(path: impl AsRef<Path>) -> ConfigResult<Pipeline> {
    let text = std::fs::read_to_string(path)?;
    parse_pipeline(&text)
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<Pipeline> {
    let doc: KdlDocument = kdl.parse()?;
    let mut pipeline = Pipeline::default();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                pipeline.name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "service" => pipeline.services.push(parse_step(node, "service")?),
            "step" => pipeline.steps.push(parse_step(node, "step")?),
            "stage" => pipeline.stages.push(parse_stage(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    if pipeline.name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    validate(&pipeline)?;

    Ok(pipeline)
}

fn parse_step(node: &KdlNode, kind: &str) -> ConfigResult<StepConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", kind)))?;

    let pull = match get_string_prop(node, "pull") {
        Some(policy) => policy.parse().map_err(|e| {
            ConfigError::invalid(format!("pull for {} '{}'", kind, name), format!("{}", e))
        })?,
        None => PullPolicy::default(),
    };

    let mut step = StepConfig {
        name,
        pull,
        detach: get_bool_prop(node, "detach").unwrap_or(false),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    step.image = get_first_string_arg(child).unwrap_or_default();
                }
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        step.commands.push(cmd);
                    }
                }
                "entrypoint" => {
                    step.entrypoint = get_all_string_args(child);
                }
                "directory" => {
                    step.directory = get_first_string_arg(child);
                }
                "env" => {
                    step.environment.extend(get_env_block(child));
                }
                _ => {}
            }
        }
    }

    if step.image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for {} '{}'",
            kind, step.name
        )));
    }

    Ok(step)
}

fn parse_stage(node: &KdlNode) -> ConfigResult<StageConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let mut steps = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "step" {
                steps.push(parse_step(child, "step")?);
            }
        }
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "steps for stage '{}'",
            name
        )));
    }

    Ok(StageConfig {
        needs: get_string_list_prop(node, "needs"),
        name,
        steps,
    })
}

fn check_name(kind: &str, name: &str) -> ConfigResult<()> {
    if name == INIT_NAME {
        return Err(ConfigError::invalid(
            format!("{} name", kind),
            format!("'{}' is reserved", INIT_NAME),
        ));
    }
    if name.len() > MAX_NAME_LEN || !NAME_REGEX.is_match(name) {
        return Err(ConfigError::invalid(
            format!("{} name", kind),
            format!("'{}' must be a lowercase DNS label", name),
        ));
    }
    Ok(())
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        check_name(kind, name)?;
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{} '{}'", kind, name)));
        }
    }
    Ok(())
}

fn validate(pipeline: &Pipeline) -> ConfigResult<()> {
    if !pipeline.steps.is_empty() && !pipeline.stages.is_empty() {
        return Err(ConfigError::invalid(
            "pipeline",
            "steps and stages cannot be mixed",
        ));
    }

    check_unique("service", pipeline.services.iter().map(|s| s.name.as_str()))?;
    check_unique("step", pipeline.steps.iter().map(|s| s.name.as_str()))?;
    check_unique("stage", pipeline.stages.iter().map(|s| s.name.as_str()))?;
    for stage in &pipeline.stages {
        check_unique("step", stage.steps.iter().map(|s| s.name.as_str()))?;
    }

    // Validate DAG - check for missing dependencies
    let stage_names: HashSet<&str> = pipeline.stages.iter().map(|s| s.name.as_str()).collect();
    for stage in &pipeline.stages {
        for dep in &stage.needs {
            if !stage_names.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                )));
            }
        }
    }

    detect_cycle(&pipeline.stages).map_err(ConfigError::CycleDetected)
}

/// Detect cycles in the stage dependency graph using DFS.
fn detect_cycle(stages: &[StageConfig]) -> Result<(), String> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    let stage_map: HashMap<&str, &StageConfig> =
        stages.iter().map(|s| (s.name.as_str(), s)).collect();

    for stage in stages {
        if !visited.contains(stage.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&stage.name, &stage_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    stage_map: &HashMap<&'a str, &'a StageConfig>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> Option<String> {
    visited.insert(node);
    rec_stack.insert(node);

    if let Some(&stage) = stage_map.get(node) {
        for dep in &stage.needs {
            let dep: &'a str = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, stage_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.remove(node);
    None
}

impl Pipeline {
    /// Compile into the build descriptor for `build_id`.
    ///
    /// An init step is injected first, stages follow the stages they need,
    /// steps are numbered from 2 in that order, and container IDs are
    /// derived from the build ID.
    pub fn compile(&self, build_id: &str) -> ConfigResult<Build> {
        if build_id.len() > MAX_NAME_LEN || !NAME_REGEX.is_match(build_id) {
            return Err(ConfigError::invalid(
                "build id",
                format!("'{}' must be a lowercase DNS label", build_id),
            ));
        }

        let mut build = Build {
            id: build_id.to_string(),
            ..Default::default()
        };

        for (index, service) in self.services.iter().enumerate() {
            let id = format!("service-{}-{}", build_id, service.name);
            build
                .services
                .push(container(build_id, id, index + 1, service)?);
        }

        let mut number = 1;

        if self.stages.is_empty() {
            build.steps.push(init_step(
                build_id,
                format!("step-{}-{}", build_id, INIT_NAME),
            ));
            for step in &self.steps {
                number += 1;
                let id = format!("step-{}-{}", build_id, step.name);
                build.steps.push(container(build_id, id, number, step)?);
            }
            return Ok(build);
        }

        build.stages.push(Stage {
            name: INIT_NAME.to_string(),
            needs: Vec::new(),
            steps: vec![init_step(
                build_id,
                format!("{}-{}-{}", build_id, INIT_NAME, INIT_NAME),
            )],
        });
        for stage in execution_order(&self.stages)? {
            let mut steps = Vec::with_capacity(stage.steps.len());
            for step in &stage.steps {
                number += 1;
                let id = format!("{}-{}-{}", build_id, stage.name, step.name);
                steps.push(container(build_id, id, number, step)?);
            }
            build.stages.push(Stage {
                name: stage.name.clone(),
                needs: stage.needs.clone(),
                steps,
            });
        }

        Ok(build)
    }
}

/// Stages ordered so each runs after every stage it needs, keeping file
/// order wherever the dependencies allow.
fn execution_order(stages: &[StageConfig]) -> ConfigResult<Vec<&StageConfig>> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(stages.len());

    while ordered.len() < stages.len() {
        let next = stages.iter().find(|stage| {
            !placed.contains(stage.name.as_str())
                && stage.needs.iter().all(|dep| placed.contains(dep.as_str()))
        });
        let Some(stage) = next else {
            let blocked: Vec<&str> = stages
                .iter()
                .map(|stage| stage.name.as_str())
                .filter(|name| !placed.contains(name))
                .collect();
            return Err(ConfigError::CycleDetected(blocked.join(", ")));
        };
        placed.insert(stage.name.as_str());
        ordered.push(stage);
    }

    Ok(ordered)
}

fn default_environment(build_id: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("CI".to_string(), "true".to_string()),
        ("SHIPYARD_BUILD_ID".to_string(), build_id.to_string()),
        ("SHIPYARD_STEP_NAME".to_string(), name.to_string()),
    ])
}

fn init_step(build_id: &str, id: String) -> Container {
    Container {
        id,
        name: INIT_NAME.to_string(),
        number: 1,
        image: INIT_IMAGE.to_string(),
        directory: WORKSPACE_MOUNT.to_string(),
        environment: default_environment(build_id, INIT_NAME),
        ..Default::default()
    }
}

fn container(
    build_id: &str,
    id: String,
    number: usize,
    step: &StepConfig,
) -> ConfigResult<Container> {
    if id.len() > MAX_NAME_LEN {
        return Err(ConfigError::invalid(
            format!("container id for '{}'", step.name),
            format!("'{}' is longer than {} characters", id, MAX_NAME_LEN),
        ));
    }

    let mut environment = default_environment(build_id, &step.name);
    environment.extend(step.environment.clone());

    let mut entrypoint = step.entrypoint.clone();
    let mut commands = Vec::new();
    if !step.commands.is_empty() {
        if entrypoint.is_empty() {
            entrypoint = DEFAULT_ENTRYPOINT.iter().map(|s| s.to_string()).collect();
        }
        commands.push(step.commands.join(" && "));
    }

    Ok(Container {
        id,
        name: step.name.clone(),
        number,
        image: step.image.clone(),
        pull: step.pull,
        commands,
        entrypoint,
        environment,
        directory: step
            .directory
            .clone()
            .unwrap_or_else(|| WORKSPACE_MOUNT.to_string()),
        detach: step.detach,
        exit_code: None,
    })
}
