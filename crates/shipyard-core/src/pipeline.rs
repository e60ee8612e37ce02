//! Build, stage and container descriptors.
//!
//! A [`Build`] is produced once per pipeline run and handed to an engine as
//! read-only input. The only field an engine writes is
//! [`Container::exit_code`], and only while inspecting a finished container.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::Error;

/// Image reference used for the injected init step.
pub const INIT_IMAGE: &str = "#init";

/// Name of the injected init step (and of its stage in staged builds).
pub const INIT_NAME: &str = "init";

/// One pipeline execution.
///
/// A build carries either flat `steps` or grouped `stages`, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Unique identifier, also used as the backend resource name.
    pub id: String,
    /// Ordered steps for flat pipelines.
    #[serde(default)]
    pub steps: Vec<Container>,
    /// Ordered stages for staged pipelines.
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Long-running sidecar containers.
    #[serde(default)]
    pub services: Vec<Container>,
}

impl Build {
    /// Every step in execution order, flattening stages.
    pub fn all_steps(&self) -> impl Iterator<Item = &Container> {
        self.steps
            .iter()
            .chain(self.stages.iter().flat_map(|stage| stage.steps.iter()))
    }
}

/// A named group of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Stages that must finish before this one.
    #[serde(default)]
    pub needs: Vec<String>,
    pub steps: Vec<Container>,
}

/// A step, service or stage-step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Resource name, unique within the build.
    pub id: String,
    /// Human readable label.
    pub name: String,
    /// 1-based position; position 1 is always the injected init step.
    pub number: usize,
    /// Image reference as written in the pipeline.
    pub image: String,
    #[serde(default)]
    pub pull: PullPolicy,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub directory: String,
    /// Runs in the background (services and detached steps).
    #[serde(default)]
    pub detach: bool,
    /// Populated by `Engine::inspect_container` after termination.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl Container {
    /// Whether this is the injected init step.
    pub fn is_init(&self) -> bool {
        self.number == 1 && self.image == INIT_IMAGE
    }

    /// Environment rendered as `KEY=VALUE` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// When an image is fetched for a container.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Pull before every run.
    #[display("always")]
    Always,
    /// Never pull; the image must already exist.
    #[display("never")]
    Never,
    /// Pull only if the image is missing.
    #[default]
    #[display("not_present")]
    NotPresent,
    /// Defer the pull until the container is started.
    #[display("on_start")]
    OnStart,
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "never" => Ok(PullPolicy::Never),
            "not_present" | "not-present" | "" => Ok(PullPolicy::NotPresent),
            "on_start" | "on-start" => Ok(PullPolicy::OnStart),
            other => Err(Error::InvalidInput(format!(
                "unknown pull policy: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, number: usize) -> Container {
        Container {
            id: id.to_string(),
            name: id.to_string(),
            number,
            image: "alpine".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_all_steps_flattens_stages_in_order() {
        let build = Build {
            id: "b1".to_string(),
            stages: vec![
                Stage {
                    name: "one".to_string(),
                    needs: vec![],
                    steps: vec![step("a", 2), step("b", 3)],
                },
                Stage {
                    name: "two".to_string(),
                    needs: vec!["one".to_string()],
                    steps: vec![step("c", 4)],
                },
            ],
            ..Default::default()
        };

        let ids: Vec<_> = build.all_steps().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_init_detection() {
        let init = Container {
            id: "step_b1_init".to_string(),
            name: INIT_NAME.to_string(),
            number: 1,
            image: INIT_IMAGE.to_string(),
            ..Default::default()
        };
        assert!(init.is_init());
        assert!(!step("a", 2).is_init());
    }

    #[test]
    fn test_env_pairs_are_sorted() {
        let mut ctn = step("a", 2);
        ctn.environment.insert("ZED".to_string(), "1".to_string());
        ctn.environment.insert("ALPHA".to_string(), "two".to_string());

        assert_eq!(ctn.env_pairs(), vec!["ALPHA=two", "ZED=1"]);
    }

    #[test]
    fn test_pull_policy_parsing() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("NEVER".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert_eq!(
            "not_present".parse::<PullPolicy>().unwrap(),
            PullPolicy::NotPresent
        );
        assert_eq!("on_start".parse::<PullPolicy>().unwrap(), PullPolicy::OnStart);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_pull_policy_display_matches_serde() {
        for policy in [
            PullPolicy::Always,
            PullPolicy::Never,
            PullPolicy::NotPresent,
            PullPolicy::OnStart,
        ] {
            let json = serde_json::to_string(&policy).unwrap();
            assert_eq!(json, format!("\"{}\"", policy));
        }
    }
}
