//! Runtime setup: which driver to use and how to reach its backend.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// The runtime drivers Shipyard ships with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    #[display("docker")]
    Docker,
    #[display("kubernetes")]
    Kubernetes,
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("docker") {
            Ok(Driver::Docker)
        } else if s.eq_ignore_ascii_case("kubernetes") {
            Ok(Driver::Kubernetes)
        } else {
            Err(Error::InvalidInput(format!("invalid runtime driver: {}", s)))
        }
    }
}

/// Settings needed to construct a runtime engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSetup {
    pub driver: Driver,
    /// Docker daemon address, or kubeconfig path for Kubernetes.
    pub config: Option<PathBuf>,
    /// Target namespace (Kubernetes only).
    pub namespace: Option<String>,
    /// Host volumes (`source:destination[:mode]`) mounted into every container.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Images allowed to run in privileged mode.
    #[serde(default)]
    pub privileged_images: Vec<String>,
}

impl RuntimeSetup {
    /// Check that the settings required by the selected driver are present.
    pub fn validate(&self) -> Result<()> {
        if self.driver == Driver::Kubernetes
            && self.namespace.as_deref().is_none_or(|ns| ns.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "no runtime namespace provided in setup".to_string(),
            ));
        }
        Ok(())
    }
}
