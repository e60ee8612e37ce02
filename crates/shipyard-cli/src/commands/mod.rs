//! CLI command implementations.

pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use clap::Args;
use shipyard_config::load_runtime_setup;
use shipyard_core::{Driver, RuntimeSetup};
use std::path::PathBuf;

/// Runtime selection flags shared by every command.
#[derive(Args, Debug, Default)]
pub struct RuntimeArgs {
    /// Runtime setup file containing a `runtime` block
    #[arg(long, global = true)]
    setup: Option<PathBuf>,

    /// Runtime driver (docker or kubernetes)
    #[arg(long = "runtime-driver", env = "SHIPYARD_RUNTIME_DRIVER", global = true)]
    driver: Option<String>,

    /// Docker daemon address or kubeconfig path
    #[arg(long = "runtime-config", env = "SHIPYARD_RUNTIME_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Kubernetes namespace for build pods
    #[arg(
        long = "runtime-namespace",
        env = "SHIPYARD_RUNTIME_NAMESPACE",
        global = true
    )]
    namespace: Option<String>,

    /// Host volumes mounted into every container
    #[arg(
        long = "runtime-volumes",
        env = "SHIPYARD_RUNTIME_VOLUMES",
        value_delimiter = ',',
        global = true
    )]
    volumes: Vec<String>,

    /// Images allowed to run privileged
    #[arg(
        long = "runtime-privileged-images",
        env = "SHIPYARD_RUNTIME_PRIVILEGED_IMAGES",
        value_delimiter = ',',
        global = true
    )]
    privileged_images: Vec<String>,
}

impl RuntimeArgs {
    /// Merge the setup file (if any) with explicit flags; flags win.
    pub fn resolve(&self) -> Result<RuntimeSetup> {
        let mut setup = match &self.setup {
            Some(path) => load_runtime_setup(path).with_context(|| {
                format!("Failed to load runtime setup: {}", path.display())
            })?,
            None => RuntimeSetup::default(),
        };

        if let Some(driver) = &self.driver {
            setup.driver = driver.parse::<Driver>()?;
        }
        if let Some(config) = &self.config {
            setup.config = Some(config.clone());
        }
        if let Some(namespace) = &self.namespace {
            setup.namespace = Some(namespace.clone());
        }
        if !self.volumes.is_empty() {
            setup.volumes = self.volumes.clone();
        }
        if !self.privileged_images.is_empty() {
            setup.privileged_images = self.privileged_images.clone();
        }

        setup.validate()?;
        Ok(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_to_docker() {
        let setup = RuntimeArgs::default().resolve().unwrap();
        assert_eq!(setup, RuntimeSetup::default());
    }

    #[test]
    fn test_flags_override_setup_file() {
        let path = std::env::temp_dir().join(format!("shipyard-setup-{}.kdl", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "runtime {{\n    driver \"kubernetes\"\n    namespace \"ci\"\n    volume \"/cache:/cache\"\n}}"
        )
        .unwrap();

        let args = RuntimeArgs {
            setup: Some(path.clone()),
            namespace: Some("builds".to_string()),
            ..Default::default()
        };
        let setup = args.resolve().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(setup.driver, Driver::Kubernetes);
        assert_eq!(setup.namespace.as_deref(), Some("builds"));
        assert_eq!(setup.volumes, vec!["/cache:/cache"]);
    }

    #[test]
    fn test_kubernetes_flag_without_namespace_is_rejected() {
        let args = RuntimeArgs {
            driver: Some("kubernetes".to_string()),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let args = RuntimeArgs {
            driver: Some("podman".to_string()),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }
}
