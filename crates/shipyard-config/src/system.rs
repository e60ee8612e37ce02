//! Runtime setup parsing.
//!
//! ```kdl
//! runtime {
//!     driver "kubernetes"
//!     config "/etc/shipyard/kubeconfig"
//!     namespace "ci"
//!     volume "/cache:/cache"
//!     privileged "plugins/docker"
//! }
//! ```

use crate::nodes::*;
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use shipyard_core::RuntimeSetup;
use std::path::{Path, PathBuf};

/// Read and parse a runtime setup file.
pub fn load_runtime_setup(path: impl AsRef<Path>) -> ConfigResult<RuntimeSetup> {
    let text = std::fs::read_to_string(path)?;
    parse_runtime_setup(&text)
}

/// Parse the `runtime` block from KDL text.
///
/// Fields left out keep their defaults; `volume` and `privileged` may repeat.
pub fn parse_runtime_setup(kdl: &str) -> ConfigResult<RuntimeSetup> {
    let doc: KdlDocument = kdl.parse()?;
    let runtime = doc
        .get("runtime")
        .ok_or_else(|| ConfigError::MissingField("runtime block".to_string()))?;

    let mut setup = RuntimeSetup::default();

    if let Some(children) = runtime.children() {
        for child in children.nodes() {
            match child.name().value() {
                "driver" => {
                    let driver = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("runtime driver".to_string()))?;
                    setup.driver = driver
                        .parse()
                        .map_err(|e| ConfigError::invalid("runtime driver", format!("{}", e)))?;
                }
                "config" => setup.config = get_first_string_arg(child).map(PathBuf::from),
                "namespace" => setup.namespace = get_first_string_arg(child),
                "volume" => setup.volumes.extend(get_all_string_args(child)),
                "privileged" => setup.privileged_images.extend(get_all_string_args(child)),
                _ => {}
            }
        }
    }

    setup
        .validate()
        .map_err(|e| ConfigError::invalid("runtime", format!("{}", e)))?;

    Ok(setup)
}
