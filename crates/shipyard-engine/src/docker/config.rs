//! Request payloads for the Docker driver.

use bollard::container::{Config, NetworkingConfig};
use bollard::models::{EndpointSettings, HostConfig, HostConfigLogConfig, Mount, MountTypeEnum};
use shipyard_core::Container;
use shipyard_core::volume::{WORKSPACE_MOUNT, parse_volume};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Mounts attached to every container of a build: the build volume at the
/// workspace path, followed by one bind mount per host volume.
///
/// Malformed host volumes are logged and skipped.
pub(super) fn build_mounts(build_id: &str, volumes: &[String]) -> Vec<Mount> {
    trace!(volume = %build_id, "Creating mount for default volume");

    let mut mounts = vec![Mount {
        typ: Some(MountTypeEnum::VOLUME),
        source: Some(build_id.to_string()),
        target: Some(WORKSPACE_MOUNT.to_string()),
        ..Default::default()
    }];

    for volume in volumes {
        match parse_volume(volume) {
            Ok(spec) => {
                trace!(volume = %volume, "Creating mount for host volume");
                mounts.push(Mount {
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(spec.read_only()),
                    source: Some(spec.source),
                    target: Some(spec.destination),
                    ..Default::default()
                });
            }
            Err(e) => warn!(volume = %volume, error = %e, "Skipping malformed host volume"),
        }
    }

    mounts
}

pub(super) fn host_config(mounts: &[Mount], privileged: bool) -> HostConfig {
    HostConfig {
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: None,
        }),
        privileged: Some(privileged),
        mounts: Some(mounts.to_vec()),
        ..Default::default()
    }
}

/// Container payload: image, working directory, environment, entrypoint and
/// command.
pub(super) fn container_config(ctn: &Container, image: &str) -> Config<String> {
    trace!(container = %ctn.id, "Creating container configuration");

    Config {
        image: Some(image.to_string()),
        working_dir: (!ctn.directory.is_empty()).then(|| ctn.directory.clone()),
        env: (!ctn.environment.is_empty()).then(|| ctn.env_pairs()),
        entrypoint: (!ctn.entrypoint.is_empty()).then(|| ctn.entrypoint.clone()),
        cmd: (!ctn.commands.is_empty()).then(|| ctn.commands.clone()),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        open_stdin: Some(false),
        stdin_once: Some(false),
        ..Default::default()
    }
}

/// Attach a container to the build network under `alias`.
pub(super) fn network_config(build_id: &str, alias: &str) -> NetworkingConfig<String> {
    let endpoint = EndpointSettings {
        aliases: Some(vec![alias.to_string()]),
        ..Default::default()
    };

    NetworkingConfig {
        endpoints_config: HashMap::from([(build_id.to_string(), endpoint)]),
    }
}
