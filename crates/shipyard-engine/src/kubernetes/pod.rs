//! Pod specification helpers.
//!
//! The driver declares one placeholder container per step up front and later
//! patches each slot's image to start the real work. A step's slot is its
//! number minus two: number 1 is the init step, which has no container.

use k8s_openapi::api::core::v1::{
    Container as KubeContainer, EnvVar, Pod, SecurityContext, VolumeMount,
};
use serde_json::{Value, json};
use shipyard_core::image::normalize_image;
use shipyard_core::{Container, Error, PullPolicy, Result};

/// Inert image every slot runs until its step is started.
pub(super) const PAUSE_IMAGE: &str = "kubernetes/pause:latest";

/// Zero-based position of a step in the pod's container list.
pub(super) fn container_slot(ctn: &Container) -> Result<usize> {
    ctn.number.checked_sub(2).ok_or_else(|| {
        Error::PreconditionViolated(format!(
            "container {} has number {}, steps start at 2",
            ctn.id, ctn.number
        ))
    })
}

/// Kubernetes pull policy for a step's real image.
pub(super) fn image_pull_policy(pull: PullPolicy) -> &'static str {
    match pull {
        PullPolicy::Always | PullPolicy::OnStart => "Always",
        PullPolicy::Never => "Never",
        PullPolicy::NotPresent => "IfNotPresent",
    }
}

/// Placeholder container for a step: final environment, directory and
/// arguments, with the pause image standing in for the real one.
///
/// `command` stays unset so the pause image keeps its own entrypoint; the
/// step's entrypoint and commands travel as `args` and reach the real image
/// once it is patched in.
pub(super) fn placeholder(ctn: &Container, privileged: bool) -> Result<KubeContainer> {
    let env = ctn
        .environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();
    let args = ctn
        .entrypoint
        .iter()
        .chain(ctn.commands.iter())
        .cloned()
        .collect::<Vec<_>>();

    Ok(KubeContainer {
        name: ctn.id.clone(),
        image: Some(normalize_image(PAUSE_IMAGE)?),
        image_pull_policy: Some("Always".to_string()),
        env: (!env.is_empty()).then_some(env),
        working_dir: (!ctn.directory.is_empty()).then(|| ctn.directory.clone()),
        args: (!args.is_empty()).then_some(args),
        stdin: Some(false),
        stdin_once: Some(false),
        tty: Some(false),
        security_context: privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Strategic merge patch replacing one container's image.
pub(super) fn image_patch(name: &str, image: &str) -> Value {
    json!({
        "spec": {
            "containers": [
                { "name": name, "image": image }
            ]
        }
    })
}

/// Mount the build volumes into every declared container.
pub(super) fn attach_mounts(pod: &mut Pod, mounts: &[VolumeMount]) {
    if mounts.is_empty() {
        return;
    }
    if let Some(spec) = pod.spec.as_mut() {
        for container in spec.containers.iter_mut() {
            container.volume_mounts = Some(mounts.to_vec());
        }
    }
}

/// Whether `name` has settled in a terminated state.
///
/// Pending pods are ignored entirely, and a terminated state only counts
/// once the kubelet has recorded a reason for it.
pub(super) fn container_completed(pod: &Pod, name: &str) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Pending") {
        return false;
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .find(|cst| cst.name.eq_ignore_ascii_case(name))
        .and_then(|cst| cst.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .is_some_and(|terminated| terminated.reason.as_deref().is_some_and(|r| !r.is_empty()))
}

/// Exit code of `name`, if it has terminated.
pub(super) fn exit_code(pod: &Pod, name: &str) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .iter()
        .flatten()
        .find(|cst| cst.name.eq_ignore_ascii_case(name))?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|terminated| terminated.exit_code)
}
