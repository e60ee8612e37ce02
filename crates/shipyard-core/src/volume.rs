//! Host volume specifications (`source:destination[:mode]`).

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Mount point of the shared build volume inside every container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Access mode of a mounted host volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AccessMode {
    #[display("ro")]
    ReadOnly,
    #[default]
    #[display("rw")]
    ReadWrite,
}

/// A parsed host volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Path on the host.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    pub access_mode: AccessMode,
}

impl VolumeSpec {
    pub fn read_only(&self) -> bool {
        self.access_mode == AccessMode::ReadOnly
    }
}

/// Parse a host volume specification.
///
/// Accepted forms are `path` (mounted at the same path), `source:destination`
/// and `source:destination:mode` where mode is `ro` or `rw`. The mode
/// defaults to `rw`.
pub fn parse_volume(spec: &str) -> Result<VolumeSpec> {
    let parts: Vec<&str> = spec.split(':').collect();

    if parts.iter().any(|part| part.is_empty()) {
        return Err(Error::InvalidVolume(format!(
            "{}: empty path or mode component",
            spec
        )));
    }

    let (source, destination, access_mode) = match parts.as_slice() {
        [path] => (*path, *path, AccessMode::default()),
        [source, destination] => (*source, *destination, AccessMode::default()),
        [source, destination, mode] => {
            let mode = match *mode {
                "ro" => AccessMode::ReadOnly,
                "rw" => AccessMode::ReadWrite,
                other => {
                    return Err(Error::InvalidVolume(format!(
                        "{}: unknown access mode {}",
                        spec, other
                    )));
                }
            };
            (*source, *destination, mode)
        }
        _ => {
            return Err(Error::InvalidVolume(format!(
                "{}: expected at most two `:` separators",
                spec
            )));
        }
    };

    Ok(VolumeSpec {
        source: source.to_string(),
        destination: destination.to_string(),
        access_mode,
    })
}
