//! KDL configuration parsing for Shipyard.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (shipyard.kdl) and their compilation into builds
//! - Runtime setup (driver selection and backend connection)

pub mod error;
mod nodes;
pub mod pipeline;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{Pipeline, load_pipeline, parse_pipeline};
pub use system::{load_runtime_setup, parse_runtime_setup};
