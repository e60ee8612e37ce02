//! Core domain types and traits for Shipyard.
//!
//! This crate contains:
//! - Build, stage and container descriptors
//! - The `Engine` contract every runtime driver implements
//! - Runtime setup (driver selection and connection settings)
//! - Image reference and host volume helpers

pub mod engine;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod setup;
pub mod volume;

pub use engine::{Engine, LogReader, cancellable, log_pipe};
pub use error::{Error, Result};
pub use pipeline::{Build, Container, PullPolicy, Stage};
pub use setup::{Driver, RuntimeSetup};
