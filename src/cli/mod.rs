//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running a training job
//! - Validating a run configuration
//! - Inspecting checkpoint directories

pub mod commands;
pub mod handlers;

pub use handlers::{handle_checkpoints, handle_train, handle_validate, init_logging};
