//! # Scanloop Core
//!
//! Shared foundation for the Scanloop workspace: configuration loading,
//! the error taxonomy, and the automation-task domain model with its
//! state machines.

pub mod config;
pub mod error;
pub mod model;

pub use config::ScanloopConfig;
pub use error::{Result, ScanloopError};
