//! TaskForge Core Library
//!
//! Shared, subprocess-free building blocks for the TaskForge engine:
//! - Normalized stream events emitted by every agent adapter
//! - NDJSON parsing for the Claude stream-json protocol
//! - Tool permission profiles (read-only planning)
//! - JSON recovery from noisy agent output
//! - Structural validators for plans and subtask lists
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod json_recovery;
pub mod ndjson;
pub mod permissions;
pub mod tracing_init;
pub mod validation;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventKind, StreamEvent};
pub use json_recovery::{RecoveryError, recover, recover_json};
pub use permissions::{PermissionAction, PermissionEngine, PermissionRule};
pub use validation::ValidationResult;
