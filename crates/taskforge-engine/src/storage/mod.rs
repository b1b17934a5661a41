//! `SQLite` task store.
//!
//! Tasks are read and written whole by id; the orchestrator is the only
//! writer of workflow fields.

mod db;
mod models;
mod queries;

pub use db::{DatabaseError, TaskDatabase};
pub use models::*;
