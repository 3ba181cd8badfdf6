//! Core types and error definitions for the foreman orchestration engine.
//!
//! This crate provides the foundational types shared across all foreman
//! crates: the error taxonomy every engine operation reports through, the
//! identifier newtypes for roles, tasks and bugs, and the structured
//! request/response envelope used to expose operations by name.
//!
//! # Main types
//!
//! - [`ForemanError`]: Unified error enum for all foreman subsystems.
//! - [`ErrorKind`]: Closed, serializable classification of an error.
//! - [`ForemanResult`]: Convenience alias for `Result<T, ForemanError>`.
//! - [`Role`]: Name of a manager or builder process.
//! - [`TaskId`] / [`BugId`]: Opaque entity identifiers.
//! - [`ToolCall`] / [`ToolResult`]: Named-operation request and response.

/// Error taxonomy.
pub mod error;
/// Identifier newtypes.
pub mod ids;
/// Named-operation envelope.
pub mod tool;

pub use error::{ErrorKind, ErrorPayload, ForemanError, ForemanResult};
pub use ids::{BugId, Role, TaskId};
pub use tool::{ToolCall, ToolResult};
