//! Core types and error definitions for the Keel orchestration platform.
//!
//! This crate provides the foundational types shared across all Keel crates:
//! the unified error type, the closed set of worker roles, the tool-call
//! request/response pair exchanged between workers and the tool executor, and
//! the machine-matchable reason codes carried by every terminal failure.
//!
//! # Main types
//!
//! - [`KeelError`] — Unified error enum for all Keel subsystems.
//! - [`KeelResult`] — Convenience alias for `Result<T, KeelError>`.
//! - [`Role`] — Worker role (coder, tester, critic, researcher, architect, admin).
//! - [`ToolKind`] — The fixed set of side-effecting tools.
//! - [`ToolCall`] — A single tool invocation requested on behalf of a task.
//! - [`ToolResult`] — The outcome of executing (or refusing) a [`ToolCall`].
//! - [`Reason`] / [`ReasonCode`] — Human-readable message plus matchable code.

/// Unified error type.
pub mod error;
/// Reason codes attached to failures and denials.
pub mod reason;
/// Worker roles.
pub mod role;
/// Tool call and tool result types.
pub mod tool;

pub use error::{KeelError, KeelResult};
pub use reason::{Reason, ReasonCode};
pub use role::{InvalidRole, Role};
pub use tool::{ToolCall, ToolKind, ToolOutcome, ToolResult};
