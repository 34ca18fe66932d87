//! The [`Tool`] trait and the [`ToolExecutor`] that gates every call through
//! the role policy before executing it under the role's resource limits.

/// Policy-gated dispatch of tool calls.
pub mod executor;
/// The tool trait and its descriptor.
pub mod tool;

pub use executor::ToolExecutor;
pub use tool::{truncate_output, ExecLimits, Tool, ToolDescriptor};
