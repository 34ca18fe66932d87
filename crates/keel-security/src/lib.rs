//! Role policies and audit logging for Keel.
//!
//! Every tool call a worker makes passes through [`PolicyEngine::check`]
//! before anything is executed. Denials and results are recorded in the
//! [`AuditLog`].
//!
//! # Main types
//!
//! - [`Policy`] — Per-role allowed tools, operation globs, denied patterns,
//!   network allowlist, write roots and resource limits.
//! - [`PolicyEngine`] — Compiled role -> policy table answering `check`.
//! - [`Decision`] — `Allow` or `Deny(reason)`.
//! - [`AuditLog`] — Append-only JSONL trail persisted to disk.

/// Audit logging module.
pub mod audit;
/// Built-in role policies and baseline denied patterns.
pub mod defaults;
/// Policy definitions and evaluation.
pub mod policy;
/// Paths a tool call would write to.
pub mod writes;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use defaults::{baseline_denied_patterns, default_policies, default_policy};
pub use policy::{host_allowed, Decision, Policy, PolicyEngine, ResourceLimits};
pub use writes::write_targets;
