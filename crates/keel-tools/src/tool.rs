use async_trait::async_trait;
use keel_core::{KeelResult, ToolCall, ToolKind};
use keel_security::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metadata describing a tool and the operations it understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Which tool this is.
    pub kind: ToolKind,
    /// One-line summary.
    pub description: String,
    /// Operation names. Empty means any operation is forwarded (git).
    pub operations: Vec<String>,
}

impl ToolDescriptor {
    /// Describe a tool understanding `operations`.
    pub fn new(kind: ToolKind, description: impl Into<String>, operations: &[&str]) -> Self {
        Self {
            kind,
            description: description.into(),
            operations: operations.iter().map(|o| (*o).to_string()).collect(),
        }
    }

    /// Whether `operation` is one this tool handles.
    pub fn supports(&self, operation: &str) -> bool {
        self.operations.is_empty() || self.operations.iter().any(|o| o == operation)
    }
}

/// Effective ceilings for one call, derived from the caller's role policy.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    /// Wall-clock limit.
    pub timeout: Duration,
    /// CPU quota, where the tool can enforce one.
    pub cpus: f64,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
}

impl ExecLimits {
    /// Ceilings for a call under `limits`, with the requested timeout clamped.
    pub fn for_call(limits: &ResourceLimits, requested_ms: Option<u64>) -> Self {
        Self {
            timeout: Duration::from_millis(limits.clamp_timeout(requested_ms)),
            cpus: limits.cpus,
            memory_mb: limits.memory_mb,
        }
    }
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self::for_call(&ResourceLimits::default(), None)
    }
}

/// Trait implemented by every side-effecting tool.
///
/// Implementations assume the call already passed the policy check. Return
/// `Ok` with a failed [`keel_core::ToolResult`] for application failures
/// (non-zero exit, HTTP error status) and `Err` for infrastructure failures
/// (spawn failure, runtime unavailable).
///
/// The executor enforces the timeout by dropping the future, so spawned
/// processes must be created with `kill_on_drop(true)`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(
        &self,
        call: &ToolCall,
        limits: &ExecLimits,
    ) -> KeelResult<keel_core::ToolResult>;
}

/// Truncate `s` to at most `max_len` bytes on a char boundary.
pub fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
