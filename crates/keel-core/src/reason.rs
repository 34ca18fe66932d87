use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-matchable code attached to every denial and terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Graph errors, reported synchronously at submission.
    /// The submission would close a dependency cycle.
    Cycle,
    /// A declared dependency does not exist.
    UnknownDependency,
    /// The role tag is not one of the known roles.
    InvalidRole,
    /// A caller-chosen id is already taken.
    DuplicateId,

    // Policy denials.
    /// The tool is not granted to the role.
    ToolNotPermitted,
    /// The operation does not match any allowed subcommand pattern.
    OperationNotPermitted,
    /// The network destination is not on the allowlist.
    ForbiddenDestination,
    /// The call matched a denied pattern.
    DangerousPattern,

    // Execution errors.
    /// Infrastructure failure; resubmission may succeed.
    Transient,
    /// Application failure; resubmission will not help.
    Permanent,
    /// The call exceeded its timeout budget. Side effects are unknown.
    TimeoutExceeded,

    // Lifecycle.
    /// A dependency failed, so this task can never run.
    DependencyFailed,
    /// The worker executing the task crashed.
    WorkerCrashed,
    /// The task was cancelled.
    Cancelled,
    /// Another improvement holds the target module.
    ModuleBusy,
    /// Candidate or deployed code performed worse than the baseline.
    Regression,
}

impl ReasonCode {
    /// The snake_case wire name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Cycle => "cycle",
            ReasonCode::UnknownDependency => "unknown_dependency",
            ReasonCode::InvalidRole => "invalid_role",
            ReasonCode::DuplicateId => "duplicate_id",
            ReasonCode::ToolNotPermitted => "tool_not_permitted",
            ReasonCode::OperationNotPermitted => "operation_not_permitted",
            ReasonCode::ForbiddenDestination => "forbidden_destination",
            ReasonCode::DangerousPattern => "dangerous_pattern",
            ReasonCode::Transient => "transient",
            ReasonCode::Permanent => "permanent",
            ReasonCode::TimeoutExceeded => "timeout_exceeded",
            ReasonCode::DependencyFailed => "dependency_failed",
            ReasonCode::WorkerCrashed => "worker_crashed",
            ReasonCode::Cancelled => "cancelled",
            ReasonCode::ModuleBusy => "module_busy",
            ReasonCode::Regression => "regression",
        }
    }

    /// Whether this code came from the policy engine.
    pub fn is_policy_denial(self) -> bool {
        matches!(
            self,
            ReasonCode::ToolNotPermitted
                | ReasonCode::OperationNotPermitted
                | ReasonCode::ForbiddenDestination
                | ReasonCode::DangerousPattern
        )
    }

    /// Whether a caller may reasonably resubmit the work.
    pub fn is_retryable(self) -> bool {
        matches!(self, ReasonCode::Transient | ReasonCode::WorkerCrashed)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A human-readable message paired with a [`ReasonCode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Machine-readable classification.
    pub code: ReasonCode,
    /// Human-readable detail.
    pub message: String,
}

impl Reason {
    /// A reason with an explicit code.
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::Transient, message)
    }

    /// A failure that retrying will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::Permanent, message)
    }

    /// A deadline was exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::TimeoutExceeded, message)
    }

    /// The work was cancelled.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ReasonCode::Cancelled, message)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_code_serializes_as_snake_case() {
        let json = serde_json::to_string(&ReasonCode::OperationNotPermitted).unwrap();
        assert_eq!(json, "\"operation_not_permitted\"");
        assert_eq!(ReasonCode::OperationNotPermitted.as_str(), "operation_not_permitted");
    }

    #[test]
    fn test_policy_denial_classification() {
        assert!(ReasonCode::DangerousPattern.is_policy_denial());
        assert!(!ReasonCode::TimeoutExceeded.is_policy_denial());
    }

    #[test]
    fn test_only_infrastructure_failures_are_retryable() {
        assert!(ReasonCode::Transient.is_retryable());
        assert!(!ReasonCode::Permanent.is_retryable());
        assert!(!ReasonCode::TimeoutExceeded.is_retryable());
    }

    #[test]
    fn test_reason_display() {
        let reason = Reason::timeout("shell exec exceeded 1000ms");
        assert_eq!(reason.to_string(), "timeout_exceeded: shell exec exceeded 1000ms");
    }
}
