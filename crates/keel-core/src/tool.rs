use crate::{Reason, Role};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of side-effecting tools a worker may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Fs,
    Shell,
    Git,
    Container,
    Http,
    Script,
}

impl ToolKind {
    /// Every tool, in declaration order.
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Fs,
        ToolKind::Shell,
        ToolKind::Git,
        ToolKind::Container,
        ToolKind::Http,
        ToolKind::Script,
    ];

    /// The lowercase tool name.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Fs => "fs",
            ToolKind::Shell => "shell",
            ToolKind::Git => "git",
            ToolKind::Container => "container",
            ToolKind::Http => "http",
            ToolKind::Script => "script",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolKind::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tool '{s}'"))
    }
}

/// A request to invoke one tool on behalf of a task.
///
/// Built by a worker for the lifetime of a single invocation and never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Which tool to invoke.
    pub tool: ToolKind,
    /// Tool-specific operation, such as `read` or `exec`.
    pub operation: String,
    /// Operation arguments as a JSON object.
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Role the call is made on behalf of.
    pub role: Role,
    /// Requested timeout. Clamped to the role's policy ceiling, never extended.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ToolCall {
    /// A call with no timeout request.
    pub fn new(
        role: Role,
        tool: ToolKind,
        operation: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            tool,
            operation: operation.into(),
            arguments,
            role,
            timeout_ms: None,
        }
    }

    /// Request a timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// A string argument, or `""` when absent.
    pub fn str_arg(&self, key: &str) -> &str {
        self.arguments[key].as_str().unwrap_or_default()
    }

    /// The call flattened to `"<tool> <operation> <string arguments...>"`.
    ///
    /// Arrays keep their order; object members follow key order. This is the
    /// text that denied patterns are matched against.
    pub fn literal(&self) -> String {
        let mut parts = vec![self.tool.as_str().to_string(), self.operation.clone()];
        collect_strings(&self.arguments, &mut parts);
        parts.join(" ")
    }
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Bool(b) => out.push(b.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Null => {}
    }
}

/// Whether a tool call succeeded, and if not, why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The call succeeded.
    Ok,
    /// The call was denied or failed.
    Error { reason: Reason },
}

/// The result returned after executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Success, or the failure reason.
    pub outcome: ToolOutcome,
    /// Captured stdout, response body, or file contents.
    pub output: String,
    /// Process exit code, for tools that run one.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Wall-clock time of the call.
    pub duration_ms: u64,
}

impl ToolResult {
    /// A successful result carrying `output`.
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome::Ok,
            output: output.into(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// A failed result. `output` keeps whatever was captured.
    pub fn failure(reason: Reason, output: impl Into<String>) -> Self {
        Self {
            outcome: ToolOutcome::Error { reason },
            output: output.into(),
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Attach a process exit code.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Record the elapsed time.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Whether the call failed.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error { .. })
    }

    /// The failure reason, if any.
    pub fn reason(&self) -> Option<&Reason> {
        match &self.outcome {
            ToolOutcome::Ok => None,
            ToolOutcome::Error { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ReasonCode;

    #[test]
    fn test_tool_result_success() {
        let result = ToolResult::success("output").with_exit_code(0);
        assert!(!result.is_error());
        assert_eq!(result.output, "output");
        assert!(result.reason().is_none());
    }

    #[test]
    fn test_tool_result_failure_carries_reason() {
        let result = ToolResult::failure(Reason::permanent("exit 1"), "");
        assert!(result.is_error());
        assert_eq!(result.reason().unwrap().code, ReasonCode::Permanent);
    }

    #[test]
    fn test_literal_flattens_arguments() {
        let call = ToolCall::new(
            Role::Coder,
            ToolKind::Git,
            "push",
            serde_json::json!({"args": ["--force", "origin", "main"]}),
        );
        assert_eq!(call.literal(), "git push --force origin main");
    }

    #[test]
    fn test_literal_without_arguments() {
        let call = ToolCall::new(Role::Critic, ToolKind::Git, "status", serde_json::Value::Null);
        assert_eq!(call.literal(), "git status");
    }

    #[test]
    fn test_tool_kind_parse() {
        assert_eq!("HTTP".parse::<ToolKind>().unwrap(), ToolKind::Http);
        assert!("ftp".parse::<ToolKind>().is_err());
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let result = ToolResult::failure(Reason::timeout("slow"), "");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["status"], "error");
        assert_eq!(json["outcome"]["reason"]["code"], "timeout_exceeded");
    }
}
