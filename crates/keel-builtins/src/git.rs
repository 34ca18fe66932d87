use crate::process::run_to_result;
use async_trait::async_trait;
use keel_core::{KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{ExecLimits, Tool, ToolDescriptor};
use std::path::PathBuf;
use tracing::info;

/// Version-control tool. The operation is the git subcommand.
///
/// `arguments.args` is passed to git verbatim, one argv entry per element,
/// so no shell is involved.
pub struct GitTool {
    descriptor: ToolDescriptor,
    repo_dir: Option<PathBuf>,
}

impl GitTool {
    /// Create the git tool.
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Git,
                "Run a git subcommand. Operation is the subcommand, `args` its arguments.",
                &[],
            ),
            repo_dir: None,
        }
    }

    /// Default repository directory when the call has no `cwd`.
    pub fn with_repo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = Some(dir.into());
        self
    }
}

impl Default for GitTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Subcommands are plain lowercase words; anything else could smuggle a
/// global option such as `-c core.sshCommand=...`.
fn valid_subcommand(op: &str) -> bool {
    let mut chars = op.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[async_trait]
impl Tool for GitTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, _limits: &ExecLimits) -> KeelResult<ToolResult> {
        if !valid_subcommand(&call.operation) {
            return Ok(ToolResult::failure(
                Reason::permanent(format!("invalid git subcommand '{}'", call.operation)),
                "",
            ));
        }

        let args: Vec<String> = match &call.arguments["args"] {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::Array(items) => {
                let mut args = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => args.push(s.to_string()),
                        None => {
                            return Ok(ToolResult::failure(
                                Reason::permanent("git args must be strings"),
                                "",
                            ))
                        }
                    }
                }
                args
            }
            _ => {
                return Ok(ToolResult::failure(
                    Reason::permanent("git args must be an array"),
                    "",
                ))
            }
        };

        info!(subcommand = %call.operation, args = ?args, "Running git");

        let mut cmd = tokio::process::Command::new("git");
        cmd.arg(&call.operation)
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0");
        match call.arguments["cwd"].as_str() {
            Some(cwd) => {
                cmd.current_dir(cwd);
            }
            None => {
                if let Some(dir) = &self.repo_dir {
                    cmd.current_dir(dir);
                }
            }
        }
        run_to_result(cmd, "git").await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_subcommand() {
        assert!(valid_subcommand("status"));
        assert!(valid_subcommand("rev-parse"));
        assert!(!valid_subcommand("-c"));
        assert!(!valid_subcommand("--exec-path=/tmp"));
        assert!(!valid_subcommand(""));
        assert!(!valid_subcommand("log;rm"));
    }
}
