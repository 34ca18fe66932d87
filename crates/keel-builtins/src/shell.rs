use crate::process::run_to_result;
use async_trait::async_trait;
use keel_core::{KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{ExecLimits, Tool, ToolDescriptor};
use std::path::PathBuf;
use tracing::info;

/// Shell execution tool. Runs `sh -c <command>` in a subprocess.
///
/// Which commands may run is decided by the caller's policy before this is
/// reached; the subprocess is killed when the executor's timeout fires.
pub struct ShellTool {
    descriptor: ToolDescriptor,
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    /// Create the shell tool.
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Shell,
                "Execute a shell command with `sh -c`.",
                &["exec"],
            ),
            working_dir: None,
        }
    }

    /// Run commands from `dir` unless the call names its own `cwd`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, limits: &ExecLimits) -> KeelResult<ToolResult> {
        let command = call.str_arg("command");
        if command.trim().is_empty() {
            return Ok(ToolResult::failure(Reason::permanent("empty command"), ""));
        }
        if command.contains('\0') {
            return Ok(ToolResult::failure(
                Reason::permanent("command contains null bytes"),
                "",
            ));
        }

        info!(command = %command, timeout_ms = limits.timeout.as_millis(), "Executing shell command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        match call.arguments["cwd"].as_str() {
            Some(cwd) => {
                cmd.current_dir(cwd);
            }
            None => {
                if let Some(dir) = &self.working_dir {
                    cmd.current_dir(dir);
                }
            }
        }
        run_to_result(cmd, "sh").await
    }
}
