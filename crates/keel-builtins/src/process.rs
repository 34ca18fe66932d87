use keel_core::{KeelError, KeelResult, Reason, ToolResult};
use keel_tools::truncate_output;
use std::process::Stdio;
use tokio::process::Command;

/// Stdout kept in a result.
pub const MAX_STDOUT: usize = 50_000;
/// Stderr kept in a failure message.
pub const MAX_STDERR: usize = 10_000;

/// Run a prepared command to completion and map its exit status.
///
/// Spawn failures are infrastructure errors (`Err`); a non-zero exit is an
/// application failure carried in the result. The child is killed if the
/// returned future is dropped.
pub(crate) async fn run_to_result(mut cmd: Command, program: &str) -> KeelResult<ToolResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .map_err(|e| KeelError::Tool(format!("failed to spawn {program}: {e}")))?;

    let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), MAX_STDOUT);
    let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr), MAX_STDERR);
    let exit_code = output.status.code().unwrap_or(-1);

    if output.status.success() {
        Ok(ToolResult::success(stdout).with_exit_code(exit_code))
    } else {
        let message = if stderr.trim().is_empty() {
            format!("{program} exited with status {exit_code}")
        } else {
            format!("{program} exited with status {exit_code}: {}", stderr.trim_end())
        };
        Ok(ToolResult::failure(Reason::permanent(message), stdout).with_exit_code(exit_code))
    }
}
