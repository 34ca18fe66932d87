use async_trait::async_trait;
use keel_core::{KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{ExecLimits, Tool, ToolDescriptor};
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

const MAX_WRITE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_READ_SIZE: u64 = 10 * 1024 * 1024; // 10MB

/// Filesystem tool: read, write, append, list, mkdir, delete, exists.
///
/// Write roots are enforced by the policy check; this tool only validates
/// that it got a path.
pub struct FsTool {
    descriptor: ToolDescriptor,
}

impl FsTool {
    /// Create the filesystem tool.
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Fs,
                "Read and modify files and directories.",
                &["read", "write", "append", "list", "mkdir", "delete", "exists"],
            ),
        }
    }
}

impl Default for FsTool {
    fn default() -> Self {
        Self::new()
    }
}

fn io_failure(action: &str, path: &str, e: &std::io::Error) -> ToolResult {
    ToolResult::failure(Reason::permanent(format!("{action} '{path}': {e}")), "")
}

async fn read(path: &str) -> ToolResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > MAX_READ_SIZE => {
            return ToolResult::failure(
                Reason::permanent(format!(
                    "file too large: {} bytes (max: {MAX_READ_SIZE} bytes)",
                    meta.len()
                )),
                "",
            )
        }
        Ok(meta) if meta.is_dir() => {
            return ToolResult::failure(
                Reason::permanent(format!("'{path}' is a directory")),
                "",
            )
        }
        Ok(_) => {}
        Err(e) => return io_failure("cannot read", path, &e),
    }
    match tokio::fs::read(path).await {
        Ok(bytes) => ToolResult::success(String::from_utf8_lossy(&bytes)),
        Err(e) => io_failure("cannot read", path, &e),
    }
}

async fn write(path: &str, content: &str, append: bool, create_dirs: bool) -> ToolResult {
    if content.len() > MAX_WRITE_SIZE {
        return ToolResult::failure(
            Reason::permanent(format!(
                "content too large: {} bytes (max: {MAX_WRITE_SIZE} bytes)",
                content.len()
            )),
            "",
        );
    }
    if create_dirs {
        if let Some(parent) = Path::new(path).parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return io_failure("cannot create parent of", path, &e);
            }
        }
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await;
    let mut file = match file {
        Ok(f) => f,
        Err(e) => return io_failure("cannot open", path, &e),
    };
    if let Err(e) = file.write_all(content.as_bytes()).await {
        return io_failure("cannot write", path, &e);
    }
    if let Err(e) = file.flush().await {
        return io_failure("cannot flush", path, &e);
    }
    ToolResult::success(format!("{} bytes written", content.len()))
}

async fn list(path: &str) -> ToolResult {
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) => return io_failure("cannot list", path, &e),
    };
    let mut names = Vec::new();
    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                    name.push('/');
                }
                names.push(name);
            }
            Ok(None) => break,
            Err(e) => return io_failure("cannot list", path, &e),
        }
    }
    names.sort();
    ToolResult::success(serde_json::Value::from(names).to_string())
}

async fn delete(path: &str, recursive: bool) -> ToolResult {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) => return io_failure("cannot delete", path, &e),
    };
    let outcome = if meta.is_dir() {
        if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        }
    } else {
        tokio::fs::remove_file(path).await
    };
    match outcome {
        Ok(()) => ToolResult::success(format!("deleted '{path}'")),
        Err(e) => io_failure("cannot delete", path, &e),
    }
}

#[async_trait]
impl Tool for FsTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, _limits: &ExecLimits) -> KeelResult<ToolResult> {
        let path = call.str_arg("path");
        if path.is_empty() {
            return Ok(ToolResult::failure(Reason::permanent("empty path"), ""));
        }
        let flag = |key: &str, default: bool| call.arguments[key].as_bool().unwrap_or(default);

        info!(operation = %call.operation, path = %path, "Filesystem call");

        let result = match call.operation.as_str() {
            "read" => read(path).await,
            "write" => write(path, call.str_arg("content"), false, flag("create_dirs", true)).await,
            "append" => write(path, call.str_arg("content"), true, flag("create_dirs", true)).await,
            "list" => list(path).await,
            "mkdir" => match tokio::fs::create_dir_all(path).await {
                Ok(()) => ToolResult::success(format!("created '{path}'")),
                Err(e) => io_failure("cannot create", path, &e),
            },
            "delete" => delete(path, flag("recursive", false)).await,
            "exists" => match tokio::fs::try_exists(path).await {
                Ok(found) => ToolResult::success(found.to_string()),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    io_failure("cannot inspect", path, &e)
                }
                Err(_) => ToolResult::success("false"),
            },
            other => ToolResult::failure(
                Reason::permanent(format!("unknown fs operation '{other}'")),
                "",
            ),
        };
        Ok(result)
    }
}
