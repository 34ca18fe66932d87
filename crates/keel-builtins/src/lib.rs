//! Built-in tools for Keel.
//!
//! One [`keel_tools::Tool`] implementation per tool kind: filesystem, shell,
//! git, sandboxed containers, HTTP and embedded WebAssembly scripts.
//!
//! # Main entry points
//!
//! - [`register_builtins()`] — Register all six tools with an executor.

/// Sandboxed container execution and runtimes.
pub mod container;
/// Filesystem tool.
pub mod fs;
/// Git tool.
pub mod git;
/// HTTP tool.
pub mod http;
mod process;
/// WebAssembly script tool.
pub mod script;
/// Shell command tool.
pub mod shell;

pub use container::{
    ContainerConfig, ContainerRuntime, ContainerSpec, ContainerTool, DockerCliRuntime, ExecResult,
};
pub use fs::FsTool;
pub use git::GitTool;
pub use http::HttpTool;
pub use process::{MAX_STDERR, MAX_STDOUT};
pub use script::ScriptTool;
pub use shell::ShellTool;

#[cfg(feature = "docker")]
pub use container::BollardRuntime;

use keel_core::KeelResult;
use keel_tools::ToolExecutor;
use std::sync::Arc;

/// Register every built-in tool. Containers run through `runtime`.
pub fn register_builtins(
    executor: &mut ToolExecutor,
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerConfig,
) -> KeelResult<()> {
    executor.register(Arc::new(FsTool::new()));
    executor.register(Arc::new(ShellTool::new()));
    executor.register(Arc::new(GitTool::new()));
    executor.register(Arc::new(ContainerTool::new(runtime, container)));
    executor.register(Arc::new(HttpTool::new()?));
    executor.register(Arc::new(ScriptTool::new()?));
    Ok(())
}

/// Register every built-in tool, running containers with the `docker` CLI
/// named in `container.runtime`.
pub fn register_default_builtins(
    executor: &mut ToolExecutor,
    container: ContainerConfig,
) -> KeelResult<()> {
    let runtime = Arc::new(DockerCliRuntime::new(container.runtime.clone()));
    register_builtins(executor, runtime, container)
}
