//! Sandboxed command execution through an external container runtime.
//!
//! Keel owns the policy deciding whether a sandboxed call is permitted and the
//! limits it runs under; isolation itself is delegated to a
//! [`ContainerRuntime`]. [`DockerCliRuntime`] shells out to the `docker`
//! binary and is always available. `BollardRuntime` talks to the daemon API
//! directly and requires the `docker` feature flag.

use crate::process::{MAX_STDERR, MAX_STDOUT};
use async_trait::async_trait;
use keel_core::{KeelError, KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{truncate_output, ExecLimits, Tool, ToolDescriptor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(feature = "docker")]
use {
    bollard::{
        container::{
            Config as BollardConfig, CreateContainerOptions, LogOutput, LogsOptions,
            RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
        },
        Docker,
    },
    futures_util::StreamExt,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// `[container]` section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Runtime binary for [`DockerCliRuntime`] (`docker`, `podman`).
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Image used when a call does not name one.
    #[serde(default = "default_image")]
    pub image: String,

    /// Working directory inside the container.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Host directory mounted at `working_dir`, if any.
    #[serde(default)]
    pub workspace_mount: Option<PathBuf>,

    /// Whether containers get a network. Off unless explicitly enabled.
    #[serde(default)]
    pub network_enabled: bool,
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            working_dir: default_working_dir(),
            workspace_mount: None,
            network_enabled: false,
        }
    }
}

/// Everything a runtime needs to run one sandboxed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image to run.
    pub image: String,
    /// Command line, run with `sh -c`.
    pub command: String,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Host directory mounted at `working_dir`.
    pub workspace_mount: Option<PathBuf>,
    /// Leave networking on; `false` means `--network none`.
    pub network_enabled: bool,
    /// CPU quota.
    pub cpus: f64,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
    /// Wall-clock limit for the whole run.
    pub timeout: Duration,
}

/// Result of executing a command inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Process exit code (0 means success).
    pub exit_code: i64,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Rejects empty commands and commands containing null bytes.
pub fn sanitize_command(cmd: &str) -> KeelResult<&str> {
    if cmd.trim().is_empty() {
        return Err(KeelError::Container("empty command rejected".to_string()));
    }
    if cmd.contains('\0') {
        return Err(KeelError::Container(
            "command contains null bytes".to_string(),
        ));
    }
    Ok(cmd)
}

/// An external sandbox able to run one command under CPU and memory ceilings.
///
/// `Err` means the runtime itself failed (daemon down, image pull failed);
/// a command that ran and exited non-zero is `Ok` with its exit code.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, spec: &ContainerSpec) -> KeelResult<ExecResult>;
}

// ---------------------------------------------------------------------------
// Docker CLI runtime
// ---------------------------------------------------------------------------

/// Runs containers through the `docker` (or compatible) command line.
pub struct DockerCliRuntime {
    binary: String,
}

impl DockerCliRuntime {
    /// Use `binary` (`docker`, `podman`, ...) as the CLI.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The `run` argv for a spec, without the binary.
    pub fn run_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--cpus".to_string(),
            format!("{}", spec.cpus),
            "--memory".to_string(),
            format!("{}m", spec.memory_mb),
            "--pids-limit".to_string(),
            "256".to_string(),
            "--workdir".to_string(),
            spec.working_dir.clone(),
        ];
        if !spec.network_enabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        if let Some(mount) = &spec.workspace_mount {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", mount.display(), spec.working_dir));
        }
        args.push(spec.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.command.clone());
        args
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new(default_runtime())
    }
}

/// Runs a cleanup action when dropped, unless disarmed first.
///
/// A run future is dropped mid-await when the executor's timeout fires or the
/// task is cancelled; the container it started would otherwise outlive it.
struct CleanupOnDrop {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CleanupOnDrop {
    fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn run(&self, spec: &ContainerSpec) -> KeelResult<ExecResult> {
        sanitize_command(&spec.command)?;
        let name = format!("keel-{}", uuid::Uuid::new_v4().simple());
        let args = Self::run_args(&name, spec);
        debug!(binary = %self.binary, args = ?args, "Starting container");

        // Killing the CLI client does not stop the container it started.
        let mut guard = {
            let binary = self.binary.clone();
            CleanupOnDrop::new(move || {
                warn!(container = %name, "Removing abandoned container");
                if let Err(e) = std::process::Command::new(&binary)
                    .args(["rm", "-f", &name])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    warn!(container = %name, error = %e, "Failed to remove container");
                }
            })
        };
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        guard.disarm();
        let output = output
            .map_err(|e| KeelError::Container(format!("failed to spawn {}: {e}", self.binary)))?;

        let exit_code = i64::from(output.status.code().unwrap_or(-1));
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // 125: the runtime failed before the command ran.
        if exit_code == 125 {
            return Err(KeelError::Container(format!(
                "{} could not start the container: {}",
                self.binary,
                stderr.trim()
            )));
        }
        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Bollard runtime (requires `docker` feature)
// ---------------------------------------------------------------------------

/// Runs containers through the Docker daemon API.
#[cfg(feature = "docker")]
pub struct BollardRuntime {
    client: Docker,
}

#[cfg(feature = "docker")]
impl BollardRuntime {
    /// Connect to the local Docker daemon (via the default socket).
    pub async fn connect() -> KeelResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            KeelError::Container(format!("Failed to connect to Docker daemon: {e}"))
        })?;
        client
            .ping()
            .await
            .map_err(|e| KeelError::Container(format!("Docker daemon ping failed: {e}")))?;
        Ok(Self { client })
    }

    async fn remove(client: &Docker, id: &str) {
        let removed = client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = removed {
            warn!(container_id = %id, error = %e, "Failed to remove container");
        }
    }

    async fn run_created(&self, id: &str) -> KeelResult<ExecResult> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| KeelError::Container(format!("Failed to start container: {e}")))?;

        let mut exit_code = -1;
        let mut waits = Box::pin(
            self.client
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );
        while let Some(item) = waits.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code;
                }
                Err(e) => {
                    return Err(KeelError::Container(format!(
                        "Failed waiting for container: {e}"
                    )))
                }
            }
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut logs = Box::pin(self.client.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(feature = "docker")]
#[async_trait]
impl ContainerRuntime for BollardRuntime {
    fn name(&self) -> &str {
        "docker-api"
    }

    async fn run(&self, spec: &ContainerSpec) -> KeelResult<ExecResult> {
        let command = sanitize_command(&spec.command)?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let memory_bytes = (spec.memory_mb * 1024 * 1024) as i64;
        // CPU quota: period=100_000 µs, quota = period * cpus
        #[allow(clippy::cast_possible_truncation)]
        let cpu_quota = (100_000.0 * spec.cpus) as i64;

        let host_config = bollard::models::HostConfig {
            memory: Some(memory_bytes),
            cpu_quota: Some(cpu_quota),
            cpu_period: Some(100_000),
            pids_limit: Some(256),
            network_mode: if spec.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            binds: spec
                .workspace_mount
                .as_ref()
                .map(|m| vec![format!("{}:{}", m.display(), spec.working_dir)]),
            ..Default::default()
        };

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| KeelError::Container(format!("Failed to create container: {e}")))?;
        let id = created.id;
        info!(container_id = %id, image = %spec.image, "Container created");

        let mut guard = {
            let client = self.client.clone();
            let id = id.clone();
            CleanupOnDrop::new(move || {
                warn!(container_id = %id, "Removing abandoned container");
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move { Self::remove(&client, &id).await });
                    }
                    Err(_) => warn!(container_id = %id, "No runtime left to remove container"),
                }
            })
        };
        let result = tokio::time::timeout(spec.timeout, self.run_created(&id)).await;
        Self::remove(&self.client, &id).await;
        guard.disarm();
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(KeelError::Container(format!(
                "container {id} exceeded {} ms",
                spec.timeout.as_millis()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerTool
// ---------------------------------------------------------------------------

/// Tool running commands inside a fresh container under the caller's limits.
pub struct ContainerTool {
    descriptor: ToolDescriptor,
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
}

impl ContainerTool {
    /// Wrap `runtime` with the configured image and mount.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Container,
                "Run a command inside a sandboxed container.",
                &["run"],
            ),
            runtime,
            config,
        }
    }

    /// The spec for a call: config defaults, call overrides, policy limits.
    pub fn spec_for(&self, call: &ToolCall, limits: &ExecLimits) -> ContainerSpec {
        let image = call.arguments["image"]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.image);
        ContainerSpec {
            image: image.to_string(),
            command: call.str_arg("command").to_string(),
            working_dir: self.config.working_dir.clone(),
            workspace_mount: self.config.workspace_mount.clone(),
            network_enabled: self.config.network_enabled,
            cpus: limits.cpus,
            memory_mb: limits.memory_mb,
            timeout: limits.timeout,
        }
    }
}

#[async_trait]
impl Tool for ContainerTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, limits: &ExecLimits) -> KeelResult<ToolResult> {
        let spec = self.spec_for(call, limits);
        if let Err(e) = sanitize_command(&spec.command) {
            return Ok(ToolResult::failure(Reason::permanent(e.to_string()), ""));
        }

        info!(
            runtime = %self.runtime.name(),
            image = %spec.image,
            cpus = spec.cpus,
            memory_mb = spec.memory_mb,
            "Running container command"
        );
        let exec = self.runtime.run(&spec).await?;

        let stdout = truncate_output(&exec.stdout, MAX_STDOUT);
        let exit_code = i32::try_from(exec.exit_code).unwrap_or(-1);
        if exec.exit_code == 0 {
            Ok(ToolResult::success(stdout).with_exit_code(exit_code))
        } else {
            let stderr = truncate_output(&exec.stderr, MAX_STDERR);
            Ok(ToolResult::failure(
                Reason::permanent(format!(
                    "container command exited with status {}: {}",
                    exec.exit_code,
                    stderr.trim_end()
                )),
                stdout,
            )
            .with_exit_code(exit_code))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::Role;
    use serde_json::json;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "rust:1".to_string(),
            command: "cargo test".to_string(),
            working_dir: "/workspace".to_string(),
            workspace_mount: Some(PathBuf::from("/srv/checkout")),
            network_enabled: false,
            cpus: 1.5,
            memory_mb: 768,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_dropped_run_triggers_cleanup() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cleaned = Arc::new(AtomicBool::new(false));
        let run = {
            let cleaned = cleaned.clone();
            async move {
                let mut guard = CleanupOnDrop::new(move || cleaned.store(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_secs(30)).await;
                guard.disarm();
            }
        };
        assert!(tokio::time::timeout(Duration::from_millis(20), run).await.is_err());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finished_run_skips_cleanup() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cleaned = Arc::new(AtomicBool::new(false));
        {
            let cleaned = cleaned.clone();
            let mut guard = CleanupOnDrop::new(move || cleaned.store(true, Ordering::SeqCst));
            tokio::task::yield_now().await;
            guard.disarm();
        }
        assert!(!cleaned.load(Ordering::SeqCst));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_container_removed_when_run_is_dropped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("removed");
        let fake = tmp.path().join("fake-docker");
        std::fs::write(
            &fake,
            format!(
                "#!/bin/sh\nif [ \"$1\" = rm ]; then echo \"$3\" > '{}'; exit 0; fi\nexec sleep 30\n",
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = DockerCliRuntime::new(fake.to_str().unwrap());
        let outcome = tokio::time::timeout(Duration::from_millis(200), runtime.run(&spec())).await;
        assert!(outcome.is_err());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let removed = std::fs::read_to_string(&marker).unwrap();
        assert!(removed.trim().starts_with("keel-"), "{removed}");
    }

    #[test]
    fn test_sanitize_command() {
        assert!(sanitize_command("ls -la").is_ok());
        assert!(sanitize_command("   ").is_err());
        assert!(sanitize_command("ls\0rm").is_err());
    }

    #[test]
    fn test_cli_args_carry_limits_and_isolation() {
        let args = DockerCliRuntime::run_args("keel-x", &spec());
        let joined = args.join(" ");
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--memory 768m"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--volume /srv/checkout:/workspace"));
        assert!(joined.ends_with("rust:1 sh -c cargo test"));
    }

    #[test]
    fn test_cli_args_network_enabled() {
        let mut s = spec();
        s.network_enabled = true;
        assert!(!DockerCliRuntime::run_args("n", &s).contains(&"none".to_string()));
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: ContainerConfig = toml::from_str("image = \"alpine:3\"").unwrap();
        assert_eq!(config.image, "alpine:3");
        assert_eq!(config.runtime, "docker");
        assert!(!config.network_enabled);
    }

    #[test]
    fn test_spec_uses_call_image_and_limits() {
        let tool = ContainerTool::new(
            Arc::new(DockerCliRuntime::default()),
            ContainerConfig::default(),
        );
        let call = ToolCall::new(
            Role::Tester,
            ToolKind::Container,
            "run",
            json!({"command": "pytest", "image": "python:3.12"}),
        );
        let limits = ExecLimits {
            timeout: Duration::from_secs(9),
            cpus: 2.0,
            memory_mb: 2048,
        };
        let spec = tool.spec_for(&call, &limits);
        assert_eq!(spec.image, "python:3.12");
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.timeout, Duration::from_secs(9));
    }
}
