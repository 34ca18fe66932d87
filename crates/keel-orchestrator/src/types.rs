use chrono::{DateTime, Utc};
use keel_core::{Reason, ReasonCode, Role, ToolKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier. Caller-chosen, or a generated UUID string.
pub type TaskId = String;

/// Status of a task in the graph.
///
/// Transitions are monotonic: `pending -> ready -> running -> completed |
/// failed`, or `pending | ready -> blocked`. A cancelled task that never
/// ran ends `failed` with [`ReasonCode::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    /// Completed, failed and blocked are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    /// The lowercase status name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool invocation inside a task. String arguments may reference the
/// output of an earlier step with `{{steps.N.output}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    /// Tool to call.
    pub tool: ToolKind,
    /// Operation on that tool.
    pub operation: String,
    /// Arguments, possibly templated.
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Requested timeout, clamped by policy.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ToolStep {
    /// A step without a timeout request.
    pub fn new(tool: ToolKind, operation: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool,
            operation: operation.into(),
            arguments,
            timeout_ms: None,
        }
    }

    /// Request a timeout for this step.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Stages of the self-improvement pipeline, one task each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementStage {
    Propose,
    Test,
    Deploy,
    Monitor,
}

impl ImprovementStage {
    /// The snake_case stage name.
    pub fn as_str(self) -> &'static str {
        match self {
            ImprovementStage::Propose => "propose",
            ImprovementStage::Test => "test",
            ImprovementStage::Deploy => "deploy",
            ImprovementStage::Monitor => "monitor",
        }
    }

    /// The role whose worker drives this stage.
    pub fn role(self) -> Role {
        match self {
            ImprovementStage::Propose => Role::Coder,
            ImprovementStage::Test => Role::Tester,
            ImprovementStage::Deploy | ImprovementStage::Monitor => Role::Admin,
        }
    }
}

/// What a worker executes for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskWork {
    /// Tool steps run in order under the task's role.
    Steps { steps: Vec<ToolStep> },
    /// One stage of an improvement record.
    Improvement { record_id: Uuid, stage: ImprovementStage },
}

/// A task in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id.
    pub id: TaskId,
    /// Short description.
    pub title: String,
    /// Role whose policy governs the task's tool calls.
    pub role: Role,
    /// Tasks that must complete first.
    pub depends_on: Vec<TaskId>,
    /// Free-form data for the worker.
    #[serde(default)]
    pub context: serde_json::Value,
    /// What to execute.
    pub work: TaskWork,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Output of a completed task.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Why the task failed or was blocked.
    #[serde(default)]
    pub reason: Option<Reason>,
    /// Number of times a worker has claimed this task.
    #[serde(default)]
    pub attempts: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the latest claim.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task became terminal.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A reference from a task to the improvement record stage it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementRef {
    /// The improvement record.
    pub record_id: Uuid,
    /// Which stage of it.
    pub stage: ImprovementStage,
}

/// A task submission.
///
/// `role` is a string so an unknown role is reported as `invalid_role`
/// rather than failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Explicit id; generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    /// Short description.
    pub title: String,
    /// Role name, validated on submit.
    pub role: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Free-form data for the worker.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Tool steps, run in order.
    #[serde(default)]
    pub steps: Vec<ToolStep>,
    /// Set for improvement stage tasks instead of `steps`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub improvement: Option<ImprovementRef>,
}

impl TaskSpec {
    /// A spec with a generated id and no dependencies.
    pub fn new(title: impl Into<String>, role: Role) -> Self {
        Self {
            id: None,
            title: title.into(),
            role: role.as_str().to_string(),
            depends_on: Vec::new(),
            context: serde_json::Value::Null,
            steps: Vec::new(),
            improvement: None,
        }
    }

    /// Use an explicit id.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Append a tool step.
    pub fn with_step(mut self, step: ToolStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Attach worker context.
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Make this the `stage` task of improvement record `record_id`.
    pub fn for_improvement(mut self, record_id: Uuid, stage: ImprovementStage) -> Self {
        self.improvement = Some(ImprovementRef { record_id, stage });
        self
    }

    pub(crate) fn work(&self) -> TaskWork {
        match self.improvement {
            Some(ImprovementRef { record_id, stage }) => TaskWork::Improvement { record_id, stage },
            None => TaskWork::Steps {
                steps: self.steps.clone(),
            },
        }
    }
}

/// Rejected submissions. Nothing from the rejected batch enters the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("task '{id}' would complete a dependency cycle")]
    Cycle { id: TaskId },

    #[error("task '{id}' depends on unknown task '{dependency}'")]
    UnknownDependency { id: TaskId, dependency: TaskId },

    #[error("task '{id}' has invalid role '{role}'")]
    InvalidRole { id: TaskId, role: String },

    #[error("task id '{id}' is already in use")]
    DuplicateId { id: TaskId },

    #[error("scheduler unavailable")]
    Unavailable,
}

impl SubmitError {
    /// The reason code reported for this rejection.
    pub fn code(&self) -> ReasonCode {
        match self {
            SubmitError::Cycle { .. } => ReasonCode::Cycle,
            SubmitError::UnknownDependency { .. } => ReasonCode::UnknownDependency,
            SubmitError::InvalidRole { .. } => ReasonCode::InvalidRole,
            SubmitError::DuplicateId { .. } => ReasonCode::DuplicateId,
            SubmitError::Unavailable => ReasonCode::Transient,
        }
    }

    /// This rejection as a [`Reason`].
    pub fn to_reason(&self) -> Reason {
        Reason::new(self.code(), self.to_string())
    }
}

/// Errors from scheduler operations other than submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown task '{0}'")]
    UnknownTask(TaskId),

    #[error("task '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("scheduler unavailable")]
    Unavailable,
}

impl From<SchedulerError> for keel_core::KeelError {
    fn from(e: SchedulerError) -> Self {
        keel_core::KeelError::Scheduler(e.to_string())
    }
}

impl From<SubmitError> for keel_core::KeelError {
    fn from(e: SubmitError) -> Self {
        keel_core::KeelError::Graph(e.to_string())
    }
}

/// Lifecycle notifications broadcast by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted { id: TaskId },
    Ready { id: TaskId },
    Started { id: TaskId, attempt: u32 },
    Completed { id: TaskId },
    Failed { id: TaskId, reason: Reason },
    Blocked { id: TaskId, reason: Reason },
    Cancelled { id: TaskId },
    Requeued { id: TaskId, attempt: u32 },
}

impl TaskEvent {
    /// Id of the task the event is about.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Submitted { id }
            | TaskEvent::Ready { id }
            | TaskEvent::Started { id, .. }
            | TaskEvent::Completed { id }
            | TaskEvent::Failed { id, .. }
            | TaskEvent::Blocked { id, .. }
            | TaskEvent::Cancelled { id }
            | TaskEvent::Requeued { id, .. } => id,
        }
    }

    /// Whether this event puts its task in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Failed { .. } | TaskEvent::Blocked { .. }
        )
    }
}

/// Generate a fresh task id.
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_spec_deserializes_submission_schema() {
        let spec: TaskSpec = serde_json::from_value(json!({
            "title": "Write the parser",
            "role": "coder",
            "depends_on": ["design"],
            "context": {"ticket": 42},
            "steps": [
                {"tool": "fs", "operation": "write",
                 "arguments": {"path": "/workspace/p.rs", "content": "x"}}
            ]
        }))
        .unwrap();
        assert!(spec.id.is_none());
        assert_eq!(spec.depends_on, ["design"]);
        assert_eq!(spec.steps[0].tool, ToolKind::Fs);
        assert!(matches!(spec.work(), TaskWork::Steps { steps } if steps.len() == 1));
    }

    #[test]
    fn test_improvement_spec_work() {
        let id = Uuid::new_v4();
        let spec = TaskSpec::new("deploy", Role::Admin).for_improvement(id, ImprovementStage::Deploy);
        assert_eq!(
            spec.work(),
            TaskWork::Improvement {
                record_id: id,
                stage: ImprovementStage::Deploy
            }
        );
    }

    #[test]
    fn test_submit_error_codes() {
        let e = SubmitError::Cycle { id: "a".into() };
        assert_eq!(e.code(), ReasonCode::Cycle);
        assert_eq!(e.to_reason().code, ReasonCode::Cycle);
        assert!(e.to_string().contains("cycle"));
    }

    #[test]
    fn test_stage_roles() {
        assert_eq!(ImprovementStage::Propose.role(), Role::Coder);
        assert_eq!(ImprovementStage::Test.role(), Role::Tester);
        assert_eq!(ImprovementStage::Monitor.role(), Role::Admin);
    }

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent::Started {
            id: "t1".into(),
            attempt: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(event.task_id(), "t1");
    }
}
