//! Task orchestration for Keel: dependency graph, scheduler, worker pool and
//! the self-improvement pipeline.
//!
//! Tasks are submitted with declared dependencies into a [`TaskGraph`] owned
//! by a single scheduler actor. A fixed-size [`WorkerPool`] claims ready
//! tasks atomically and runs their tool steps through the policy-gated
//! executor; outcomes flow back to the scheduler, which unblocks or blocks
//! dependents. The [`ImprovementController`] drives code changes through
//! propose, test, deploy and monitor stages built from ordinary tasks.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Scheduler, pool and improvement controller started together.
//! - [`TaskGraph`] — Arena-backed DAG with incremental readiness.
//! - [`SchedulerHandle`] — Message-passing handle to the scheduler actor.
//! - [`WorkerPool`] — Bounded set of workers executing claimed tasks.
//! - [`PoolMonitor`] — Per-worker state and aggregate metrics.
//! - [`ImprovementController`] — Self-improvement state machine with rollback.

/// Tool-step execution and the orchestrator facade.
pub mod engine;
/// Dependency graph and readiness bookkeeping.
pub mod graph;
/// Self-improvement records, code store and metrics interfaces.
pub mod improvement;
/// Worker state and metrics.
pub mod monitor;
/// Worker pool and the task runner trait.
pub mod pool;
/// Scheduler actor and its handle.
pub mod scheduler;
/// Shared orchestration types (Task, TaskSpec, TaskEvent, etc.).
pub mod types;

pub use engine::{run_steps, Dispatcher, Orchestrator};
pub use graph::{GraphSnapshot, TaskGraph};
pub use improvement::{
    stage_task_id, CodeStore, ImprovementBackend, ImprovementConfig, ImprovementController,
    ImprovementProposal, ImprovementRecord, ImprovementState, InMemoryCodeStore, Metrics,
    MetricsSource, ObservationWindow, StaticMetrics, Transition, VersionRef,
};
pub use monitor::{PoolMonitor, WorkOutcome, WorkerMetrics, WorkerState, WorkerStatus};
pub use pool::{TaskRun, TaskRunner, WorkerPool};
pub use scheduler::{Claim, CrashPolicy, SchedulerConfig, SchedulerHandle};
pub use types::{
    new_task_id, ImprovementRef, ImprovementStage, SchedulerError, SubmitError, Task, TaskEvent,
    TaskId, TaskSpec, TaskStatus, TaskWork, ToolStep,
};
