use crate::monitor::{PoolMonitor, WorkOutcome};
use crate::scheduler::{Claim, SchedulerHandle};
use crate::types::Task;
use async_trait::async_trait;
use keel_core::Reason;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What running one task produced.
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// The task result, or why it failed.
    pub outcome: Result<serde_json::Value, Reason>,
    /// Tool calls attempted, for the pool monitor.
    pub tool_calls: u32,
}

impl TaskRun {
    /// A successful run producing `result`.
    pub fn completed(result: serde_json::Value, tool_calls: u32) -> Self {
        Self {
            outcome: Ok(result),
            tool_calls,
        }
    }

    /// A failed run.
    pub fn failed(reason: Reason, tool_calls: u32) -> Self {
        Self {
            outcome: Err(reason),
            tool_calls,
        }
    }
}

/// Executes the work of a claimed task.
///
/// Implementations should stop promptly once `cancel` fires and report
/// `cancelled`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> TaskRun;
}

/// A fixed-size pool of workers pulling from the scheduler's ready set.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    monitor: Arc<PoolMonitor>,
}

impl WorkerPool {
    /// Spawn `size` workers. Each claims ready tasks atomically, runs them
    /// through `runner` and reports the outcome exactly once.
    pub fn start(size: usize, scheduler: SchedulerHandle, runner: Arc<dyn TaskRunner>) -> Self {
        let size = size.max(1);
        let shutdown = CancellationToken::new();
        let monitor = Arc::new(PoolMonitor::new(size));
        let workers = (0..size)
            .map(|id| {
                let worker = Worker {
                    id,
                    scheduler: scheduler.clone(),
                    runner: runner.clone(),
                    monitor: monitor.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        info!(size, "Worker pool started");
        Self {
            workers,
            shutdown,
            monitor,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Shared monitor updated by every worker.
    pub fn monitor(&self) -> Arc<PoolMonitor> {
        self.monitor.clone()
    }

    /// Stop claiming new tasks and wait for in-flight tasks to be reported.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    scheduler: SchedulerHandle,
    runner: Arc<dyn TaskRunner>,
    monitor: Arc<PoolMonitor>,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        let notify = self.scheduler.notifier();
        loop {
            // Register interest before claiming so a task that becomes ready
            // between a failed claim and the wait still wakes this worker.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                break;
            }
            match self.scheduler.claim().await {
                Ok(Some(claim)) => {
                    self.execute(claim).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(worker = self.id, error = %e, "Scheduler gone, worker exiting");
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut notified => {}
            }
        }
    }

    async fn execute(&self, claim: Claim) {
        let Claim { task, cancel } = claim;
        let task_id = task.id.clone();
        info!(worker = self.id, task_id = %task_id, role = %task.role, attempt = task.attempts, "Worker started task");
        self.monitor.start_task(self.id, &task_id).await;
        let started = Instant::now();

        // A panic inside the runner is contained by the spawned task.
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner.run(&task, &cancel).await });
        let joined = handle.await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let run = match joined {
            Ok(run) => Ok(run),
            Err(e) => {
                error!(worker = self.id, task_id = %task_id, error = %e, "Task runner crashed");
                Err(e.to_string())
            }
        };
        let (outcome, tool_calls) = match &run {
            Ok(TaskRun {
                outcome: Ok(_),
                tool_calls,
            }) => (WorkOutcome::Completed, *tool_calls),
            Ok(TaskRun {
                outcome: Err(_),
                tool_calls,
            }) => (WorkOutcome::Failed, *tool_calls),
            Err(_) => (WorkOutcome::Crashed, 0),
        };
        // Metrics first, so anyone woken by the outcome event sees them.
        self.monitor
            .finish_task(self.id, outcome, tool_calls, duration_ms)
            .await;

        let report = match run {
            Ok(TaskRun {
                outcome: Ok(result),
                ..
            }) => self.scheduler.complete(&task_id, result).await,
            Ok(TaskRun {
                outcome: Err(reason),
                ..
            }) => self.scheduler.fail(&task_id, reason).await,
            Err(message) => self.scheduler.worker_crashed(&task_id, message).await,
        };
        if let Err(e) = report {
            warn!(worker = self.id, task_id = %task_id, error = %e, "Failed to report task outcome");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::types::{TaskSpec, TaskStatus};
    use keel_core::{ReasonCode, Role};
    use serde_json::json;

    /// Completes tasks titled "ok", fails "bad", panics on "panic".
    struct TitleRunner;

    #[async_trait]
    impl TaskRunner for TitleRunner {
        async fn run(&self, task: &Task, _cancel: &CancellationToken) -> TaskRun {
            match task.title.as_str() {
                "bad" => TaskRun::failed(Reason::permanent("bad task"), 1),
                "panic" => panic!("runner exploded"),
                _ => TaskRun::completed(json!(task.title), 2),
            }
        }
    }

    fn spec(id: &str, title: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec::new(title, Role::Coder)
            .with_id(id)
            .depends_on(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_pool_runs_dependency_chain() {
        let scheduler = SchedulerHandle::start(SchedulerConfig::default()).unwrap();
        let pool = WorkerPool::start(2, scheduler.clone(), Arc::new(TitleRunner));
        scheduler
            .submit_batch(vec![
                spec("a", "ok", &[]),
                spec("b", "ok", &["a"]),
                spec("c", "bad", &[]),
                spec("d", "ok", &["c"]),
            ])
            .await
            .unwrap();

        let tasks = scheduler.wait_all().await.unwrap();
        let status = |id: &str| tasks.iter().find(|t| t.id == id).unwrap().status;
        assert_eq!(status("a"), TaskStatus::Completed);
        assert_eq!(status("b"), TaskStatus::Completed);
        assert_eq!(status("c"), TaskStatus::Failed);
        assert_eq!(status("d"), TaskStatus::Blocked);

        let metrics = pool.monitor().aggregate_metrics().await;
        assert_eq!(metrics.tasks_completed, 2);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.tool_calls, 5);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_runner_releases_claim() {
        let scheduler = SchedulerHandle::start(SchedulerConfig::default()).unwrap();
        let pool = WorkerPool::start(1, scheduler.clone(), Arc::new(TitleRunner));
        scheduler
            .submit_batch(vec![spec("boom", "panic", &[]), spec("after", "ok", &[])])
            .await
            .unwrap();

        let boom = scheduler.wait_terminal("boom").await.unwrap();
        assert_eq!(boom.reason.unwrap().code, ReasonCode::WorkerCrashed);
        // The worker survives and keeps going.
        let after = scheduler.wait_terminal("after").await.unwrap();
        assert_eq!(after.status, TaskStatus::Completed);
        assert_eq!(pool.monitor().aggregate_metrics().await.crashes, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_tasks_submitted_later_are_picked_up() {
        let scheduler = SchedulerHandle::start(SchedulerConfig::default()).unwrap();
        let pool = WorkerPool::start(3, scheduler.clone(), Arc::new(TitleRunner));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let id = scheduler.submit(TaskSpec::new("ok", Role::Critic)).await.unwrap();
        let task = scheduler.wait_terminal(&id).await.unwrap();
        assert_eq!(task.result, Some(json!("ok")));
        pool.shutdown().await;
    }
}
