use crate::types::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Whether a worker slot currently holds a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
}

/// Counters for one worker, or summed across the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Tasks that completed.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Tasks whose runner panicked.
    pub crashes: u64,
    /// Tool calls attempted.
    pub tool_calls: u64,
    /// Time spent running tasks.
    pub busy_ms: u64,
}

/// What one worker is doing, and its counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    /// Worker index.
    pub id: usize,
    /// Idle or working.
    pub status: WorkerStatus,
    /// Task being run, if any.
    pub current_task: Option<TaskId>,
    /// Counters for this worker.
    pub metrics: WorkerMetrics,
}

/// How a worker's task ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed,
    Failed,
    /// The runner panicked.
    Crashed,
}

/// Tracks state and metrics for every worker in the pool.
pub struct PoolMonitor {
    states: Arc<RwLock<BTreeMap<usize, WorkerState>>>,
}

impl PoolMonitor {
    /// Track `workers` idle workers.
    pub fn new(workers: usize) -> Self {
        let states = (0..workers)
            .map(|id| {
                (
                    id,
                    WorkerState {
                        id,
                        status: WorkerStatus::Idle,
                        current_task: None,
                        metrics: WorkerMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark a worker as working on a task.
    pub async fn start_task(&self, worker: usize, task_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&worker) {
            state.current_task = Some(task_id.to_string());
            state.status = WorkerStatus::Working;
        }
    }

    /// Mark a worker as idle and record how its task ended.
    pub async fn finish_task(
        &self,
        worker: usize,
        outcome: WorkOutcome,
        tool_calls: u32,
        duration_ms: u64,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&worker) {
            state.current_task = None;
            state.status = WorkerStatus::Idle;
            match outcome {
                WorkOutcome::Completed => state.metrics.tasks_completed += 1,
                WorkOutcome::Failed => state.metrics.tasks_failed += 1,
                WorkOutcome::Crashed => state.metrics.crashes += 1,
            }
            state.metrics.tool_calls += u64::from(tool_calls);
            state.metrics.busy_ms += duration_ms;
        }
    }

    /// Get a snapshot of all worker states, ordered by worker id.
    pub async fn snapshot(&self) -> Vec<WorkerState> {
        let states = self.states.read().await;
        states.values().cloned().collect()
    }

    /// State of one worker.
    pub async fn get_state(&self, worker: usize) -> Option<WorkerState> {
        let states = self.states.read().await;
        states.get(&worker).cloned()
    }

    /// Get aggregate metrics across all workers.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let states = self.states.read().await;
        let mut total = WorkerMetrics::default();
        for state in states.values() {
            total.tasks_completed += state.metrics.tasks_completed;
            total.tasks_failed += state.metrics.tasks_failed;
            total.crashes += state.metrics.crashes;
            total.tool_calls += state.metrics.tool_calls;
            total.busy_ms += state.metrics.busy_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let workers = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        let busy = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Working)
            .count();
        serde_json::json!({
            "workers": workers,
            "busy": busy,
            "aggregate": aggregate,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = PoolMonitor::new(3);
        let states = monitor.snapshot().await;
        assert_eq!(states.len(), 3);
        for state in &states {
            assert_eq!(state.status, WorkerStatus::Idle);
            assert!(state.current_task.is_none());
        }
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = PoolMonitor::new(2);
        monitor.start_task(1, "build").await;
        let state = monitor.get_state(1).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Working);
        assert_eq!(state.current_task.as_deref(), Some("build"));

        monitor.finish_task(1, WorkOutcome::Completed, 3, 120).await;
        let state = monitor.get_state(1).await.unwrap();
        assert_eq!(state.status, WorkerStatus::Idle);
        assert!(state.current_task.is_none());
        assert_eq!(state.metrics.tasks_completed, 1);
        assert_eq!(state.metrics.tool_calls, 3);
        assert_eq!(state.metrics.busy_ms, 120);
    }

    #[tokio::test]
    async fn test_unknown_worker_ignored() {
        let monitor = PoolMonitor::new(1);
        monitor.start_task(9, "x").await;
        assert!(monitor.get_state(9).await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_metrics() {
        let monitor = PoolMonitor::new(2);
        monitor.finish_task(0, WorkOutcome::Completed, 2, 10).await;
        monitor.finish_task(1, WorkOutcome::Failed, 1, 5).await;
        monitor.finish_task(1, WorkOutcome::Crashed, 0, 1).await;

        let total = monitor.aggregate_metrics().await;
        assert_eq!(total.tasks_completed, 1);
        assert_eq!(total.tasks_failed, 1);
        assert_eq!(total.crashes, 1);
        assert_eq!(total.tool_calls, 3);
        assert_eq!(total.busy_ms, 16);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = PoolMonitor::new(2);
        monitor.start_task(0, "t1").await;
        let json = monitor.to_json().await;
        assert_eq!(json["workers"].as_array().unwrap().len(), 2);
        assert_eq!(json["busy"], 1);
        assert_eq!(json["workers"][0]["status"], "working");
        assert!(json["aggregate"].is_object());
    }
}
