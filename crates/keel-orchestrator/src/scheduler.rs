use crate::graph::{GraphSnapshot, TaskGraph};
use crate::types::{SchedulerError, SubmitError, Task, TaskEvent, TaskId, TaskSpec, TaskStatus};
use keel_core::{KeelResult, Reason, ReasonCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happens to a task whose worker crashed mid-execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    /// Fail the task with `worker_crashed`.
    #[default]
    Fail,
    /// Return the task to the ready set until it has been attempted
    /// `max_attempts` times, then fail it.
    Requeue { max_attempts: u32 },
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// What happens to a task whose worker crashed.
    pub crash_policy: CrashPolicy,
    /// Where to persist the graph after every mutation. Restored on start.
    pub snapshot_path: Option<PathBuf>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            crash_policy: CrashPolicy::Fail,
            snapshot_path: None,
            event_capacity: 1024,
        }
    }
}

/// A task handed to one worker, with the token that signals its
/// cancellation.
#[derive(Debug, Clone)]
pub struct Claim {
    /// The claimed task, now `running`.
    pub task: Task,
    /// Cancelled when the task is cancelled.
    pub cancel: CancellationToken,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Submit {
        specs: Vec<TaskSpec>,
        reply: Reply<Result<Vec<TaskId>, SubmitError>>,
    },
    Complete {
        id: TaskId,
        result: serde_json::Value,
        reply: Reply<Result<(), SchedulerError>>,
    },
    Fail {
        id: TaskId,
        reason: Reason,
        reply: Reply<Result<(), SchedulerError>>,
    },
    Cancel {
        id: TaskId,
        reply: Reply<Result<(), SchedulerError>>,
    },
    WorkerCrashed {
        id: TaskId,
        message: String,
        reply: Reply<Result<(), SchedulerError>>,
    },
    Claim {
        reply: Reply<Option<Claim>>,
    },
    ClaimTask {
        id: TaskId,
        reply: Reply<Option<Claim>>,
    },
    Status {
        id: TaskId,
        reply: Reply<Option<Task>>,
    },
    ReadyTasks {
        reply: Reply<Vec<Task>>,
    },
    Tasks {
        reply: Reply<Vec<Task>>,
    },
    Snapshot {
        reply: Reply<GraphSnapshot>,
    },
}

/// The single owner of the task graph.
///
/// Runs as one tokio task; every graph mutation arrives as a [`Command`]
/// and is applied in order, so status transitions never race.
struct Scheduler {
    graph: TaskGraph,
    config: SchedulerConfig,
    tokens: HashMap<TaskId, CancellationToken>,
    events: broadcast::Sender<TaskEvent>,
    notify: Arc<Notify>,
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!(
            tasks = self.graph.len(),
            crash_policy = ?self.config.crash_policy,
            "Scheduler started"
        );
        // Events from a restored snapshot.
        self.publish().await;

        while let Some(cmd) = rx.recv().await {
            let mutated = self.handle(cmd);
            if mutated {
                self.publish().await;
            }
        }
        debug!("Scheduler stopped: all handles dropped");
    }

    /// Apply one command. Returns whether the graph may have changed.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit { specs, reply } => {
                let count = specs.len();
                let result = self.graph.submit_batch(specs);
                match &result {
                    Ok(ids) => info!(count, ids = ?ids, "Tasks submitted"),
                    Err(e) => warn!(count, code = %e.code(), error = %e, "Submission rejected"),
                }
                let _ = reply.send(result);
            }
            Command::Complete { id, result, reply } => {
                let outcome = self.graph.complete(&id, result);
                if outcome.is_ok() {
                    self.tokens.remove(&id);
                    info!(task_id = %id, "Task completed");
                }
                let _ = reply.send(outcome);
            }
            Command::Fail { id, reason, reply } => {
                let outcome = self.graph.fail(&id, reason.clone());
                if outcome.is_ok() {
                    self.tokens.remove(&id);
                    warn!(task_id = %id, reason = %reason.code, message = %reason.message, "Task failed");
                }
                let _ = reply.send(outcome);
            }
            Command::Cancel { id, reply } => {
                let outcome = self.graph.cancel(&id).map(|before| {
                    if before == TaskStatus::Running {
                        if let Some(token) = self.tokens.get(&id) {
                            token.cancel();
                        }
                        let _ = self.events.send(TaskEvent::Cancelled { id: id.clone() });
                    }
                    info!(task_id = %id, status = %before, "Task cancelled");
                });
                let _ = reply.send(outcome);
            }
            Command::WorkerCrashed { id, message, reply } => {
                let _ = reply.send(self.worker_crashed(&id, message));
            }
            Command::Claim { reply } => {
                let claim = self.graph.claim().map(|task| self.track(task));
                let _ = reply.send(claim);
            }
            Command::ClaimTask { id, reply } => {
                let claim = self.graph.claim_task(&id).map(|task| self.track(task));
                let _ = reply.send(claim);
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.graph.get(&id).cloned());
                return false;
            }
            Command::ReadyTasks { reply } => {
                let _ = reply.send(self.graph.ready_tasks());
                return false;
            }
            Command::Tasks { reply } => {
                let _ = reply.send(self.graph.tasks());
                return false;
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.graph.snapshot());
                return false;
            }
        }
        true
    }

    fn track(&mut self, task: Task) -> Claim {
        let cancel = CancellationToken::new();
        self.tokens.insert(task.id.clone(), cancel.clone());
        debug!(task_id = %task.id, attempt = task.attempts, role = %task.role, "Task claimed");
        Claim { task, cancel }
    }

    fn worker_crashed(&mut self, id: &str, message: String) -> Result<(), SchedulerError> {
        let task = self
            .graph
            .get(id)
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }
        let attempts = task.attempts;
        self.tokens.remove(id);

        error!(task_id = %id, attempts, error = %message, "Worker crashed");
        match self.config.crash_policy {
            CrashPolicy::Requeue { max_attempts } if attempts < max_attempts => {
                self.graph.requeue(id)
            }
            _ => self.graph.fail(
                id,
                Reason::new(
                    ReasonCode::WorkerCrashed,
                    format!("worker crashed after {attempts} attempt(s): {message}"),
                ),
            ),
        }
    }

    /// Broadcast pending events, wake idle workers and persist the graph.
    async fn publish(&mut self) {
        let events = self.graph.drain_events();
        if events.is_empty() {
            return;
        }
        let wake = events
            .iter()
            .any(|e| matches!(e, TaskEvent::Ready { .. } | TaskEvent::Requeued { .. }));
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        if wake {
            self.notify.notify_waiters();
        }
        if let Some(path) = &self.config.snapshot_path {
            if let Err(e) = write_snapshot(path, &self.graph.snapshot()).await {
                warn!(path = %path.display(), error = %e, "Failed to persist graph snapshot");
            }
        }
    }
}

async fn write_snapshot(path: &std::path::Path, snapshot: &GraphSnapshot) -> KeelResult<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn load_snapshot(path: &std::path::Path) -> KeelResult<Option<GraphSnapshot>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Cloneable handle to the scheduler actor.
///
/// Every method is one round trip to the actor. Once the actor is gone,
/// calls fail with `Unavailable`.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<TaskEvent>,
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    /// Spawn the scheduler actor, restoring the graph from
    /// `config.snapshot_path` when that file exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SchedulerConfig) -> KeelResult<Self> {
        let graph = match &config.snapshot_path {
            Some(path) => match load_snapshot(path)? {
                Some(snapshot) => {
                    info!(path = %path.display(), tasks = snapshot.tasks.len(), "Restoring graph snapshot");
                    TaskGraph::restore(snapshot)
                }
                None => TaskGraph::new(),
            },
            None => TaskGraph::new(),
        };

        let (tx, rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let notify = Arc::new(Notify::new());
        let scheduler = Scheduler {
            graph,
            config,
            tokens: HashMap::new(),
            events: events.clone(),
            notify: notify.clone(),
        };
        tokio::spawn(scheduler.run(rx));

        Ok(Self { tx, events, notify })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Submit one task. Returns its id.
    pub async fn submit(&self, spec: TaskSpec) -> Result<TaskId, SubmitError> {
        let mut ids = self.submit_batch(vec![spec]).await?;
        Ok(ids.remove(0))
    }

    /// Submit tasks atomically; they may reference each other by id.
    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, SubmitError> {
        self.request(|reply| Command::Submit { specs, reply })
            .await
            .unwrap_or(Err(SubmitError::Unavailable))
    }

    /// Record a successful result. Duplicate completions are no-ops.
    pub async fn complete(&self, id: &str, result: serde_json::Value) -> Result<(), SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Complete { id, result, reply })
            .await
            .unwrap_or(Err(SchedulerError::Unavailable))
    }

    /// Record a failure; dependents are blocked.
    pub async fn fail(&self, id: &str, reason: Reason) -> Result<(), SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Fail { id, reason, reply })
            .await
            .unwrap_or(Err(SchedulerError::Unavailable))
    }

    /// Cancel a task. Pending and ready tasks fail with `cancelled`; a
    /// running task has its cancellation token signalled.
    pub async fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::Cancel { id, reply })
            .await
            .unwrap_or(Err(SchedulerError::Unavailable))
    }

    /// Release the claim of a crashed worker according to the crash policy.
    pub async fn worker_crashed(&self, id: &str, message: impl Into<String>) -> Result<(), SchedulerError> {
        let id = id.to_string();
        let message = message.into();
        self.request(|reply| Command::WorkerCrashed { id, message, reply })
            .await
            .unwrap_or(Err(SchedulerError::Unavailable))
    }

    /// Claim the oldest ready task.
    pub async fn claim(&self) -> Result<Option<Claim>, SchedulerError> {
        self.request(|reply| Command::Claim { reply })
            .await
            .ok_or(SchedulerError::Unavailable)
    }

    /// Claim a specific task. `None` if it is not ready, including when
    /// another worker won the race.
    pub async fn claim_task(&self, id: &str) -> Result<Option<Claim>, SchedulerError> {
        let id = id.to_string();
        self.request(|reply| Command::ClaimTask { id, reply })
            .await
            .ok_or(SchedulerError::Unavailable)
    }

    /// Current status of a task.
    pub async fn status(&self, id: &str) -> Result<TaskStatus, SchedulerError> {
        self.task(id).await.map(|t| t.status)
    }

    /// A task with its result or reason once terminal.
    pub async fn task(&self, id: &str) -> Result<Task, SchedulerError> {
        let key = id.to_string();
        self.request(|reply| Command::Status { id: key, reply })
            .await
            .ok_or(SchedulerError::Unavailable)?
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    /// Ready tasks in dispatch order.
    pub async fn ready_tasks(&self) -> Result<Vec<Task>, SchedulerError> {
        self.request(|reply| Command::ReadyTasks { reply })
            .await
            .ok_or(SchedulerError::Unavailable)
    }

    /// Every task in submission order.
    pub async fn tasks(&self) -> Result<Vec<Task>, SchedulerError> {
        self.request(|reply| Command::Tasks { reply })
            .await
            .ok_or(SchedulerError::Unavailable)
    }

    /// Every task in the graph.
    pub async fn snapshot(&self) -> Result<GraphSnapshot, SchedulerError> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .ok_or(SchedulerError::Unavailable)
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Signalled whenever tasks become ready.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Wait until a task reaches a terminal state.
    pub async fn wait_terminal(&self, id: &str) -> Result<Task, SchedulerError> {
        let mut events = self.subscribe();
        loop {
            let task = self.task(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() && event.task_id() == id => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SchedulerError::Unavailable)
                    }
                }
            }
        }
    }

    /// Wait until every submitted task is terminal. Returns all tasks.
    pub async fn wait_all(&self) -> Result<Vec<Task>, SchedulerError> {
        let mut events = self.subscribe();
        loop {
            let tasks = self.tasks().await?;
            if tasks.iter().all(|t| t.status.is_terminal()) {
                return Ok(tasks);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SchedulerError::Unavailable)
                    }
                }
            }
        }
    }
}
