use crate::types::{SchedulerError, SubmitError, Task, TaskEvent, TaskId, TaskSpec, TaskStatus};
use chrono::Utc;
use keel_core::{Reason, ReasonCode, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

struct Node {
    task: Task,
    /// Indices of tasks that list this one in `depends_on`.
    dependents: Vec<usize>,
    /// Dependencies not yet completed.
    unmet: usize,
}

/// Serialized form of a [`TaskGraph`]: its tasks in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Every task, in insertion order.
    pub tasks: Vec<Task>,
}

/// Dependency graph of tasks.
///
/// Nodes live in a flat arena indexed by insertion order; edges are index
/// lists. Readiness is tracked incrementally with an unmet-dependency
/// counter per node, and the ready set is ordered by index so claims are
/// FIFO by submission. Every mutation records [`TaskEvent`]s that the owner
/// drains with [`TaskGraph::drain_events`].
#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
    index: HashMap<TaskId, usize>,
    ready: BTreeSet<usize>,
    events: Vec<TaskEvent>,
}

impl TaskGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks, in any status.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no task was ever submitted.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Submit a single task.
    pub fn submit(&mut self, spec: TaskSpec) -> Result<TaskId, SubmitError> {
        let mut ids = self.submit_batch(vec![spec])?;
        Ok(ids.remove(0))
    }

    /// Submit tasks atomically.
    ///
    /// Tasks may reference each other by caller-chosen id. Any invalid task
    /// rejects the whole batch and leaves the graph untouched.
    pub fn submit_batch(&mut self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, SubmitError> {
        let ids: Vec<TaskId> = specs
            .iter()
            .map(|s| s.id.clone().unwrap_or_else(crate::types::new_task_id))
            .collect();

        let mut batch: HashMap<&str, usize> = HashMap::with_capacity(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            if self.index.contains_key(id) || batch.insert(id.as_str(), pos).is_some() {
                return Err(SubmitError::DuplicateId { id: id.clone() });
            }
        }

        let mut roles = Vec::with_capacity(specs.len());
        for (spec, id) in specs.iter().zip(&ids) {
            let role: Role = spec.role.parse().map_err(|_| SubmitError::InvalidRole {
                id: id.clone(),
                role: spec.role.clone(),
            })?;
            roles.push(role);
        }

        for (spec, id) in specs.iter().zip(&ids) {
            for dep in &spec.depends_on {
                if dep == id {
                    return Err(SubmitError::Cycle { id: id.clone() });
                }
                if !self.index.contains_key(dep) && !batch.contains_key(dep.as_str()) {
                    return Err(SubmitError::UnknownDependency {
                        id: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Existing tasks never depend on new ones, so a cycle must lie
        // entirely inside the batch.
        let edges: Vec<Vec<usize>> = specs
            .iter()
            .map(|s| {
                s.depends_on
                    .iter()
                    .filter_map(|d| batch.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        if let Some(pos) = find_cycle(&edges) {
            return Err(SubmitError::Cycle {
                id: ids[pos].clone(),
            });
        }

        let now = Utc::now();
        let base = self.nodes.len();
        for ((spec, id), role) in specs.iter().zip(&ids).zip(roles) {
            let mut seen = HashSet::new();
            let depends_on: Vec<TaskId> = spec
                .depends_on
                .iter()
                .filter(|d| seen.insert(d.as_str()))
                .cloned()
                .collect();
            self.index.insert(id.clone(), self.nodes.len());
            self.nodes.push(Node {
                task: Task {
                    id: id.clone(),
                    title: spec.title.clone(),
                    role,
                    depends_on,
                    context: spec.context.clone(),
                    work: spec.work(),
                    status: TaskStatus::Pending,
                    result: None,
                    reason: None,
                    attempts: 0,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                },
                dependents: Vec::new(),
                unmet: 0,
            });
            self.events.push(TaskEvent::Submitted { id: id.clone() });
        }

        let mut poisoned = Vec::new();
        for idx in base..self.nodes.len() {
            let deps: Vec<usize> = self.nodes[idx]
                .task
                .depends_on
                .iter()
                .filter_map(|d| self.index.get(d).copied())
                .collect();
            for dep in deps {
                match self.nodes[dep].task.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed | TaskStatus::Blocked => poisoned.push((idx, dep)),
                    _ => {
                        self.nodes[dep].dependents.push(idx);
                        self.nodes[idx].unmet += 1;
                    }
                }
            }
        }

        for (idx, dep) in poisoned {
            if self.nodes[idx].task.status == TaskStatus::Pending {
                let reason = Reason::new(
                    ReasonCode::DependencyFailed,
                    format!("dependency '{}' already failed", self.nodes[dep].task.id),
                );
                self.mark_blocked(idx, reason);
                self.block_dependents(idx);
            }
        }
        for idx in base..self.nodes.len() {
            if self.nodes[idx].task.status == TaskStatus::Pending && self.nodes[idx].unmet == 0 {
                self.mark_ready(idx);
            }
        }

        Ok(ids)
    }

    /// Record a successful result. Completing an already completed task is
    /// a no-op.
    pub fn complete(&mut self, id: &str, result: serde_json::Value) -> Result<(), SchedulerError> {
        let idx = self.lookup(id)?;
        match self.nodes[idx].task.status {
            TaskStatus::Completed => return Ok(()),
            TaskStatus::Running => {}
            other => return Err(self.invalid(idx, other, TaskStatus::Completed)),
        }

        let node = &mut self.nodes[idx];
        node.task.status = TaskStatus::Completed;
        node.task.result = Some(result);
        node.task.completed_at = Some(Utc::now());
        self.events.push(TaskEvent::Completed { id: id.to_string() });

        let dependents = self.nodes[idx].dependents.clone();
        for dep in dependents {
            let node = &mut self.nodes[dep];
            node.unmet = node.unmet.saturating_sub(1);
            if node.unmet == 0 && node.task.status == TaskStatus::Pending {
                self.mark_ready(dep);
            }
        }
        Ok(())
    }

    /// Record a failure and block everything downstream. Failing an already
    /// failed task is a no-op.
    pub fn fail(&mut self, id: &str, reason: Reason) -> Result<(), SchedulerError> {
        let idx = self.lookup(id)?;
        match self.nodes[idx].task.status {
            TaskStatus::Failed => return Ok(()),
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running => {}
            other => return Err(self.invalid(idx, other, TaskStatus::Failed)),
        }
        self.fail_index(idx, reason);
        Ok(())
    }

    /// Cancel a task that has not started. It ends `failed` with
    /// [`ReasonCode::Cancelled`] and its dependents are blocked.
    ///
    /// Returns the task's status before the call; running tasks are left
    /// for the owner to signal.
    pub fn cancel(&mut self, id: &str) -> Result<TaskStatus, SchedulerError> {
        let idx = self.lookup(id)?;
        let status = self.nodes[idx].task.status;
        if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
            self.events.push(TaskEvent::Cancelled { id: id.to_string() });
            self.fail_index(idx, Reason::cancelled("cancelled before it started"));
        }
        Ok(status)
    }

    /// Claim the oldest ready task, moving it to `running`.
    pub fn claim(&mut self) -> Option<Task> {
        let idx = self.ready.pop_first()?;
        Some(self.start(idx))
    }

    /// Claim a specific task if it is ready. Losing the race returns `None`.
    pub fn claim_task(&mut self, id: &str) -> Option<Task> {
        let idx = *self.index.get(id)?;
        if self.ready.remove(&idx) {
            Some(self.start(idx))
        } else {
            None
        }
    }

    /// Return a running task to the ready set after its worker crashed.
    ///
    /// This is the only backward transition the graph allows.
    pub fn requeue(&mut self, id: &str) -> Result<(), SchedulerError> {
        let idx = self.lookup(id)?;
        let status = self.nodes[idx].task.status;
        if status != TaskStatus::Running {
            return Err(self.invalid(idx, status, TaskStatus::Ready));
        }
        let node = &mut self.nodes[idx];
        node.task.status = TaskStatus::Ready;
        node.task.started_at = None;
        let attempt = node.task.attempts;
        self.ready.insert(idx);
        self.events.push(TaskEvent::Requeued {
            id: id.to_string(),
            attempt,
        });
        Ok(())
    }

    /// Current status of a task.
    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    /// Look up a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&idx| &self.nodes[idx].task)
    }

    /// Ready tasks in dispatch order.
    pub fn ready_tasks(&self) -> Vec<Task> {
        self.ready
            .iter()
            .map(|&idx| self.nodes[idx].task.clone())
            .collect()
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.nodes.iter().map(|n| n.task.clone()).collect()
    }

    /// Take the events recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    /// Capture every task for persistence.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            tasks: self.tasks(),
        }
    }

    /// Rebuild a graph from a snapshot.
    ///
    /// Tasks that were running when the snapshot was taken have lost their
    /// worker: they are failed with [`ReasonCode::WorkerCrashed`].
    pub fn restore(snapshot: GraphSnapshot) -> Self {
        let mut graph = Self::new();
        for task in snapshot.tasks {
            graph.index.insert(task.id.clone(), graph.nodes.len());
            graph.nodes.push(Node {
                task,
                dependents: Vec::new(),
                unmet: 0,
            });
        }

        for idx in 0..graph.nodes.len() {
            let deps: Vec<usize> = graph.nodes[idx]
                .task
                .depends_on
                .iter()
                .filter_map(|d| graph.index.get(d).copied())
                .collect();
            for dep in deps {
                graph.nodes[dep].dependents.push(idx);
                if graph.nodes[dep].task.status != TaskStatus::Completed {
                    graph.nodes[idx].unmet += 1;
                }
            }
        }

        let mut crashed = Vec::new();
        for idx in 0..graph.nodes.len() {
            let status = graph.nodes[idx].task.status;
            match status {
                TaskStatus::Ready => {
                    graph.ready.insert(idx);
                }
                TaskStatus::Pending if graph.nodes[idx].unmet == 0 => graph.mark_ready(idx),
                TaskStatus::Running => crashed.push(idx),
                _ => {}
            }
        }
        for idx in crashed {
            graph.fail_index(
                idx,
                Reason::new(
                    ReasonCode::WorkerCrashed,
                    "task was running when the scheduler stopped",
                ),
            );
        }
        graph
    }

    fn lookup(&self, id: &str) -> Result<usize, SchedulerError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| SchedulerError::UnknownTask(id.to_string()))
    }

    fn invalid(&self, idx: usize, from: TaskStatus, to: TaskStatus) -> SchedulerError {
        SchedulerError::InvalidTransition {
            id: self.nodes[idx].task.id.clone(),
            from,
            to,
        }
    }

    fn start(&mut self, idx: usize) -> Task {
        let task = &mut self.nodes[idx].task;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.attempts += 1;
        self.events.push(TaskEvent::Started {
            id: task.id.clone(),
            attempt: task.attempts,
        });
        task.clone()
    }

    fn mark_ready(&mut self, idx: usize) {
        let task = &mut self.nodes[idx].task;
        task.status = TaskStatus::Ready;
        self.ready.insert(idx);
        self.events.push(TaskEvent::Ready {
            id: task.id.clone(),
        });
    }

    fn mark_blocked(&mut self, idx: usize, reason: Reason) {
        self.ready.remove(&idx);
        let task = &mut self.nodes[idx].task;
        task.status = TaskStatus::Blocked;
        task.reason = Some(reason.clone());
        task.completed_at = Some(Utc::now());
        self.events.push(TaskEvent::Blocked {
            id: task.id.clone(),
            reason,
        });
    }

    fn fail_index(&mut self, idx: usize, reason: Reason) {
        self.ready.remove(&idx);
        let task = &mut self.nodes[idx].task;
        task.status = TaskStatus::Failed;
        task.reason = Some(reason.clone());
        task.completed_at = Some(Utc::now());
        self.events.push(TaskEvent::Failed {
            id: task.id.clone(),
            reason,
        });
        self.block_dependents(idx);
    }

    /// Block the downstream closure of `root`, breadth-first, in one pass.
    fn block_dependents(&mut self, root: usize) {
        let root_id = self.nodes[root].task.id.clone();
        let mut queue: VecDeque<usize> = self.nodes[root].dependents.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            if !matches!(
                self.nodes[idx].task.status,
                TaskStatus::Pending | TaskStatus::Ready
            ) {
                continue;
            }
            self.mark_blocked(
                idx,
                Reason::new(
                    ReasonCode::DependencyFailed,
                    format!("upstream task '{root_id}' did not complete"),
                ),
            );
            queue.extend(self.nodes[idx].dependents.iter().copied());
        }
    }
}

/// Find a node on a cycle, following `edges[n]` from node `n` to its
/// dependencies. Iterative DFS with in-progress (1) and done (2) marks.
fn find_cycle(edges: &[Vec<usize>]) -> Option<usize> {
    let mut state = vec![0u8; edges.len()];
    for root in 0..edges.len() {
        if state[root] != 0 {
            continue;
        }
        let mut stack = vec![(root, 0usize)];
        state[root] = 1;
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if let Some(&dep) = edges[node].get(top.1) {
                top.1 += 1;
                match state[dep] {
                    1 => return Some(node),
                    0 => {
                        state[dep] = 1;
                        stack.push((dep, 0));
                    }
                    _ => {}
                }
            } else {
                state[node] = 2;
                stack.pop();
            }
        }
    }
    None
}
