use crate::engine::run_steps;
use crate::pool::TaskRun;
use crate::scheduler::SchedulerHandle;
use crate::types::{ImprovementStage, TaskEvent, TaskId, TaskSpec, TaskStatus, ToolStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{KeelError, KeelResult, Reason, ReasonCode, ToolKind};
use keel_tools::ToolExecutor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Opaque reference to one version of a module's code.
pub type VersionRef = String;

/// Smallest error-rate increase counted as a regression.
const MIN_ERROR_RATE_DELTA: f64 = 0.01;

/// Lifecycle of one improvement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementState {
    Proposed,
    UnderTest,
    Verified,
    Rejected,
    HotReloaded,
    Monitoring,
    Committed,
    RolledBack,
}

impl ImprovementState {
    /// Rejected, committed and rolled-back records never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ImprovementState::Rejected | ImprovementState::Committed | ImprovementState::RolledBack
        )
    }

    /// Whether `next` directly follows `self`. Every edge moves forward.
    pub fn can_transition_to(self, next: ImprovementState) -> bool {
        use ImprovementState::*;
        matches!(
            (self, next),
            (Proposed, UnderTest)
                | (Proposed, Rejected)
                | (UnderTest, Verified)
                | (UnderTest, Rejected)
                | (Verified, HotReloaded)
                | (HotReloaded, Monitoring)
                | (HotReloaded, RolledBack)
                | (Monitoring, Committed)
                | (Monitoring, RolledBack)
        )
    }

    /// The snake_case state name.
    pub fn as_str(self) -> &'static str {
        match self {
            ImprovementState::Proposed => "proposed",
            ImprovementState::UnderTest => "under_test",
            ImprovementState::Verified => "verified",
            ImprovementState::Rejected => "rejected",
            ImprovementState::HotReloaded => "hot_reloaded",
            ImprovementState::Monitoring => "monitoring",
            ImprovementState::Committed => "committed",
            ImprovementState::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ImprovementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performance figures for one module version, as reported by the
/// telemetry collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean request latency.
    pub latency_ms: f64,
    /// Fraction of failed requests, 0.0 to 1.0.
    pub error_rate: f64,
    /// Requests served by this version so far.
    #[serde(default)]
    pub requests: u64,
}

impl Metrics {
    /// Metrics with no request count.
    pub fn new(latency_ms: f64, error_rate: f64) -> Self {
        Self {
            latency_ms,
            error_rate,
            requests: 0,
        }
    }

    /// Set the request count.
    pub fn with_requests(mut self, requests: u64) -> Self {
        self.requests = requests;
        self
    }

    /// Whether these metrics are worse than `baseline` by more than the
    /// fraction `threshold`, in latency or in error rate.
    pub fn regresses(&self, baseline: &Metrics, threshold: f64) -> bool {
        let latency = self.latency_ms > baseline.latency_ms * (1.0 + threshold);
        let allowed_errors = (baseline.error_rate * threshold).max(MIN_ERROR_RATE_DELTA);
        let errors = self.error_rate - baseline.error_rate > allowed_errors;
        latency || errors
    }
}

/// Versioned code store: which version of each module is live.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// The live version of `module`.
    async fn get_current(&self, module: &str) -> KeelResult<VersionRef>;

    /// Atomically make `new_ref` live. Returns the version it replaced.
    async fn swap(&self, module: &str, new_ref: &VersionRef) -> KeelResult<VersionRef>;
}

/// Read-only telemetry for modules and their versions.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Reference performance of the live module.
    async fn baseline(&self, module: &str) -> KeelResult<Metrics>;

    /// Current performance of `version` of `module`.
    async fn observe(&self, module: &str, version: &VersionRef) -> KeelResult<Metrics>;
}

/// A [`CodeStore`] holding version pointers in memory.
#[derive(Default)]
pub struct InMemoryCodeStore {
    versions: Mutex<HashMap<String, VersionRef>>,
}

impl InMemoryCodeStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module` with `version` live.
    pub fn with_module(self, module: impl Into<String>, version: impl Into<VersionRef>) -> Self {
        self.versions.lock().insert(module.into(), version.into());
        self
    }

    /// The live version of `module`, if known.
    pub fn current(&self, module: &str) -> Option<VersionRef> {
        self.versions.lock().get(module).cloned()
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn get_current(&self, module: &str) -> KeelResult<VersionRef> {
        self.current(module)
            .ok_or_else(|| KeelError::Improvement(format!("unknown module '{module}'")))
    }

    async fn swap(&self, module: &str, new_ref: &VersionRef) -> KeelResult<VersionRef> {
        let mut versions = self.versions.lock();
        let slot = versions
            .get_mut(module)
            .ok_or_else(|| KeelError::Improvement(format!("unknown module '{module}'")))?;
        Ok(std::mem::replace(slot, new_ref.clone()))
    }
}

/// A [`MetricsSource`] replaying fixed samples.
///
/// Each `observe` of a version returns its next sample; the last sample
/// repeats once the sequence is exhausted.
#[derive(Default)]
pub struct StaticMetrics {
    baselines: Mutex<HashMap<String, Metrics>>,
    samples: Mutex<HashMap<VersionRef, VecDeque<Metrics>>>,
}

impl StaticMetrics {
    /// No baselines and no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baseline of `module`.
    pub fn with_baseline(self, module: impl Into<String>, metrics: Metrics) -> Self {
        self.baselines.lock().insert(module.into(), metrics);
        self
    }

    /// Queue samples returned for `version`, in order.
    pub fn with_samples(
        self,
        version: impl Into<VersionRef>,
        samples: impl IntoIterator<Item = Metrics>,
    ) -> Self {
        self.samples
            .lock()
            .insert(version.into(), samples.into_iter().collect());
        self
    }
}

#[async_trait]
impl MetricsSource for StaticMetrics {
    async fn baseline(&self, module: &str) -> KeelResult<Metrics> {
        self.baselines
            .lock()
            .get(module)
            .copied()
            .ok_or_else(|| KeelError::Improvement(format!("no baseline for module '{module}'")))
    }

    async fn observe(&self, _module: &str, version: &VersionRef) -> KeelResult<Metrics> {
        let mut samples = self.samples.lock();
        let queue = samples
            .get_mut(version)
            .ok_or_else(|| KeelError::Improvement(format!("no samples for version '{version}'")))?;
        let sample = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        sample.ok_or_else(|| KeelError::Improvement(format!("no samples for version '{version}'")))
    }
}

/// How long a deployed candidate is watched before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationWindow {
    /// Watch for a fixed time.
    Duration { duration_ms: u64 },
    /// Watch until the candidate has served `count` requests, or
    /// `max_duration_ms` has passed.
    Requests { count: u64, max_duration_ms: u64 },
}

impl ObservationWindow {
    fn max_duration(self) -> Duration {
        match self {
            ObservationWindow::Duration { duration_ms } => Duration::from_millis(duration_ms),
            ObservationWindow::Requests {
                max_duration_ms, ..
            } => Duration::from_millis(max_duration_ms),
        }
    }
}

impl Default for ObservationWindow {
    fn default() -> Self {
        ObservationWindow::Duration {
            duration_ms: 60_000,
        }
    }
}

/// Thresholds and timing of the improvement pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    /// Allowed candidate regression during test, as a fraction of baseline.
    pub tolerance: f64,
    /// Regression during monitoring that triggers a rollback.
    pub degradation_threshold: f64,
    /// How long a deployed candidate is watched.
    pub window: ObservationWindow,
    /// Delay between metric samples while monitoring.
    pub sample_interval_ms: u64,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.10,
            degradation_threshold: 0.50,
            window: ObservationWindow::default(),
            sample_interval_ms: 1_000,
        }
    }
}

/// External collaborators of the improvement controller.
pub struct ImprovementBackend {
    /// Where module versions are swapped.
    pub code_store: Arc<dyn CodeStore>,
    /// Where baseline and observed metrics come from.
    pub metrics: Arc<dyn MetricsSource>,
    /// Pipeline thresholds and timing.
    pub config: ImprovementConfig,
}

/// A candidate change to one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementProposal {
    /// Module the candidate replaces.
    pub target_module: String,
    /// Version to deploy if the candidate passes.
    pub candidate_ref: VersionRef,
    /// Coder steps that produce the candidate.
    #[serde(default)]
    pub propose_steps: Vec<ToolStep>,
    /// Tester steps; at least one runs the candidate in the container tool.
    pub test_steps: Vec<ToolStep>,
}

/// One state change of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// State before.
    pub from: ImprovementState,
    /// State after.
    pub to: ImprovementState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Why, for rejections and rollbacks.
    #[serde(default)]
    pub reason: Option<Reason>,
}

/// One pass through the improvement pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementRecord {
    /// Record id.
    pub id: Uuid,
    /// Module under improvement.
    pub target_module: String,
    /// Current pipeline state.
    pub state: ImprovementState,
    /// The candidate version.
    pub proposed_code_ref: VersionRef,
    /// The version the deploy replaced; the rollback target.
    pub previous_code_ref: Option<VersionRef>,
    /// Performance of the live version when the record was created.
    pub baseline_metrics: Metrics,
    /// Performance of the candidate under test.
    pub candidate_metrics: Option<Metrics>,
    /// Samples taken while monitoring.
    pub observed_metrics: Vec<Metrics>,
    /// Why the record was rejected or rolled back.
    pub reason: Option<Reason>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When `state` last changed.
    pub transitioned_at: DateTime<Utc>,
    /// Every transition, oldest first.
    pub history: Vec<Transition>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<Uuid, ImprovementRecord>,
    archive: HashMap<Uuid, ImprovementRecord>,
    proposals: HashMap<Uuid, ImprovementProposal>,
    /// Stage tasks by task id: record, stage and deploy round.
    stage_tasks: HashMap<TaskId, (Uuid, ImprovementStage, u32)>,
    /// Current deploy round per record; `retry_deploy` starts a new one.
    rounds: HashMap<Uuid, u32>,
    /// Module -> record holding its hot-reload slot.
    slots: HashMap<String, Uuid>,
}

impl Registry {
    fn record(&self, id: Uuid) -> Option<&ImprovementRecord> {
        self.active.get(&id).or_else(|| self.archive.get(&id))
    }

    fn forget(&mut self, id: Uuid) {
        self.active.remove(&id);
        self.proposals.remove(&id);
        self.rounds.remove(&id);
        self.stage_tasks.retain(|_, (record, _, _)| *record != id);
    }
}

/// Task id of a pipeline stage. Round 0 is the original pipeline.
pub fn stage_task_id(record: Uuid, stage: ImprovementStage, round: u32) -> TaskId {
    if round == 0 {
        format!("improve-{record}-{}", stage.as_str())
    } else {
        format!("improve-{record}-{}-{round}", stage.as_str())
    }
}

/// Drives improvement records through propose, test, deploy and monitor.
///
/// Each stage is an ordinary task in the graph, run by the worker pool
/// through [`ImprovementController::run_stage`]. A background watcher
/// reacts to stage tasks that fail or are blocked without running, so a
/// record never stays behind a dead pipeline.
pub struct ImprovementController {
    executor: Arc<ToolExecutor>,
    scheduler: SchedulerHandle,
    code_store: Arc<dyn CodeStore>,
    metrics: Arc<dyn MetricsSource>,
    config: ImprovementConfig,
    registry: Mutex<Registry>,
}

impl ImprovementController {
    /// Create the controller and spawn its event watcher.
    pub fn start(
        executor: Arc<ToolExecutor>,
        scheduler: SchedulerHandle,
        backend: ImprovementBackend,
    ) -> Arc<Self> {
        let events = scheduler.subscribe();
        let controller = Arc::new(Self {
            executor,
            scheduler,
            code_store: backend.code_store,
            metrics: backend.metrics,
            config: backend.config,
            registry: Mutex::new(Registry::default()),
        });
        tokio::spawn(watch(Arc::downgrade(&controller), events));
        controller
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &ImprovementConfig {
        &self.config
    }

    /// A record, active or archived.
    pub fn record(&self, id: Uuid) -> Option<ImprovementRecord> {
        self.registry.lock().record(id).cloned()
    }

    /// Records still moving through the pipeline.
    pub fn active_records(&self) -> Vec<ImprovementRecord> {
        self.registry.lock().active.values().cloned().collect()
    }

    /// Records in a terminal state.
    pub fn archived_records(&self) -> Vec<ImprovementRecord> {
        self.registry.lock().archive.values().cloned().collect()
    }

    /// Start a new record and submit its four stage tasks as a chain.
    pub async fn propose(&self, proposal: ImprovementProposal) -> KeelResult<Uuid> {
        if !proposal
            .test_steps
            .iter()
            .any(|s| s.tool == ToolKind::Container)
        {
            return Err(KeelError::Improvement(
                "test steps must run the candidate in the container tool".into(),
            ));
        }
        let baseline = self.metrics.baseline(&proposal.target_module).await?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let record = ImprovementRecord {
            id,
            target_module: proposal.target_module.clone(),
            state: ImprovementState::Proposed,
            proposed_code_ref: proposal.candidate_ref.clone(),
            previous_code_ref: None,
            baseline_metrics: baseline,
            candidate_metrics: None,
            observed_metrics: Vec::new(),
            reason: None,
            created_at: now,
            transitioned_at: now,
            history: Vec::new(),
        };

        let stages = [
            ImprovementStage::Propose,
            ImprovementStage::Test,
            ImprovementStage::Deploy,
            ImprovementStage::Monitor,
        ];
        let specs = self.stage_specs(id, &proposal, &stages, 0);
        {
            let mut reg = self.registry.lock();
            reg.active.insert(id, record);
            reg.proposals.insert(id, proposal.clone());
            reg.rounds.insert(id, 0);
            for stage in stages {
                reg.stage_tasks.insert(stage_task_id(id, stage, 0), (id, stage, 0));
            }
        }

        if let Err(e) = self.scheduler.submit_batch(specs).await {
            self.registry.lock().forget(id);
            return Err(e.into());
        }
        info!(
            record_id = %id,
            module = %proposal.target_module,
            candidate = %proposal.candidate_ref,
            "Improvement proposed"
        );
        Ok(id)
    }

    /// Submit a fresh deploy/monitor pair for a record still `verified`,
    /// typically after its deploy was refused with `module_busy`.
    pub async fn retry_deploy(&self, id: Uuid) -> KeelResult<Vec<TaskId>> {
        let (specs, round) = {
            let mut reg = self.registry.lock();
            let state = reg
                .active
                .get(&id)
                .map(|r| r.state)
                .ok_or_else(|| KeelError::Improvement(format!("no active improvement {id}")))?;
            if state != ImprovementState::Verified {
                return Err(KeelError::Improvement(format!(
                    "improvement {id} is {state}, not verified"
                )));
            }
            let proposal = reg
                .proposals
                .get(&id)
                .cloned()
                .ok_or_else(|| KeelError::Improvement(format!("no proposal for {id}")))?;
            let round = reg.rounds.get(&id).copied().unwrap_or(0) + 1;
            reg.rounds.insert(id, round);
            let stages = [ImprovementStage::Deploy, ImprovementStage::Monitor];
            for stage in stages {
                reg.stage_tasks
                    .insert(stage_task_id(id, stage, round), (id, stage, round));
            }
            (self.stage_specs(id, &proposal, &stages, round), round)
        };

        let ids = self.scheduler.submit_batch(specs).await?;
        info!(record_id = %id, round, "Improvement deploy retried");
        Ok(ids)
    }

    fn stage_specs(
        &self,
        id: Uuid,
        proposal: &ImprovementProposal,
        stages: &[ImprovementStage],
        round: u32,
    ) -> Vec<TaskSpec> {
        let mut previous: Option<TaskId> = None;
        stages
            .iter()
            .map(|&stage| {
                let task_id = stage_task_id(id, stage, round);
                let spec = TaskSpec::new(
                    format!("{} improvement to {}", stage.as_str(), proposal.target_module),
                    stage.role(),
                )
                .with_id(task_id.clone())
                .depends_on(previous.take())
                .with_context(json!({
                    "record_id": id,
                    "target_module": proposal.target_module,
                    "candidate_ref": proposal.candidate_ref,
                }))
                .for_improvement(id, stage);
                previous = Some(task_id);
                spec
            })
            .collect()
    }

    /// Run one stage of a record. Called by the worker that claimed the
    /// stage task.
    pub async fn run_stage(
        &self,
        id: Uuid,
        stage: ImprovementStage,
        cancel: &CancellationToken,
    ) -> TaskRun {
        match stage {
            ImprovementStage::Propose => self.propose_stage(id, cancel).await,
            ImprovementStage::Test => self.test_stage(id, cancel).await,
            ImprovementStage::Deploy => self.deploy_stage(id).await,
            ImprovementStage::Monitor => self.monitor_stage(id, cancel).await,
        }
    }

    fn expect_state(
        &self,
        id: Uuid,
        allowed: &[ImprovementState],
    ) -> Result<(ImprovementState, ImprovementRecord, ImprovementProposal), Reason> {
        let reg = self.registry.lock();
        let record = reg
            .record(id)
            .cloned()
            .ok_or_else(|| Reason::permanent(format!("unknown improvement {id}")))?;
        if !allowed.contains(&record.state) {
            return Err(Reason::permanent(format!(
                "improvement {id} is {}, stage cannot run",
                record.state
            )));
        }
        let proposal = reg
            .proposals
            .get(&id)
            .cloned()
            .ok_or_else(|| Reason::permanent(format!("no proposal for improvement {id}")))?;
        Ok((record.state, record, proposal))
    }

    async fn propose_stage(&self, id: Uuid, cancel: &CancellationToken) -> TaskRun {
        let (_, _, proposal) = match self.expect_state(id, &[ImprovementState::Proposed]) {
            Ok(found) => found,
            Err(reason) => return TaskRun::failed(reason, 0),
        };
        let run = run_steps(
            &self.executor,
            ImprovementStage::Propose.role(),
            &proposal.propose_steps,
            cancel,
        )
        .await;
        match run.outcome {
            Ok(output) => {
                self.transition(id, ImprovementState::UnderTest, None);
                TaskRun::completed(self.stage_output(id, output), run.tool_calls)
            }
            Err(reason) => {
                self.transition(id, ImprovementState::Rejected, Some(reason.clone()));
                TaskRun::failed(reason, run.tool_calls)
            }
        }
    }

    async fn test_stage(&self, id: Uuid, cancel: &CancellationToken) -> TaskRun {
        let (_, record, proposal) = match self.expect_state(id, &[ImprovementState::UnderTest]) {
            Ok(found) => found,
            Err(reason) => return TaskRun::failed(reason, 0),
        };
        let run = run_steps(
            &self.executor,
            ImprovementStage::Test.role(),
            &proposal.test_steps,
            cancel,
        )
        .await;
        let output = match run.outcome {
            Ok(output) => output,
            Err(reason) => {
                self.transition(id, ImprovementState::Rejected, Some(reason.clone()));
                return TaskRun::failed(reason, run.tool_calls);
            }
        };

        let candidate = match self
            .metrics
            .observe(&record.target_module, &record.proposed_code_ref)
            .await
        {
            Ok(m) => m,
            Err(e) => {
                let reason = Reason::transient(format!("candidate metrics unavailable: {e}"));
                self.transition(id, ImprovementState::Rejected, Some(reason.clone()));
                return TaskRun::failed(reason, run.tool_calls);
            }
        };
        self.registry
            .lock()
            .active
            .entry(id)
            .and_modify(|r| r.candidate_metrics = Some(candidate));

        if candidate.regresses(&record.baseline_metrics, self.config.tolerance) {
            let reason = Reason::new(
                ReasonCode::Regression,
                format!(
                    "candidate latency {:.1}ms / error rate {:.3} exceeds baseline {:.1}ms / {:.3} beyond tolerance {}",
                    candidate.latency_ms,
                    candidate.error_rate,
                    record.baseline_metrics.latency_ms,
                    record.baseline_metrics.error_rate,
                    self.config.tolerance
                ),
            );
            self.transition(id, ImprovementState::Rejected, Some(reason.clone()));
            return TaskRun::failed(reason, run.tool_calls);
        }

        self.transition(id, ImprovementState::Verified, None);
        TaskRun::completed(self.stage_output(id, output), run.tool_calls)
    }

    async fn deploy_stage(&self, id: Uuid) -> TaskRun {
        let (module, candidate) = {
            let mut reg = self.registry.lock();
            let Some(record) = reg.active.get(&id) else {
                return TaskRun::failed(Reason::permanent(format!("no active improvement {id}")), 0);
            };
            if record.state != ImprovementState::Verified {
                return TaskRun::failed(
                    Reason::permanent(format!("improvement {id} is {}, not verified", record.state)),
                    0,
                );
            }
            let module = record.target_module.clone();
            let candidate = record.proposed_code_ref.clone();
            let holder = reg.slots.get(&module).copied().filter(|h| *h != id);
            if let Some(holder) = holder {
                let reason = Reason::new(
                    ReasonCode::ModuleBusy,
                    format!("module '{module}' is being deployed by improvement {holder}"),
                );
                warn!(record_id = %id, module = %module, holder = %holder, "Deploy refused: module busy");
                return TaskRun::failed(reason, 0);
            }
            reg.slots.insert(module.clone(), id);
            (module, candidate)
        };

        match self.code_store.swap(&module, &candidate).await {
            Ok(previous) => {
                info!(record_id = %id, module = %module, from = %previous, to = %candidate, "Candidate hot-reloaded");
                self.registry
                    .lock()
                    .active
                    .entry(id)
                    .and_modify(|r| r.previous_code_ref = Some(previous));
                self.transition(id, ImprovementState::HotReloaded, None);
                TaskRun::completed(self.stage_output(id, json!(null)), 0)
            }
            Err(e) => {
                self.release_slot(&module, id);
                TaskRun::failed(
                    Reason::transient(format!("code store swap failed: {e}")),
                    0,
                )
            }
        }
    }

    async fn monitor_stage(&self, id: Uuid, cancel: &CancellationToken) -> TaskRun {
        let (state, record, _) = match self.expect_state(
            id,
            &[ImprovementState::HotReloaded, ImprovementState::Monitoring],
        ) {
            Ok(found) => found,
            Err(reason) => return TaskRun::failed(reason, 0),
        };
        if state == ImprovementState::HotReloaded {
            self.transition(id, ImprovementState::Monitoring, None);
        }

        let window = self.config.window;
        let deadline = Instant::now() + window.max_duration();
        let interval = Duration::from_millis(self.config.sample_interval_ms.max(1));
        info!(record_id = %id, module = %record.target_module, window = ?window, "Monitoring candidate");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.rollback_run(id, Reason::cancelled("monitoring was cancelled")).await;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let sample = match self
                .metrics
                .observe(&record.target_module, &record.proposed_code_ref)
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    return self
                        .rollback_run(id, Reason::transient(format!("metrics unavailable: {e}")))
                        .await;
                }
            };
            self.registry
                .lock()
                .active
                .entry(id)
                .and_modify(|r| r.observed_metrics.push(sample));

            if sample.regresses(&record.baseline_metrics, self.config.degradation_threshold) {
                let reason = Reason::new(
                    ReasonCode::Regression,
                    format!(
                        "observed latency {:.1}ms / error rate {:.3} degraded past baseline {:.1}ms / {:.3} by more than {}",
                        sample.latency_ms,
                        sample.error_rate,
                        record.baseline_metrics.latency_ms,
                        record.baseline_metrics.error_rate,
                        self.config.degradation_threshold
                    ),
                );
                return self.rollback_run(id, reason).await;
            }

            let expired = Instant::now() >= deadline;
            let done = match window {
                ObservationWindow::Duration { .. } => expired,
                ObservationWindow::Requests { count, .. } if sample.requests >= count => true,
                ObservationWindow::Requests { count, .. } => {
                    if expired {
                        warn!(
                            record_id = %id,
                            requests = sample.requests,
                            wanted = count,
                            "Observation window closed before the request count; committing"
                        );
                    }
                    expired
                }
            };
            if done {
                self.transition(id, ImprovementState::Committed, None);
                return TaskRun::completed(self.stage_output(id, json!(null)), 0);
            }
        }
    }

    async fn rollback_run(&self, id: Uuid, reason: Reason) -> TaskRun {
        match self.rollback(id, reason).await {
            Ok(reason) | Err(reason) => TaskRun::failed(reason, 0),
        }
    }

    /// Restore the recorded previous version, then mark the record
    /// `rolled_back`. If the revert fails the record keeps its state.
    async fn rollback(&self, id: Uuid, reason: Reason) -> Result<Reason, Reason> {
        let (module, previous) = {
            let reg = self.registry.lock();
            match reg.active.get(&id) {
                Some(r) => (r.target_module.clone(), r.previous_code_ref.clone()),
                None => return Ok(reason),
            }
        };
        if let Some(previous) = previous {
            if let Err(e) = self.code_store.swap(&module, &previous).await {
                error!(record_id = %id, module = %module, error = %e, "Rollback failed");
                return Err(Reason::transient(format!(
                    "rollback of '{module}' to {previous} failed: {e}"
                )));
            }
            info!(record_id = %id, module = %module, to = %previous, reason = %reason.code, "Rolled back");
        }
        self.transition(id, ImprovementState::RolledBack, Some(reason.clone()));
        Ok(reason)
    }

    fn release_slot(&self, module: &str, id: Uuid) {
        let mut reg = self.registry.lock();
        if reg.slots.get(module) == Some(&id) {
            reg.slots.remove(module);
        }
    }

    /// Move a record along one edge. Terminal records are archived and give
    /// up their module slot. Returns whether the transition happened.
    fn transition(&self, id: Uuid, to: ImprovementState, reason: Option<Reason>) -> bool {
        let mut reg = self.registry.lock();
        let Some(record) = reg.active.get_mut(&id) else {
            return false;
        };
        let from = record.state;
        if !from.can_transition_to(to) {
            warn!(record_id = %id, from = %from, to = %to, "Ignoring invalid improvement transition");
            return false;
        }
        let now = Utc::now();
        record.state = to;
        record.transitioned_at = now;
        if reason.is_some() {
            record.reason.clone_from(&reason);
        }
        record.history.push(Transition {
            from,
            to,
            at: now,
            reason,
        });
        info!(record_id = %id, module = %record.target_module, from = %from, to = %to, "Improvement transition");

        if to.is_terminal() {
            let module = record.target_module.clone();
            if reg.slots.get(&module) == Some(&id) {
                reg.slots.remove(&module);
            }
            if let Some(record) = reg.active.get(&id).cloned() {
                reg.forget(id);
                reg.archive.insert(id, record);
            }
        }
        true
    }

    fn stage_output(&self, id: Uuid, output: serde_json::Value) -> serde_json::Value {
        let state = self.record(id).map(|r| r.state);
        json!({ "record_id": id, "state": state, "output": output })
    }

    /// React to a stage task that ended without completing.
    async fn stage_ended(&self, task_id: &str, reason: Reason) {
        let (id, stage, round, state, current_round) = {
            let reg = self.registry.lock();
            let Some(&(id, stage, round)) = reg.stage_tasks.get(task_id) else {
                return;
            };
            let Some(record) = reg.active.get(&id) else {
                return;
            };
            let current = reg.rounds.get(&id).copied().unwrap_or(0);
            (id, stage, round, record.state, current)
        };

        use ImprovementState::*;
        match (stage, state) {
            (ImprovementStage::Propose | ImprovementStage::Test, Proposed | UnderTest) => {
                self.transition(id, Rejected, Some(reason));
            }
            (ImprovementStage::Deploy | ImprovementStage::Monitor, HotReloaded | Monitoring)
                if round == current_round =>
            {
                if let Err(e) = self.rollback(id, reason).await {
                    error!(record_id = %id, error = %e, "Improvement left in place after failed rollback");
                }
            }
            _ => {}
        }
    }

    /// Re-check every stage task after missed events.
    async fn reconcile(&self) {
        let tasks: Vec<TaskId> = self.registry.lock().stage_tasks.keys().cloned().collect();
        for task_id in tasks {
            if let Ok(task) = self.scheduler.task(&task_id).await {
                if matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
                    let reason = task
                        .reason
                        .unwrap_or_else(|| Reason::permanent("stage task did not complete"));
                    self.stage_ended(&task_id, reason).await;
                }
            }
        }
    }
}

async fn watch(controller: Weak<ImprovementController>, mut events: broadcast::Receiver<TaskEvent>) {
    loop {
        match events.recv().await {
            Ok(TaskEvent::Failed { id, reason }) | Ok(TaskEvent::Blocked { id, reason }) => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.stage_ended(&id, reason).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                warn!(missed, "Improvement watcher lagged; reconciling");
                controller.reconcile().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
