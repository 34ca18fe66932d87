//! Plan files: a batch of tasks, and optionally improvement proposals
//! rehearsed against in-memory module versions and recorded metrics.

use keel_core::{KeelError, KeelResult};
use keel_orchestrator::{
    ImprovementBackend, ImprovementConfig, ImprovementProposal, InMemoryCodeStore, Metrics,
    StaticMetrics, TaskSpec, VersionRef,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Plan {
    #[serde(rename = "task")]
    pub tasks: Vec<TaskSpec>,
    #[serde(rename = "improvement")]
    pub improvements: Vec<ImprovementProposal>,
    /// Live version of each module before the plan runs.
    pub modules: BTreeMap<String, VersionRef>,
    pub metrics: PlanMetrics,
}

/// Recorded metrics replayed to the improvement pipeline.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PlanMetrics {
    pub baseline: BTreeMap<String, Metrics>,
    /// Samples per version, returned in order; the last one repeats.
    pub samples: BTreeMap<VersionRef, Vec<Metrics>>,
}

impl Plan {
    pub fn load(path: &Path) -> KeelResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KeelError::Config(format!("failed to read '{}': {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> KeelResult<Self> {
        let mut plan: Plan =
            toml::from_str(text).map_err(|e| KeelError::Config(format!("invalid plan: {e}")))?;
        // Improvement stage tasks are created by the controller only.
        for task in &mut plan.tasks {
            task.improvement = None;
        }
        for proposal in &plan.improvements {
            if !plan.modules.contains_key(&proposal.target_module) {
                return Err(KeelError::Config(format!(
                    "improvement targets module '{}' with no entry under [modules]",
                    proposal.target_module
                )));
            }
        }
        Ok(plan)
    }

    /// The in-memory backend the plan's improvements run against, if it
    /// has any.
    pub fn improvement_backend(
        &self,
        config: ImprovementConfig,
    ) -> Option<(ImprovementBackend, Arc<InMemoryCodeStore>)> {
        if self.improvements.is_empty() {
            return None;
        }
        let store = Arc::new(
            self.modules
                .iter()
                .fold(InMemoryCodeStore::new(), |store, (module, version)| {
                    store.with_module(module.clone(), version.clone())
                }),
        );
        let mut metrics = StaticMetrics::new();
        for (module, baseline) in &self.metrics.baseline {
            metrics = metrics.with_baseline(module.clone(), *baseline);
        }
        for (version, samples) in &self.metrics.samples {
            metrics = metrics.with_samples(version.clone(), samples.iter().copied());
        }
        let backend = ImprovementBackend {
            code_store: store.clone(),
            metrics: Arc::new(metrics),
            config,
        };
        Some((backend, store))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use keel_core::ToolKind;

    const PLAN: &str = r#"
[[task]]
id = "write"
title = "Write the module"
role = "coder"
[[task.steps]]
tool = "fs"
operation = "write"
arguments = { path = "/workspace/lib.rs", content = "pub fn add() {}" }

[[task]]
id = "test"
title = "Run the tests"
role = "tester"
depends_on = ["write"]
[[task.steps]]
tool = "container"
operation = "run"
arguments = { command = "cargo test" }
timeout_ms = 60000

[[improvement]]
target_module = "router"
candidate_ref = "v2"
[[improvement.test_steps]]
tool = "container"
operation = "run"
arguments = { command = "cargo test" }

[modules]
router = "v1"

[metrics.baseline]
router = { latency_ms = 100.0, error_rate = 0.01 }

[metrics.samples]
v2 = [{ latency_ms = 95.0, error_rate = 0.01 }, { latency_ms = 97.0, error_rate = 0.0, requests = 40 }]
"#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::parse(PLAN).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec!["write".to_string()]);
        assert_eq!(plan.tasks[1].steps[0].tool, ToolKind::Container);
        assert_eq!(plan.tasks[1].steps[0].timeout_ms, Some(60_000));
        assert_eq!(plan.tasks[0].steps[0].arguments["content"], "pub fn add() {}");
        assert_eq!(plan.improvements[0].candidate_ref, "v2");
        assert_eq!(plan.metrics.samples["v2"][1].requests, 40);
    }

    #[tokio::test]
    async fn test_improvement_backend_replays_plan_data() {
        use keel_orchestrator::{CodeStore, MetricsSource};

        let plan = Plan::parse(PLAN).unwrap();
        let (backend, store) = plan
            .improvement_backend(ImprovementConfig::default())
            .unwrap();
        assert_eq!(store.current("router").as_deref(), Some("v1"));
        assert_eq!(backend.code_store.get_current("router").await.unwrap(), "v1");
        assert_eq!(backend.metrics.baseline("router").await.unwrap().latency_ms, 100.0);
        let v2 = "v2".to_string();
        assert_eq!(backend.metrics.observe("router", &v2).await.unwrap().latency_ms, 95.0);
        assert_eq!(backend.metrics.observe("router", &v2).await.unwrap().latency_ms, 97.0);
    }

    #[test]
    fn test_plan_without_improvements_has_no_backend() {
        let plan = Plan::parse("[[task]]\ntitle = \"noop\"\nrole = \"critic\"\n").unwrap();
        assert!(plan.improvement_backend(ImprovementConfig::default()).is_none());
    }

    #[test]
    fn test_improvement_needs_known_module() {
        let text = r#"
[[improvement]]
target_module = "auth"
candidate_ref = "v9"
test_steps = []
"#;
        assert!(Plan::parse(text).is_err());
    }

    #[test]
    fn test_plan_cannot_smuggle_stage_tasks() {
        let text = r#"
[[task]]
title = "fake deploy"
role = "admin"
improvement = { record_id = "00000000-0000-0000-0000-000000000000", stage = "deploy" }
"#;
        let plan = Plan::parse(text).unwrap();
        assert!(plan.tasks[0].improvement.is_none());
    }
}
