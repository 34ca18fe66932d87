//! `keel.toml` configuration.
//!
//! Every section is optional; a missing file section falls back to the
//! built-in defaults.

use keel_builtins::ContainerConfig;
use keel_core::{KeelError, KeelResult, Role};
use keel_orchestrator::{CrashPolicy, ImprovementConfig, SchedulerConfig};
use keel_security::{Policy, PolicyEngine};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    /// Directory for the audit log.
    pub data_dir: PathBuf,
    pub pool: PoolConfig,
    pub scheduler: SchedulerSection,
    /// Per-role replacements of the built-in policies.
    pub policies: BTreeMap<Role, Policy>,
    pub container: ContainerConfig,
    pub improvement: ImprovementConfig,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pool: PoolConfig::default(),
            scheduler: SchedulerSection::default(),
            policies: BTreeMap::new(),
            container: ContainerConfig::default(),
            improvement: ImprovementConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub crash_policy: CrashPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            crash_policy: CrashPolicy::Fail,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Graph snapshot written after every change and restored at startup.
    pub snapshot_path: Option<PathBuf>,
    pub event_capacity: Option<usize>,
}

impl KeelConfig {
    /// Load `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> KeelResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(KeelError::Config(format!(
                "failed to read '{}': {e}",
                path.display()
            ))),
        }
    }

    pub fn parse(text: &str) -> KeelResult<Self> {
        toml::from_str(text).map_err(|e| KeelError::Config(format!("invalid keel.toml: {e}")))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            crash_policy: self.pool.crash_policy,
            snapshot_path: self.scheduler.snapshot_path.clone(),
            event_capacity: self.scheduler.event_capacity.unwrap_or(defaults.event_capacity),
        }
    }

    /// Compile the role policies. Bad patterns are configuration errors.
    pub fn policy_engine(&self) -> KeelResult<PolicyEngine> {
        PolicyEngine::from_overrides(self.policies.clone())
    }
}
