//! Role policies and the pure policy check that gates every tool call.
//!
//! A [`Policy`] is plain configuration. [`PolicyEngine`] compiles one policy
//! per [`Role`] at startup (globs and regexes are validated once) and then
//! answers [`PolicyEngine::check`] without locks or side effects.
//!
//! Evaluation order:
//!
//! 1. the tool must be in `allowed_tools` ([`ReasonCode::ToolNotPermitted`]);
//! 2. the operation must match an `allowed_subcommands` glob for that tool
//!    ([`ReasonCode::OperationNotPermitted`]);
//! 3. the call's literal text must not match any denied pattern, and every
//!    path the call writes (fs mutations, shell redirections and writing
//!    commands, git output files) must stay below `write_roots`
//!    ([`ReasonCode::DangerousPattern`]);
//! 4. network calls must target an allowlisted host
//!    ([`ReasonCode::ForbiddenDestination`]).
//!
//! Step 3 runs after the allow rules and denies regardless of them.

use crate::defaults::{baseline_denied_patterns, default_policies};
use crate::writes::write_targets;
use keel_core::{KeelError, KeelResult, Reason, ReasonCode, Role, ToolCall, ToolKind};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

/// Hard resource ceilings for every call made under a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU cores passed to the container runtime.
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Memory ceiling in megabytes passed to the container runtime.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// Per-call timeout ceiling. Requested timeouts are clamped to it.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_cpus() -> f64 {
    1.0
}

fn default_memory_mb() -> u64 {
    512
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ResourceLimits {
    /// The effective timeout for a call: the request clamped to the ceiling.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> u64 {
        requested_ms
            .map(|ms| ms.min(self.timeout_ms))
            .unwrap_or(self.timeout_ms)
    }
}

/// Immutable per-role configuration of allowed and denied tool usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Tools the role may call at all.
    #[serde(default)]
    pub allowed_tools: BTreeSet<ToolKind>,
    /// Glob patterns (`*`, `?`) over operation names, per tool.
    #[serde(default)]
    pub allowed_subcommands: BTreeMap<ToolKind, Vec<String>>,
    /// Regexes matched against [`ToolCall::literal`].
    #[serde(default)]
    pub denied_patterns: Vec<String>,
    /// Hosts (or `*.domain`, or `*`) reachable by network calls.
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    /// Directories below which mutating filesystem calls are allowed.
    #[serde(default)]
    pub write_roots: Vec<PathBuf>,
    /// Ceilings applied to every call.
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

/// The verdict of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The call may run.
    Allow,
    /// The call is refused, with the reason.
    Deny(Reason),
}

impl Decision {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// The denial reason code, if denied.
    pub fn code(&self) -> Option<ReasonCode> {
        match self {
            Decision::Allow => None,
            Decision::Deny(reason) => Some(reason.code),
        }
    }

    fn deny(code: ReasonCode, message: impl Into<String>) -> Self {
        Decision::Deny(Reason::new(code, message))
    }
}

struct CompiledPolicy {
    policy: Policy,
    operations: HashMap<ToolKind, Vec<Regex>>,
    denied: RegexSet,
    denied_sources: Vec<String>,
}

impl CompiledPolicy {
    fn compile(role: Role, policy: Policy) -> KeelResult<Self> {
        let mut operations = HashMap::new();
        for (tool, globs) in &policy.allowed_subcommands {
            let compiled = globs
                .iter()
                .map(|g| glob_to_regex(g))
                .collect::<KeelResult<Vec<_>>>()?;
            operations.insert(*tool, compiled);
        }

        let mut denied_sources = policy.denied_patterns.clone();
        for pattern in baseline_denied_patterns() {
            if !denied_sources.iter().any(|p| p == pattern) {
                denied_sources.push((*pattern).to_string());
            }
        }
        let denied = RegexSet::new(&denied_sources).map_err(|e| {
            KeelError::Policy(format!("invalid denied pattern for role '{role}': {e}"))
        })?;

        Ok(Self {
            policy,
            operations,
            denied,
            denied_sources,
        })
    }

    fn check(&self, role: Role, call: &ToolCall) -> Decision {
        let policy = &self.policy;

        if !policy.allowed_tools.contains(&call.tool) {
            return Decision::deny(
                ReasonCode::ToolNotPermitted,
                format!("role '{role}' may not use the '{}' tool", call.tool),
            );
        }

        let op_allowed = self
            .operations
            .get(&call.tool)
            .is_some_and(|globs| globs.iter().any(|re| re.is_match(&call.operation)));
        if !op_allowed {
            return Decision::deny(
                ReasonCode::OperationNotPermitted,
                format!(
                    "role '{role}' may not perform '{} {}'",
                    call.tool, call.operation
                ),
            );
        }

        let literal = call.literal();
        if let Some(index) = self.denied.matches(&literal).iter().next() {
            return Decision::deny(
                ReasonCode::DangerousPattern,
                format!(
                    "'{literal}' matches denied pattern '{}'",
                    self.denied_sources[index]
                ),
            );
        }

        for target in write_targets(call) {
            if let Some(denial) = self.check_write_root(call.tool, &target) {
                return denial;
            }
        }

        if let Some(denial) = self.check_destination(call) {
            return denial;
        }

        Decision::Allow
    }

    fn check_write_root(&self, tool: ToolKind, raw: &str) -> Option<Decision> {
        let path = Path::new(raw);
        if raw.is_empty() || !path.is_absolute() {
            return Some(Decision::deny(
                ReasonCode::DangerousPattern,
                format!("{tool} writes need an absolute path, got '{raw}'"),
            ));
        }
        let normalized = normalize(path);
        let inside = self
            .policy
            .write_roots
            .iter()
            .any(|root| normalized.starts_with(normalize(root)));
        if inside {
            None
        } else {
            Some(Decision::deny(
                ReasonCode::DangerousPattern,
                format!(
                    "{tool} write to '{}' is outside the allowed roots",
                    normalized.display()
                ),
            ))
        }
    }

    fn check_destination(&self, call: &ToolCall) -> Option<Decision> {
        let url = call.str_arg("url");
        if url.is_empty() {
            return (call.tool == ToolKind::Http).then(|| {
                Decision::deny(
                    ReasonCode::ForbiddenDestination,
                    "network call without a destination url",
                )
            });
        }

        let host = match url::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(h) => h.to_ascii_lowercase(),
                None => {
                    return Some(Decision::deny(
                        ReasonCode::ForbiddenDestination,
                        format!("url '{url}' has no host"),
                    ))
                }
            },
            Err(e) => {
                return Some(Decision::deny(
                    ReasonCode::ForbiddenDestination,
                    format!("invalid url '{url}': {e}"),
                ))
            }
        };

        if host_allowed(&host, &self.policy.network_allowlist) {
            None
        } else {
            Some(Decision::deny(
                ReasonCode::ForbiddenDestination,
                format!("host '{host}' is not on the allowlist"),
            ))
        }
    }
}

/// Evaluates tool calls against the compiled per-role policies.
///
/// Built once at startup; read-only afterwards.
pub struct PolicyEngine {
    policies: HashMap<Role, CompiledPolicy>,
}

impl PolicyEngine {
    /// An engine using the built-in role policies.
    pub fn with_defaults() -> KeelResult<Self> {
        Self::from_policies(default_policies())
    }

    /// An engine from a complete role -> policy table.
    ///
    /// Every role must have a policy; the baseline denied patterns are
    /// appended to each one.
    pub fn from_policies(policies: BTreeMap<Role, Policy>) -> KeelResult<Self> {
        let mut compiled = HashMap::new();
        for role in Role::ALL {
            let policy = policies.get(&role).cloned().ok_or_else(|| {
                KeelError::Policy(format!("no policy configured for role '{role}'"))
            })?;
            compiled.insert(role, CompiledPolicy::compile(role, policy)?);
        }
        Ok(Self { policies: compiled })
    }

    /// The built-in policies with some roles replaced wholesale.
    pub fn from_overrides(overrides: BTreeMap<Role, Policy>) -> KeelResult<Self> {
        let mut policies = default_policies();
        policies.extend(overrides);
        Self::from_policies(policies)
    }

    /// Decide whether `role` may perform `call`. Pure; never executes anything.
    pub fn check(&self, role: Role, call: &ToolCall) -> Decision {
        match self.policies.get(&role) {
            Some(policy) => policy.check(role, call),
            None => Decision::deny(
                ReasonCode::ToolNotPermitted,
                format!("no policy loaded for role '{role}'"),
            ),
        }
    }

    /// The raw policy for a role.
    pub fn policy(&self, role: Role) -> Option<&Policy> {
        self.policies.get(&role).map(|c| &c.policy)
    }

    /// The resource ceilings for a role. Falls back to the strict default.
    pub fn limits(&self, role: Role) -> ResourceLimits {
        self.policy(role)
            .map(|p| p.resource_limits.clone())
            .unwrap_or_default()
    }

    /// Every denied pattern in force for a role, baseline included.
    pub fn denied_patterns(&self, role: Role) -> &[String] {
        self.policies
            .get(&role)
            .map(|c| c.denied_sources.as_slice())
            .unwrap_or_default()
    }
}

/// Compile a `*`/`?` glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> KeelResult<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| KeelError::Policy(format!("invalid glob '{glob}': {e}")))
}

/// Whether `host` is covered by the allowlist. Matches on label boundaries.
pub fn host_allowed(host: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry == "*" {
            return true;
        }
        let domain = entry.strip_prefix("*.").unwrap_or(&entry);
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
