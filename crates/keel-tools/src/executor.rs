use crate::tool::{ExecLimits, Tool, ToolDescriptor};
use keel_core::{Reason, ToolCall, ToolKind, ToolResult};
use keel_security::{AuditLog, AuditOutcome, Decision, PolicyEngine};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Executes tool calls on behalf of workers.
///
/// Every call is checked against the caller's role policy first; a denied
/// call is returned as a failed [`ToolResult`] and never reaches the tool.
pub struct ToolExecutor {
    tools: HashMap<ToolKind, Arc<dyn Tool>>,
    policy: Arc<PolicyEngine>,
    audit: Option<Arc<AuditLog>>,
}

impl ToolExecutor {
    /// An executor with no tools registered.
    pub fn new(policy: Arc<PolicyEngine>) -> Self {
        Self {
            tools: HashMap::new(),
            policy,
            audit: None,
        }
    }

    /// Record every decision and result in `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Register `tool`, replacing any tool of the same kind.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let kind = tool.descriptor().kind;
        info!(tool = %kind, "Registered tool");
        self.tools.insert(kind, tool);
    }

    /// The policy engine gating calls.
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Descriptors of every registered tool.
    pub fn list_descriptors(&self) -> Vec<&ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor()).collect()
    }

    /// Number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Check and execute one call.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        self.execute_cancellable(call, &CancellationToken::new())
            .await
    }

    /// Check and execute one call, aborting it when `cancel` fires.
    ///
    /// Dropping the in-flight future kills any process the tool spawned.
    pub async fn execute_cancellable(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolResult {
        if let Decision::Deny(reason) = self.policy.check(call.role, call) {
            warn!(
                role = %call.role,
                tool = %call.tool,
                operation = %call.operation,
                reason = reason.code.as_str(),
                "Tool call denied"
            );
            self.audit(call, AuditOutcome::Denied, Some(&reason), &reason.message);
            return ToolResult::failure(reason, "");
        }
        self.audit(call, AuditOutcome::Allowed, None, "");

        let Some(tool) = self.tools.get(&call.tool) else {
            let reason = Reason::transient(format!("no '{}' tool is registered", call.tool));
            self.audit(call, AuditOutcome::Failed, Some(&reason), &reason.message);
            return ToolResult::failure(reason, "");
        };
        if !tool.descriptor().supports(&call.operation) {
            let reason = Reason::permanent(format!(
                "the '{}' tool has no '{}' operation",
                call.tool, call.operation
            ));
            self.audit(call, AuditOutcome::Failed, Some(&reason), &reason.message);
            return ToolResult::failure(reason, "");
        }

        let limits = ExecLimits::for_call(&self.policy.limits(call.role), call.timeout_ms);
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                ToolResult::failure(Reason::cancelled("task cancelled during tool call"), "")
            }
            outcome = tokio::time::timeout(limits.timeout, tool.execute(call, &limits)) => {
                match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => ToolResult::failure(Reason::transient(e.to_string()), ""),
                    Err(_) => ToolResult::failure(
                        Reason::timeout(format!(
                            "'{} {}' exceeded {} ms",
                            call.tool,
                            call.operation,
                            limits.timeout.as_millis()
                        )),
                        "",
                    ),
                }
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = result.with_duration_ms(duration_ms);

        match result.reason() {
            None => {
                info!(
                    role = %call.role,
                    tool = %call.tool,
                    operation = %call.operation,
                    duration_ms,
                    "Tool call succeeded"
                );
                self.audit(call, AuditOutcome::Succeeded, None, "");
            }
            Some(reason) => {
                warn!(
                    role = %call.role,
                    tool = %call.tool,
                    operation = %call.operation,
                    reason = reason.code.as_str(),
                    duration_ms,
                    "Tool call failed"
                );
                self.audit(call, AuditOutcome::Failed, Some(reason), &reason.message);
            }
        }
        result
    }

    fn audit(&self, call: &ToolCall, outcome: AuditOutcome, reason: Option<&Reason>, message: &str) {
        if let Some(audit) = &self.audit {
            let details = if message.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!({ "message": message })
            };
            audit.record(call, outcome, reason, details);
        }
    }
}

