//! Executes allowed local actions.
//!
//! Every call is checked by the guardrail engine against one policy
//! snapshot, executed against that same snapshot under the configured
//! limits, and leaves exactly one audit event behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use toolgate_security::Action;
use toolgate_security::ActionRequest;
use toolgate_security::AuditKind;
use toolgate_security::AuditLog;
use toolgate_security::AuditRecord;
use toolgate_security::CallOutcome;
use toolgate_security::Decision;
use toolgate_security::GuardrailEngine;
use toolgate_security::MetricsRecorder;
use toolgate_security::ToolKind;
use tracing::info;
use tracing::warn;

use crate::error::InvokeError;
use crate::error::Result;
use crate::limits::ExecutionLimits;
use crate::output::Spool;
use crate::tools;
use crate::tools::ToolContext;
use crate::tools::ToolResult;

/// Extra fields merged into `workspace_status` output.
pub type StatusHook = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub tool: ToolKind,
    pub content: Value,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spool_paths: Vec<PathBuf>,
    pub rule: String,
    pub policy_version: u64,
    pub latency_ms: u64,
}

pub struct ToolInvoker {
    engine: Arc<GuardrailEngine>,
    audit: Arc<AuditLog>,
    metrics: Arc<MetricsRecorder>,
    limits: ExecutionLimits,
    spool: Option<Spool>,
    status_hook: Option<StatusHook>,
}

impl ToolInvoker {
    pub fn new(
        engine: Arc<GuardrailEngine>,
        audit: Arc<AuditLog>,
        metrics: Arc<MetricsRecorder>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            engine,
            audit,
            metrics,
            limits,
            spool: None,
            status_hook: None,
        }
    }

    pub fn with_spool(mut self, spool: Spool) -> Self {
        self.spool = Some(spool);
        self
    }

    pub fn with_status_hook(mut self, hook: StatusHook) -> Self {
        self.status_hook = Some(hook);
        self
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn engine(&self) -> &Arc<GuardrailEngine> {
        &self.engine
    }

    /// Check and run one local action. Remote actions are refused with
    /// [`InvokeError::NotLocal`] without touching the budget.
    pub async fn invoke(&self, request: &ActionRequest) -> Result<ToolOutput> {
        let tool = request.action.kind();
        if let Action::Remote(args) = &request.action {
            return Err(InvokeError::NotLocal(args.endpoint.clone()));
        }
        let started = Instant::now();
        let policy = self.engine.policy();
        let decision = self.engine.check_against(&policy, request, None);
        let args = audit_args(&request.action);

        if !decision.is_allowed() {
            info!(run_id = %request.run_id, %tool, rule = %decision.rule, "tool call denied");
            self.audit.emit(
                AuditRecord::new(AuditKind::ToolCallDenied)
                    .run(&request.run_id)
                    .policy_version(decision.policy_version)
                    .payload(json!({
                        "tool": tool,
                        "args": args,
                        "step_index": request.step_index,
                        "rule": decision.rule,
                        "reason": decision.reason,
                    })),
            );
            self.metrics
                .record_call(tool.as_str(), CallOutcome::Denied, Duration::ZERO);
            return Err(InvokeError::Denied(decision));
        }

        let ctx = ToolContext {
            run_id: &request.run_id,
            policy: &policy,
            limits: &self.limits,
            spool: self.spool.as_ref(),
        };
        let dispatched = self.dispatch(&ctx, &request.action);
        let result = match tokio::time::timeout(self.limits.timeout, dispatched).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout {
                limit: self.limits.timeout,
            }),
        };
        let latency = started.elapsed();
        self.finish(request, &decision, args, latency, result)
    }

    async fn dispatch(&self, ctx: &ToolContext<'_>, action: &Action) -> Result<ToolResult> {
        match action {
            Action::ReadFile(args) => tools::read_file(ctx, args).await,
            Action::WriteFile(args) => tools::write_file(ctx, args).await,
            Action::ShellExec(args) => tools::shell_exec(ctx, args).await,
            Action::RepoSummary(args) => tools::repo_summary(ctx, args).await,
            Action::WorkspaceStatus => {
                let mut extra = json!({ "usage": self.engine.usage(ctx.run_id) });
                if let (Some(hook), Value::Object(map)) = (&self.status_hook, &mut extra) {
                    if let Value::Object(hooked) = hook() {
                        map.extend(hooked);
                    }
                }
                Ok(tools::workspace_status(ctx, extra))
            }
            Action::Remote(args) => Err(InvokeError::NotLocal(args.endpoint.clone())),
        }
    }

    fn finish(
        &self,
        request: &ActionRequest,
        decision: &Decision,
        args: Value,
        latency: Duration,
        result: Result<ToolResult>,
    ) -> Result<ToolOutput> {
        let tool = request.action.kind();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let base = AuditRecord::new(AuditKind::ToolCallCompleted)
            .run(&request.run_id)
            .policy_version(decision.policy_version);
        match result {
            Ok(done) => {
                self.audit.emit(base.payload(json!({
                    "tool": tool,
                    "args": args,
                    "step_index": request.step_index,
                    "rule": decision.rule,
                    "latency_ms": latency_ms,
                    "truncated": done.truncated,
                    "spool_paths": done.spool_paths,
                })));
                self.metrics
                    .record_call(tool.as_str(), CallOutcome::Completed, latency);
                Ok(ToolOutput {
                    tool,
                    content: done.content,
                    truncated: done.truncated,
                    spool_paths: done.spool_paths,
                    rule: decision.rule.clone(),
                    policy_version: decision.policy_version,
                    latency_ms,
                })
            }
            Err(err) => {
                let kind = match err {
                    InvokeError::Timeout { .. } => AuditKind::ToolCallTimedOut,
                    _ => AuditKind::ToolCallFailed,
                };
                let detail = match &err {
                    InvokeError::Tool { detail, .. } => detail.clone(),
                    _ => Value::Null,
                };
                warn!(run_id = %request.run_id, %tool, error = %err, "tool call failed");
                self.audit.emit(
                    AuditRecord::new(kind)
                        .run(&request.run_id)
                        .policy_version(decision.policy_version)
                        .payload(json!({
                            "tool": tool,
                            "args": args,
                            "step_index": request.step_index,
                            "rule": decision.rule,
                            "latency_ms": latency_ms,
                            "error": err.to_string(),
                            "transient": err.is_transient(),
                            "detail": detail,
                        })),
                );
                self.metrics
                    .record_call(tool.as_str(), CallOutcome::Failed, latency);
                Err(err)
            }
        }
    }
}

/// Arguments as they appear in audit events. File contents are reduced to
/// their size.
fn audit_args(action: &Action) -> Value {
    match action {
        Action::WriteFile(args) => json!({
            "path": args.path,
            "content_bytes": args.content.len(),
        }),
        other => serde_json::to_value(other)
            .ok()
            .and_then(|mut value| value.get_mut("args").map(Value::take))
            .unwrap_or(Value::Null),
    }
}
