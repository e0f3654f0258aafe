//! Guardrail evaluation.
//!
//! [`evaluate`] is a pure function of a request, a policy snapshot and an
//! [`EvaluationContext`]. [`GuardrailEngine`] wraps it with the pieces of
//! state the policy cannot hold: the live policy store, run budgets and the
//! command allow-list extension from the environment.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::action::Action;
use crate::action::ActionRequest;
use crate::budget::BudgetLedger;
use crate::budget::BudgetUsage;
use crate::budget::check_budget;
use crate::policy::Policy;
use crate::scope::CommandPattern;
use crate::scope::PathAccess;
use crate::scope::RuleHit;
use crate::scope::tokenize;
use crate::scope::url_host;
use crate::store::PolicyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

/// Outcome of evaluating one request, tied to the policy version that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub rule: String,
    pub reason: String,
    pub policy_version: u64,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    fn allow(rule: String, policy_version: u64) -> Self {
        Self {
            verdict: Verdict::Allow,
            rule,
            reason: "allowed".to_string(),
            policy_version,
        }
    }

    fn deny(hit: RuleHit, policy_version: u64) -> Self {
        Self {
            verdict: Verdict::Deny,
            rule: hit.rule,
            reason: hit.reason,
            policy_version,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = match self.verdict {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
        };
        write!(
            f,
            "{verdict} by {} (policy v{}): {}",
            self.rule, self.policy_version, self.reason
        )
    }
}

/// Facts about a request that live outside the policy.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    pub usage: BudgetUsage,
    /// Commands appended to the policy allow-list at evaluation time.
    pub extra_commands: Vec<CommandPattern>,
    /// Host a remote action will contact, when its transport is networked.
    pub remote_host: Option<String>,
}

/// Evaluate every rule in order: tool allow-list, path, command, network,
/// budget. The first denial wins.
pub fn evaluate(request: &ActionRequest, policy: &Policy, ctx: &EvaluationContext) -> Decision {
    let outcome = evaluate_rules(request, policy, ctx)
        .and_then(|rule| check_budget(&policy.budgets, &ctx.usage).map(|()| rule));
    match outcome {
        Ok(rule) => Decision::allow(rule, policy.version),
        Err(hit) => Decision::deny(hit, policy.version),
    }
}

/// Everything except the budget rule. Returns the rule that allowed the
/// request.
fn evaluate_rules(
    request: &ActionRequest,
    policy: &Policy,
    ctx: &EvaluationContext,
) -> Result<String, RuleHit> {
    let tool = request.action.kind();
    if !policy.tool_allowed(tool) {
        return Err(RuleHit::new(
            format!("tools.allowed_tools[{tool}]"),
            format!("tool `{tool}` is not enabled"),
        ));
    }
    match &request.action {
        Action::ReadFile(args) => policy
            .paths
            .check(&args.path, PathAccess::Read)
            .map(|(_, rule)| rule),
        Action::WriteFile(args) => policy
            .paths
            .check(&args.path, PathAccess::Write)
            .map(|(_, rule)| rule),
        Action::ShellExec(args) => {
            if let Some(cwd) = &args.cwd {
                policy.paths.check(cwd, PathAccess::WorkingDir)?;
            }
            let argv = tokenize(&args.command)
                .ok_or_else(|| RuleHit::new("commands", "command has unbalanced quoting"))?;
            let Some(program) = argv.first() else {
                return Err(RuleHit::new("commands", "empty command"));
            };
            let pattern = policy
                .commands
                .matching(&argv, &ctx.extra_commands)
                .ok_or_else(|| {
                    RuleHit::new(
                        "commands.allowed_commands",
                        format!("command `{program}` is not allow-listed"),
                    )
                })?;
            for token in &argv[1..] {
                check_command_token(policy, token)?;
            }
            Ok(format!("commands.allowed_commands[{pattern}]"))
        }
        Action::RepoSummary(_) | Action::WorkspaceStatus => {
            Ok(format!("tools.allowed_tools[{tool}]"))
        }
        Action::Remote(_) => match &ctx.remote_host {
            Some(host) => policy.network.check_host(host),
            None => Ok(format!("tools.allowed_tools[{tool}]")),
        },
    }
}

/// Command arguments that point at the network need the network rule too.
fn check_command_token(policy: &Policy, token: &str) -> Result<(), RuleHit> {
    match url_host(token) {
        Some(host) => policy.network.check_host(&host).map(|_| ()),
        None if token.starts_with("http") && !policy.network.allow_net() => Err(RuleHit::new(
            "network.allow_net",
            "command argument looks like a URL and network access is disabled",
        )),
        None => Ok(()),
    }
}

/// Where extra allow-listed commands come from. Extensions can only add to
/// the policy's list.
#[derive(Debug, Clone, Default)]
pub enum CommandOverrides {
    #[default]
    None,
    /// Comma-separated list read from this environment variable on every
    /// evaluation.
    Env(String),
    Fixed(Vec<String>),
}

impl CommandOverrides {
    pub fn resolve(&self) -> Vec<CommandPattern> {
        match self {
            CommandOverrides::None => Vec::new(),
            CommandOverrides::Env(var) => std::env::var(var)
                .map(|value| parse_command_list(&value))
                .unwrap_or_default(),
            CommandOverrides::Fixed(list) => list
                .iter()
                .filter_map(|text| CommandPattern::parse(text))
                .collect(),
        }
    }
}

fn parse_command_list(value: &str) -> Vec<CommandPattern> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(CommandPattern::parse)
        .collect()
}

pub struct GuardrailEngine {
    store: Arc<PolicyStore>,
    ledger: BudgetLedger,
    overrides: CommandOverrides,
}

impl GuardrailEngine {
    pub fn new(store: Arc<PolicyStore>, overrides: CommandOverrides) -> Self {
        Self {
            store,
            ledger: BudgetLedger::new(),
            overrides,
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn policy(&self) -> Arc<Policy> {
        self.store.current()
    }

    /// Evaluate against the current policy snapshot and, when allowed,
    /// charge one tool call to the run.
    pub fn check(&self, request: &ActionRequest, remote_host: Option<&str>) -> Decision {
        let policy = self.store.current();
        self.check_against(&policy, request, remote_host)
    }

    /// Same as [`GuardrailEngine::check`] with a snapshot the caller holds,
    /// so it can execute against exactly the rules that allowed the call.
    pub fn check_against(
        &self,
        policy: &Policy,
        request: &ActionRequest,
        remote_host: Option<&str>,
    ) -> Decision {
        let ctx = EvaluationContext {
            usage: BudgetUsage::default(),
            extra_commands: self.overrides.resolve(),
            remote_host: remote_host.map(str::to_string),
        };
        let outcome = evaluate_rules(request, policy, &ctx).and_then(|rule| {
            self.ledger
                .try_charge_call(&request.run_id, &policy.budgets)
                .map(|_| rule)
        });
        let decision = match outcome {
            Ok(rule) => Decision::allow(rule, policy.version),
            Err(hit) => Decision::deny(hit, policy.version),
        };
        debug!(
            run_id = %request.run_id,
            tool = %request.action.kind(),
            verdict = ?decision.verdict,
            rule = %decision.rule,
            policy_version = decision.policy_version,
            "guardrail decision"
        );
        decision
    }

    pub fn usage(&self, run_id: &str) -> BudgetUsage {
        self.ledger.usage(run_id)
    }

    pub fn record_tokens(&self, run_id: &str, tokens: u64) -> BudgetUsage {
        self.ledger.record_tokens(run_id, tokens)
    }

    pub fn restore_usage(&self, run_id: &str, usage: BudgetUsage) {
        self.ledger.restore(run_id, usage);
    }

    pub fn forget_usage(&self, run_id: &str) {
        self.ledger.forget(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ReadFileArgs;
    use crate::action::RemoteArgs;
    use crate::action::ShellExecArgs;
    use crate::action::WriteFileArgs;
    use crate::policy::PolicyTexts;
    use crate::policy::compile;
    use crate::scope::OUTSIDE_WORKSPACE;
    use pretty_assertions::assert_eq;

    const PATHS: &str = "roots:\n  workspace: \".\"\nconfine_to: workspace\nallowed_globs: [\"docs/**\"]\ndenied_globs: [\"docs/private/**\"]\n";

    fn policy(dir: &std::path::Path, tools: &str, network: &str) -> Policy {
        let texts = PolicyTexts {
            paths: PATHS.into(),
            tools: tools.into(),
            network: network.into(),
        };
        compile(&texts, dir, 1).unwrap()
    }

    fn read(path: &str) -> ActionRequest {
        ActionRequest::new("r1", Action::ReadFile(ReadFileArgs { path: path.into() }))
    }

    fn shell(command: &str) -> ActionRequest {
        ActionRequest::new(
            "r1",
            Action::ShellExec(ShellExecArgs {
                command: command.into(),
                cwd: None,
            }),
        )
    }

    #[test]
    fn test_docs_glob_allows_and_escape_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "{}", "{}");
        let ctx = EvaluationContext::default();

        let decision = evaluate(&read("docs/readme.md"), &policy, &ctx);
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.rule, "paths.allowed_globs[docs/**]");

        let decision = evaluate(&read("../secrets.txt"), &policy, &ctx);
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.reason, OUTSIDE_WORKSPACE);
        assert_eq!(decision.policy_version, 1);
    }

    #[test]
    fn test_deny_glob_beats_allow_glob() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "{}", "{}");
        let req = ActionRequest::new(
            "r1",
            Action::WriteFile(WriteFileArgs {
                path: "docs/private/key.txt".into(),
                content: String::new(),
            }),
        );
        let decision = evaluate(&req, &policy, &EvaluationContext::default());
        assert_eq!(decision.rule, "paths.denied_globs[docs/private/**]");
    }

    #[test]
    fn test_path_outside_allow_list_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "{}", "{}");
        let decision = evaluate(&read("src/main.rs"), &policy, &EvaluationContext::default());
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.rule, "paths.allowed_globs");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("docs/link")).unwrap();

        let policy = policy(dir.path(), "{}", "{}");
        let decision = evaluate(&read("docs/link/secret.txt"), &policy, &EvaluationContext::default());
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.reason, OUTSIDE_WORKSPACE);
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", dir.path().join("docs/dangling")).unwrap();
        let policy = policy(dir.path(), "{}", "{}");
        let decision = evaluate(&read("docs/dangling"), &policy, &EvaluationContext::default());
        assert_eq!(decision.verdict, Verdict::Deny);
    }

    #[test]
    fn test_git_status_allowed_git_push_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "allowed_commands: [\"git status\"]\n", "{}");
        let ctx = EvaluationContext::default();

        assert!(evaluate(&shell("git status"), &policy, &ctx).is_allowed());
        let decision = evaluate(&shell("git push"), &policy, &ctx);
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.rule, "commands.allowed_commands");
    }

    #[test]
    fn test_extra_commands_extend_never_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "allowed_commands: [ls]\n", "{}");
        let ctx = EvaluationContext {
            extra_commands: CommandOverrides::Fixed(vec!["cargo test".into()]).resolve(),
            ..Default::default()
        };
        assert!(evaluate(&shell("ls -la"), &policy, &ctx).is_allowed());
        assert!(evaluate(&shell("cargo test --all"), &policy, &ctx).is_allowed());
        assert!(!evaluate(&shell("cargo publish"), &policy, &ctx).is_allowed());
    }

    #[test]
    fn test_env_overrides_extend_allow_list() {
        const VAR: &str = "TOOLGATE_TEST_GUARDRAIL_EXTRA_COMMANDS";
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var(VAR, " cargo test, ,make lint ") };
        let dir = tempfile::tempdir().unwrap();
        let texts = PolicyTexts {
            paths: PATHS.into(),
            tools: "allowed_commands: [ls]\n".into(),
            network: "{}".into(),
        };
        let store = Arc::new(PolicyStore::from_texts(texts, dir.path()).unwrap());
        let engine = GuardrailEngine::new(store, CommandOverrides::Env(VAR.into()));

        assert!(engine.check(&shell("cargo test --all"), None).is_allowed());
        assert!(engine.check(&shell("make lint"), None).is_allowed());
        assert!(engine.check(&shell("ls -la"), None).is_allowed());
        assert!(!engine.check(&shell("cargo publish"), None).is_allowed());

        // SAFETY: as above.
        unsafe { std::env::remove_var(VAR) };
        assert!(!engine.check(&shell("make lint"), None).is_allowed());
        assert!(engine.check(&shell("ls"), None).is_allowed());
    }

    #[test]
    fn test_command_list_skips_blank_entries() {
        let parsed = parse_command_list("git status,, ls ,");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_url_argument_needs_network() {
        let dir = tempfile::tempdir().unwrap();
        let policy_closed = policy(dir.path(), "allowed_commands: [curl]\n", "allow_net: false\n");
        let decision = evaluate(
            &shell("curl https://example.com"),
            &policy_closed,
            &EvaluationContext::default(),
        );
        assert_eq!(decision.rule, "network.allow_net");

        let policy_open = policy(
            dir.path(),
            "allowed_commands: [curl]\n",
            "allow_net: true\nallowed_hosts: [example.com]\n",
        );
        assert!(
            evaluate(&shell("curl https://example.com"), &policy_open, &EvaluationContext::default())
                .is_allowed()
        );
        assert!(
            !evaluate(&shell("curl https://other.com"), &policy_open, &EvaluationContext::default())
                .is_allowed()
        );
    }

    #[test]
    fn test_remote_host_goes_through_network_rule() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "{}", "allow_net: true\nallowed_hosts: [api.example.com]\n");
        let req = ActionRequest::new(
            "r1",
            Action::Remote(RemoteArgs {
                endpoint: "search".into(),
                operation: "query".into(),
                payload: serde_json::Value::Null,
            }),
        );
        let ok = EvaluationContext {
            remote_host: Some("api.example.com".into()),
            ..Default::default()
        };
        assert!(evaluate(&req, &policy, &ok).is_allowed());
        let bad = EvaluationContext {
            remote_host: Some("evil.example.net".into()),
            ..Default::default()
        };
        assert!(!evaluate(&req, &policy, &bad).is_allowed());
        // Local (stdio) endpoints have no host to check.
        assert!(evaluate(&req, &policy, &EvaluationContext::default()).is_allowed());
    }

    #[test]
    fn test_tool_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "allowed_tools: [read_file]\n", "{}");
        let decision = evaluate(&shell("ls"), &policy, &EvaluationContext::default());
        assert_eq!(decision.rule, "tools.allowed_tools[shell_exec]");
    }

    #[test]
    fn test_budget_in_pure_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), "budgets:\n  max_tool_calls: 2\n", "{}");
        let ctx = EvaluationContext {
            usage: BudgetUsage {
                tool_calls: 2,
                tokens: 0,
            },
            ..Default::default()
        };
        let decision = evaluate(&read("docs/a.md"), &policy, &ctx);
        assert_eq!(decision.rule, "budgets.max_tool_calls");
    }

    #[test]
    fn test_engine_charges_only_allowed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let texts = PolicyTexts {
            paths: PATHS.into(),
            tools: "budgets:\n  max_tool_calls: 1\n".into(),
            network: "{}".into(),
        };
        let store = Arc::new(PolicyStore::from_texts(texts, dir.path()).unwrap());
        let engine = GuardrailEngine::new(store, CommandOverrides::None);

        assert!(!engine.check(&read("../x"), None).is_allowed());
        assert_eq!(engine.usage("r1").tool_calls, 0);
        assert!(engine.check(&read("docs/a.md"), None).is_allowed());
        let denied = engine.check(&read("docs/a.md"), None);
        assert_eq!(denied.rule, "budgets.max_tool_calls");
    }

    #[test]
    fn test_decision_display() {
        let decision = Decision {
            verdict: Verdict::Deny,
            rule: "paths.confine_to".into(),
            reason: OUTSIDE_WORKSPACE.into(),
            policy_version: 4,
        };
        assert_eq!(
            decision.to_string(),
            "deny by paths.confine_to (policy v4): path outside workspace"
        );
    }
}
