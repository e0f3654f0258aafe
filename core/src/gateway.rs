//! The single entry point the reasoning loop talks to.
//!
//! [`Gateway`] owns one of each component and routes every action request
//! either to the local [`ToolInvoker`] or to the [`RemoteEndpointManager`].
//! Both enforce the guardrails and write the audit record; the gateway adds
//! run cancellation, retries for idempotent actions, checkpoints and the
//! capability gate on backend output.
//!
//! Per-run state (budget counters, cancellation) is rebuilt from the run's
//! audit stream and latest checkpoint the first time a process sees the run,
//! so a restarted gateway or a one-shot `exec` continues where the last one
//! stopped. Idle runs beyond [`DEFAULT_MAX_OPEN_RUNS`] are dropped from
//! memory and rebuilt the same way when they come back.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolgate_persist::Acknowledgement;
use toolgate_persist::Checkpoint;
use toolgate_persist::CheckpointError;
use toolgate_persist::CheckpointManager;
use toolgate_persist::JsonFileStore;
use toolgate_persist::PendingOutput;
use toolgate_persist::ResumePoint;
use toolgate_provider::BackendProbe;
use toolgate_provider::CapabilityMap;
use toolgate_provider::CapabilityMode;
use toolgate_provider::CapabilityNegotiator;
use toolgate_provider::ChatCompletion;
use toolgate_provider::ChatToolCall;
use toolgate_provider::EndpointHealth;
use toolgate_provider::HttpBackendProbe;
use toolgate_provider::NegotiatorSettings;
use toolgate_provider::RemoteEndpointManager;
use toolgate_provider::RemoteOutput;
use toolgate_provider::SecretResolver;
use toolgate_provider::TransportFactory;
use toolgate_provider::capability::is_capability_mismatch;
use toolgate_runtime::Spool;
use toolgate_runtime::StatusHook;
use toolgate_runtime::ToolInvoker;
use toolgate_runtime::ToolOutput;
use toolgate_security::Action;
use toolgate_security::ActionRequest;
use toolgate_security::AuditKind;
use toolgate_security::AuditLog;
use toolgate_security::AuditRecord;
use toolgate_security::BudgetUsage;
use toolgate_security::CommandOverrides;
use toolgate_security::GuardrailEngine;
use toolgate_security::MetricsRecorder;
use toolgate_security::PolicyDocument;
use toolgate_security::PolicyError;
use toolgate_security::PolicyStore;
use toolgate_security::ReloadOutcome;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::GatewayConfig;
use crate::config::Secrets;
use crate::error::GatewayError;

pub const DEFAULT_MAX_OPEN_RUNS: usize = 256;

/// What a successful action produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutput {
    Local(ToolOutput),
    Remote(RemoteOutput),
}

impl ExecutionOutput {
    pub fn content(&self) -> &Value {
        match self {
            Self::Local(output) => &output.content,
            Self::Remote(output) => &output.result,
        }
    }

    pub fn policy_version(&self) -> u64 {
        match self {
            Self::Local(output) => output.policy_version,
            Self::Remote(output) => output.policy_version,
        }
    }
}

/// How the gateway reads one backend response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendTurn {
    /// Text for the loop to read. Nothing is executed.
    Advisory { text: String },
    /// Actions the backend asked for, ready for [`Gateway::execute`].
    Actions { requests: Vec<ActionRequest> },
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ready: bool,
    pub policy_version: u64,
    pub capability: CapabilityMap,
    pub capability_mode: CapabilityMode,
    pub endpoints: Vec<EndpointHealth>,
}

/// Assembles a [`Gateway`] from configuration. Tests swap the backend probe
/// and the endpoint transports.
pub struct GatewayBuilder {
    config: GatewayConfig,
    secrets: Option<Secrets>,
    backend_probe: Option<Arc<dyn BackendProbe>>,
    transport_factory: Option<TransportFactory>,
    max_open_runs: usize,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            secrets: None,
            backend_probe: None,
            transport_factory: None,
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
        }
    }

    /// Runs kept in memory before idle ones are dropped.
    pub fn max_open_runs(mut self, max: usize) -> Self {
        self.max_open_runs = max.max(1);
        self
    }

    pub fn secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn backend_probe(mut self, probe: Arc<dyn BackendProbe>) -> Self {
        self.backend_probe = Some(probe);
        self
    }

    pub fn transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Fails only on startup errors: no usable policy bundle, an invalid
    /// endpoint table, or state that cannot be opened.
    pub fn build(self) -> anyhow::Result<Gateway> {
        let GatewayBuilder {
            config,
            secrets,
            backend_probe,
            transport_factory,
            max_open_runs,
        } = self;
        let secrets = Arc::new(match secrets {
            Some(secrets) => secrets,
            None => Secrets::load(config.secrets_file.as_deref()).context("loading secrets")?,
        });

        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("creating state directory {}", config.state_dir.display()))?;
        let workspace = dunce::canonicalize(&config.workspace)
            .with_context(|| {
                format!("workspace {} is not accessible", config.workspace.display())
            })?;
        let store = Arc::new(
            PolicyStore::load(&config.policy_dir, &workspace)
                .with_context(|| {
                    format!("loading policy bundle from {}", config.policy_dir.display())
                })?,
        );
        let overrides = config
            .command_override_env
            .clone()
            .map_or(CommandOverrides::None, CommandOverrides::Env);
        let engine = Arc::new(GuardrailEngine::new(Arc::clone(&store), overrides));
        let audit = Arc::new(AuditLog::open(&config.audit_dir()).context("opening audit log")?);
        let metrics = Arc::new(MetricsRecorder::persisted(&config.metrics_path()));

        let backend_probe: Arc<dyn BackendProbe> = match backend_probe {
            Some(probe) => probe,
            None => {
                let api_key = config
                    .backend
                    .api_key_env
                    .as_deref()
                    .and_then(|name| secrets.resolve(name));
                Arc::new(
                    HttpBackendProbe::new(config.backend.clone(), api_key)
                        .context("building backend client")?,
                )
            }
        };
        let negotiator = Arc::new(
            CapabilityNegotiator::new(backend_probe, NegotiatorSettings::from(&config.backend))
                .with_audit(Arc::clone(&audit)),
        );

        let resolver: SecretResolver = {
            let secrets = Arc::clone(&secrets);
            Arc::new(move |name: &str| secrets.resolve(name))
        };
        let mut endpoints = RemoteEndpointManager::new(
            Arc::clone(&engine),
            Arc::clone(&audit),
            config.manager_settings(),
        )
        .with_metrics(Arc::clone(&metrics))
        .with_secrets(resolver)
        .with_snapshot_path(&config.endpoints_snapshot_path());
        if let Some(factory) = transport_factory {
            endpoints = endpoints.with_transport_factory(factory);
        }
        endpoints
            .configure(&config.endpoints)
            .context("configuring remote endpoints")?;
        let endpoints = Arc::new(endpoints);

        let status_hook: StatusHook = {
            let negotiator = Arc::clone(&negotiator);
            let endpoints = Arc::clone(&endpoints);
            Arc::new(move || {
                let endpoints: Vec<Value> = endpoints
                    .health()
                    .into_iter()
                    .map(|row| {
                        json!({
                            "label": row.label,
                            "state": row.state,
                            "reachable": row.reachable,
                        })
                    })
                    .collect();
                json!({"capability_mode": negotiator.mode(), "endpoints": endpoints})
            })
        };
        let mut invoker = ToolInvoker::new(
            Arc::clone(&engine),
            Arc::clone(&audit),
            Arc::clone(&metrics),
            config.limits.clone(),
        )
        .with_status_hook(status_hook);
        if config.limits.spool {
            invoker = invoker.with_spool(Spool::new(config.spool_dir()));
        }

        let checkpoint_store = JsonFileStore::new(config.checkpoint_dir())
            .with_keep_revisions(config.checkpoints.keep_revisions);
        let checkpoints =
            CheckpointManager::new(Arc::new(checkpoint_store)).with_audit(Arc::clone(&audit));

        info!(
            workspace = %workspace.display(),
            policy_version = store.version(),
            endpoints = config.endpoints.len(),
            "gateway ready"
        );
        Ok(Gateway {
            config,
            workspace,
            secrets,
            store,
            engine,
            audit,
            metrics,
            invoker,
            endpoints,
            negotiator,
            checkpoints,
            runs: Mutex::new(RunTable::default()),
            max_open_runs,
            shutdown: CancellationToken::new(),
        })
    }
}

/// What the gateway holds in memory for one run.
struct RunSlot {
    cancel: CancellationToken,
    in_flight: usize,
    last_used: u64,
}

#[derive(Default)]
struct RunTable {
    slots: HashMap<String, RunSlot>,
    clock: u64,
}

/// Keeps a run in memory while one of its requests executes.
struct RunLease<'a> {
    gateway: &'a Gateway,
    run_id: String,
    cancel: CancellationToken,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        let mut table = self.gateway.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.slots.get_mut(&self.run_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    workspace: PathBuf,
    secrets: Arc<Secrets>,
    store: Arc<PolicyStore>,
    engine: Arc<GuardrailEngine>,
    audit: Arc<AuditLog>,
    metrics: Arc<MetricsRecorder>,
    invoker: ToolInvoker,
    endpoints: Arc<RemoteEndpointManager>,
    negotiator: Arc<CapabilityNegotiator>,
    checkpoints: CheckpointManager,
    runs: Mutex<RunTable>,
    max_open_runs: usize,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn open(config: GatewayConfig) -> anyhow::Result<Self> {
        GatewayBuilder::new(config).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn workspace(&self) -> &std::path::Path {
        &self.workspace
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn endpoints(&self) -> &Arc<RemoteEndpointManager> {
        &self.endpoints
    }

    pub fn policy_version(&self) -> u64 {
        self.store.version()
    }

    /// Check and execute one action. Idempotent actions that fail with a
    /// transient error are retried with backoff; denials never are.
    pub async fn execute(&self, request: ActionRequest) -> Result<ExecutionOutput, GatewayError> {
        request.validate()?;
        let lease = self.lease_run(&request.run_id);
        let cancel = lease.cancel.clone();
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled(request.run_id));
        }
        let idempotent = self.is_idempotent(&request.action);
        let mut attempt = 0;
        loop {
            let err = match self.dispatch(&request).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if !(idempotent && err.is_transient()) {
                return Err(err);
            }
            let Some(delay) = self.config.retry.next_delay(attempt, None) else {
                return Err(err);
            };
            attempt += 1;
            warn!(
                run_id = %request.run_id,
                tool = %request.action.kind(),
                attempt,
                ?delay,
                error = %err,
                "retrying idempotent action"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled(request.run_id)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dispatch(&self, request: &ActionRequest) -> Result<ExecutionOutput, GatewayError> {
        match &request.action {
            Action::Remote(_) => Ok(ExecutionOutput::Remote(self.endpoints.invoke(request).await?)),
            _ => Ok(ExecutionOutput::Local(self.invoker.invoke(request).await?)),
        }
    }

    fn is_idempotent(&self, action: &Action) -> bool {
        match action {
            Action::Remote(args) => self.endpoints.is_idempotent(&args.endpoint, &args.operation),
            other => other.is_idempotent(),
        }
    }

    /// Probe the backend now and return the fresh capability map.
    pub async fn negotiate(&self) -> Arc<CapabilityMap> {
        self.negotiator.probe().await
    }

    pub fn capabilities(&self) -> Arc<CapabilityMap> {
        self.negotiator.current()
    }

    /// Report a failed backend request. Enough capability-mismatch errors
    /// trigger an early re-probe, whose result is returned.
    pub async fn backend_error(&self, status: u16, body: &str) -> Option<Arc<CapabilityMap>> {
        self.negotiator
            .observe_backend_error(is_capability_mismatch(status, body))
            .await
    }

    /// Read a backend response. In fallback mode the text is advisory and
    /// nothing in it is parsed as an action.
    pub fn interpret_backend_response(
        &self,
        run_id: &str,
        step_index: Option<u64>,
        body: &str,
    ) -> Result<BackendTurn, GatewayError> {
        let completion: Option<ChatCompletion> = serde_json::from_str(body).ok();
        if let Some(usage) = completion.as_ref().and_then(|completion| completion.usage) {
            self.record_tokens(run_id, usage.total_tokens);
        }
        let text = match &completion {
            Some(completion) if !completion.choices.is_empty() => {
                completion.text().unwrap_or_default().to_string()
            }
            _ => body.to_string(),
        };

        if self.negotiator.mode() == CapabilityMode::Fallback {
            debug!(run_id, "fallback mode; backend output is advisory");
            return Ok(BackendTurn::Advisory { text });
        }

        let mut actions = completion
            .as_ref()
            .map(|completion| completion.tool_calls())
            .unwrap_or_default()
            .iter()
            .map(ChatToolCall::to_action)
            .collect::<Result<Vec<_>, _>>()?;
        if actions.is_empty() {
            if let Ok(action) = serde_json::from_str::<Action>(text.trim()) {
                actions.push(action);
            }
        }
        if actions.is_empty() {
            return Ok(BackendTurn::Advisory { text });
        }
        let requests = actions
            .into_iter()
            .map(|action| ActionRequest {
                run_id: run_id.to_string(),
                step_index,
                action,
            })
            .collect();
        Ok(BackendTurn::Actions { requests })
    }

    /// Interpret a backend response and execute whatever it asked for.
    /// Each result is reported in order; one failure does not stop the rest.
    pub async fn execute_backend_turn(
        &self,
        run_id: &str,
        step_index: Option<u64>,
        body: &str,
    ) -> Result<Value, GatewayError> {
        match self.interpret_backend_response(run_id, step_index, body)? {
            BackendTurn::Advisory { text } => Ok(json!({"kind": "advisory", "text": text})),
            BackendTurn::Actions { requests } => {
                let mut results = Vec::with_capacity(requests.len());
                for request in requests {
                    let result = match self.execute(request).await {
                        Ok(output) => serde_json::to_value(output).unwrap_or(Value::Null),
                        Err(err) => err.to_json(),
                    };
                    results.push(result);
                }
                Ok(json!({"kind": "executed", "results": results}))
            }
        }
    }

    /// Record a completed step so a restart resumes after it.
    pub fn complete_step(
        &self,
        run_id: &str,
        step_index: u64,
        pending_outputs: Vec<PendingOutput>,
    ) -> Result<Checkpoint, GatewayError> {
        let usage = self.usage(run_id);
        self.checkpoints
            .save(run_id, step_index, pending_outputs, usage)
            .map_err(GatewayError::from)
    }

    pub fn acknowledge_output(
        &self,
        run_id: &str,
        output_id: &str,
    ) -> Result<Acknowledgement, GatewayError> {
        self.checkpoints
            .acknowledge(run_id, output_id)
            .map_err(GatewayError::from)
    }

    /// Continue a run from its last checkpoint. Budget usage never drops
    /// below what the checkpoint recorded, and a cancelled run accepts steps
    /// again.
    pub fn resume(&self, run_id: &str) -> Result<ResumePoint, GatewayError> {
        let point = self.checkpoints.resume(run_id)?;
        self.with_run(run_id, |slot| {
            let usage = self.engine.usage(run_id).max(point.usage);
            self.engine.restore_usage(run_id, usage);
            if slot.cancel.is_cancelled() {
                slot.cancel = self.shutdown.child_token();
            }
        });
        self.audit.emit(
            AuditRecord::new(AuditKind::RunResumed)
                .run(run_id)
                .payload(json!({"step_index": point.step_index, "replay": point.replay.len()})),
        );
        info!(
            run_id,
            step_index = point.step_index,
            replay = point.replay.len(),
            "run resumed"
        );
        Ok(point)
    }

    pub fn usage(&self, run_id: &str) -> BudgetUsage {
        self.with_run(run_id, |_| self.engine.usage(run_id))
    }

    /// Add tokens the reasoning loop spent for a run.
    pub fn record_tokens(&self, run_id: &str, tokens: u64) -> BudgetUsage {
        self.metrics.record_tokens(run_id, tokens);
        let usage = self.with_run(run_id, |_| self.engine.record_tokens(run_id, tokens));
        self.audit.emit(
            AuditRecord::new(AuditKind::TokensRecorded)
                .run(run_id)
                .payload(json!({"tokens": tokens, "total": usage.tokens})),
        );
        usage
    }

    /// Stop a run between steps. Calls already executing finish or hit
    /// their timeout; only new steps and pending retries are refused. The
    /// cancellation is audited, so it outlives the process.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let newly = self.with_run(run_id, |slot| {
            let newly = !slot.cancel.is_cancelled();
            slot.cancel.cancel();
            newly
        });
        if newly {
            info!(run_id, "run cancelled");
            self.audit.emit(AuditRecord::new(AuditKind::RunCancelled).run(run_id));
        }
        newly
    }

    /// Runs currently held in memory.
    pub fn open_runs(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }

    fn lease_run(&self, run_id: &str) -> RunLease<'_> {
        let cancel = self.with_run(run_id, |slot| {
            slot.in_flight += 1;
            slot.cancel.clone()
        });
        RunLease {
            gateway: self,
            run_id: run_id.to_string(),
            cancel,
        }
    }

    /// Run `f` on the run's slot, restoring the run first if it is not in
    /// memory. Budget counters are only touched under this lock, so a run
    /// is never dropped between its restore and its use.
    fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut RunSlot) -> T) -> T {
        let mut table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        table.clock += 1;
        let now = table.clock;
        if !table.slots.contains_key(run_id) {
            self.evict_idle_runs(&mut table);
        }
        let slot = match table.slots.entry(run_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.restore_run(run_id)),
        };
        slot.last_used = now;
        f(slot)
    }

    /// Rebuild a run from durable state: usage from its audit stream and its
    /// latest checkpoint, cancellation from its last cancel or resume event.
    fn restore_run(&self, run_id: &str) -> RunSlot {
        let events = self.audit.events(Some(run_id)).unwrap_or_else(|err| {
            warn!(run_id, error = %err, "cannot read audit stream; run starts with no history");
            Vec::new()
        });
        let mut usage = BudgetUsage::from_events(&events);
        match self.checkpoints.load(run_id) {
            Ok(checkpoint) => usage = usage.max(checkpoint.usage),
            Err(CheckpointError::NotFound(_)) => {}
            Err(err) => warn!(run_id, error = %err, "cannot read checkpoint while restoring run"),
        }
        let cancelled = events
            .iter()
            .rev()
            .find_map(|event| match event.kind {
                AuditKind::RunCancelled => Some(true),
                AuditKind::RunResumed => Some(false),
                _ => None,
            })
            .unwrap_or(false);
        if usage != BudgetUsage::default() || cancelled {
            info!(
                run_id,
                tool_calls = usage.tool_calls,
                tokens = usage.tokens,
                cancelled,
                "run restored"
            );
        }
        self.engine.restore_usage(run_id, usage);
        let cancel = self.shutdown.child_token();
        if cancelled {
            cancel.cancel();
        }
        RunSlot {
            cancel,
            in_flight: 0,
            last_used: 0,
        }
    }

    /// Drop least recently used idle runs until there is room for one more.
    /// Only possible when the audit trail is on disk to rebuild them from.
    fn evict_idle_runs(&self, table: &mut RunTable) {
        if !self.audit.is_persistent() {
            return;
        }
        while table.slots.len() >= self.max_open_runs {
            let idle = table
                .slots
                .iter()
                .filter(|(_, slot)| slot.in_flight == 0)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(run_id, _)| run_id.clone());
            let Some(run_id) = idle else {
                break;
            };
            table.slots.remove(&run_id);
            self.engine.forget_usage(&run_id);
            self.audit.close_stream(Some(&run_id));
            debug!(run_id = %run_id, "idle run released");
        }
    }

    /// Check the token presented with an administrative request against the
    /// configured admin secret.
    pub fn authorize_admin(&self, token: Option<&str>) -> Result<(), GatewayError> {
        let expected = self
            .config
            .admin_token_env
            .as_deref()
            .and_then(|name| self.secrets.resolve(name))
            .ok_or(GatewayError::Unauthorized("no admin token is configured"))?;
        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => {
                warn!("administrative request with a missing or wrong token");
                Err(GatewayError::Unauthorized("admin token missing or wrong"))
            }
        }
    }

    /// Re-read the whole policy bundle.
    pub fn reload_policy(&self, trigger: &str) -> Result<ReloadOutcome, GatewayError> {
        let result = self.store.reload();
        self.record_reload(trigger, None, result)
    }

    /// Replace one policy document; the other two keep their current text.
    pub fn reload_policy_document(
        &self,
        document: PolicyDocument,
        text: String,
    ) -> Result<ReloadOutcome, GatewayError> {
        let result = self.store.reload_document(document, text);
        self.record_reload("document", Some(document), result)
    }

    fn record_reload(
        &self,
        trigger: &str,
        document: Option<PolicyDocument>,
        result: Result<ReloadOutcome, PolicyError>,
    ) -> Result<ReloadOutcome, GatewayError> {
        match result {
            Ok(outcome) => {
                self.audit.emit(
                    AuditRecord::new(AuditKind::PolicyReloaded)
                        .policy_version(outcome.version)
                        .payload(json!({
                            "trigger": trigger,
                            "document": document,
                            "previous_version": outcome.previous_version,
                            "version": outcome.version,
                        })),
                );
                Ok(outcome)
            }
            Err(err) => {
                let version = self.store.version();
                self.audit.emit(
                    AuditRecord::new(AuditKind::PolicyReloadFailed)
                        .policy_version(version)
                        .payload(json!({
                            "trigger": trigger,
                            "document": document,
                            "error": err.to_string(),
                        })),
                );
                Err(GatewayError::PolicyInvalid(err))
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        let capability = self.negotiator.current();
        HealthReport {
            ready: !self.shutdown.is_cancelled(),
            policy_version: self.store.version(),
            capability_mode: capability.mode(),
            capability: capability.as_ref().clone(),
            endpoints: self.endpoints.health(),
        }
    }

    /// Start endpoint probers, the capability refresh timer and the periodic
    /// snapshot writer. All stop on [`Gateway::shutdown`].
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.endpoints.spawn_probers(&self.shutdown);
        handles.push(
            Arc::clone(&self.negotiator)
                .spawn_refresh(self.config.backend.reprobe_interval, self.shutdown.child_token()),
        );

        let metrics = Arc::clone(&self.metrics);
        let endpoints = Arc::clone(&self.endpoints);
        let cancel = self.shutdown.child_token();
        let period = self.config.metrics.snapshot_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => write_snapshots(&metrics, &endpoints),
                }
            }
        }));
        handles
    }

    pub fn write_snapshots(&self) {
        write_snapshots(&self.metrics, &self.endpoints);
    }

    /// Stop background work and cancel every run, then flush snapshots.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.write_snapshots();
        info!("gateway stopped");
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn write_snapshots(metrics: &MetricsRecorder, endpoints: &RemoteEndpointManager) {
    if let Err(err) = metrics.write_snapshot() {
        warn!(error = %err, "failed to write metrics snapshot");
    }
    if let Err(err) = endpoints.write_snapshot() {
        warn!(error = %err, "failed to write endpoint snapshot");
    }
}
