//! Supervised pool of remote tool providers.
//!
//! One record per configured endpoint holds its transport, breaker and rate
//! window. Each record sits behind its own mutex, which is never held across
//! network IO, so probes and invocations for different endpoints never wait
//! on each other and every state change for one endpoint is serialized.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolgate_security::Action;
use toolgate_security::ActionRequest;
use toolgate_security::AuditKind;
use toolgate_security::AuditLog;
use toolgate_security::AuditRecord;
use toolgate_security::CallOutcome;
use toolgate_security::GuardrailEngine;
use toolgate_security::MetricsRecorder;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::breaker::Admission;
use crate::breaker::Breaker;
use crate::breaker::BreakerConfig;
use crate::breaker::EndpointState;
use crate::breaker::Transition;
use crate::endpoint::EndpointConfig;
use crate::endpoint::EndpointHealth;
use crate::error::ProviderError;
use crate::error::RemoteError;
use crate::error::TransportError;
use crate::rate_limit::DEFAULT_WINDOW;
use crate::rate_limit::RateWindow;
use crate::transport::EndpointTransport;
use crate::transport::build_transport;

/// Looks up a secret (bearer token) by name.
pub type SecretResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builds the transport for an endpoint. Replaceable so tests can count
/// outbound calls.
pub type TransportFactory = Arc<
    dyn Fn(&EndpointConfig, Option<String>) -> Result<Arc<dyn EndpointTransport>, ProviderError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub breaker: BreakerConfig,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub probe_interval: Duration,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub probe_timeout: Duration,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub rate_window: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            rate_window: DEFAULT_WINDOW,
        }
    }
}

/// A successful remote invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteOutput {
    pub endpoint: String,
    pub operation: String,
    pub result: Value,
    pub rule: String,
    pub policy_version: u64,
    pub latency_ms: u64,
}

struct EndpointRecord {
    config: EndpointConfig,
    transport: Arc<dyn EndpointTransport>,
    authenticated: bool,
    retired: bool,
    breaker: Breaker,
    window: RateWindow,
    last_probe_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl EndpointRecord {
    fn active(&self) -> bool {
        self.config.enabled && !self.retired
    }
}

type Shared = Arc<Mutex<EndpointRecord>>;

fn lock(record: &Shared) -> std::sync::MutexGuard<'_, EndpointRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a half-open trial while its call is out. Dropped without an
/// outcome (the caller gave up on the future), it hands the trial back.
struct TrialGuard<'a> {
    record: &'a Shared,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(record: &'a Shared, trial: bool) -> Self {
        Self {
            record,
            armed: trial,
        }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.record).breaker.release_trial();
        }
    }
}

pub struct RemoteEndpointManager {
    engine: Arc<GuardrailEngine>,
    audit: Arc<AuditLog>,
    metrics: Option<Arc<MetricsRecorder>>,
    settings: ManagerSettings,
    secrets: SecretResolver,
    factory: TransportFactory,
    snapshot_path: Option<PathBuf>,
    records: RwLock<BTreeMap<String, Shared>>,
    probers: Mutex<HashSet<String>>,
}

impl RemoteEndpointManager {
    pub fn new(
        engine: Arc<GuardrailEngine>,
        audit: Arc<AuditLog>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            engine,
            audit,
            metrics: None,
            settings,
            secrets: Arc::new(|name: &str| std::env::var(name).ok()),
            factory: Arc::new(build_transport),
            snapshot_path: None,
            records: RwLock::new(BTreeMap::new()),
            probers: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_secrets(mut self, secrets: SecretResolver) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Where [`RemoteEndpointManager::write_snapshot`] writes.
    pub fn with_snapshot_path(mut self, path: &Path) -> Self {
        self.snapshot_path = Some(path.to_path_buf());
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Install a new endpoint table. Validation is all-or-nothing. New labels
    /// start `unknown`; labels whose configuration changed get a fresh
    /// record; labels no longer present are retired, never removed.
    pub fn configure(
        &self,
        endpoints: &BTreeMap<String, EndpointConfig>,
    ) -> Result<(), ProviderError> {
        for (label, config) in endpoints {
            config.validate(label)?;
        }
        let mut built = BTreeMap::new();
        {
            let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
            for (label, config) in endpoints {
                let unchanged = records
                    .get(label)
                    .is_some_and(|record| lock(record).config == *config);
                if unchanged {
                    continue;
                }
                let token = config
                    .auth_token_env
                    .as_deref()
                    .and_then(|name| (self.secrets)(name));
                let transport = (self.factory)(config, token.clone())?;
                built.insert(
                    label.clone(),
                    EndpointRecord {
                        config: config.clone(),
                        transport,
                        authenticated: token.is_some(),
                        retired: false,
                        breaker: Breaker::new(self.settings.breaker.clone()),
                        window: RateWindow::new(self.settings.rate_window),
                        last_probe_at: None,
                        last_failure_at: None,
                        last_error: None,
                    },
                );
            }
        }

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        for (label, record) in built {
            info!(
                endpoint = %label,
                transport = record.config.transport.as_str(),
                "endpoint configured"
            );
            records.insert(label, Arc::new(Mutex::new(record)));
        }
        for (label, record) in records.iter() {
            let mut record = lock(record);
            let present = endpoints.contains_key(label);
            if record.retired == present {
                record.retired = !present;
                self.audit.emit(AuditRecord::new(AuditKind::EndpointStateChanged).payload(json!({
                    "endpoint": label,
                    "retired": record.retired,
                    "state": record.breaker.state(),
                })));
                info!(endpoint = %label, retired = record.retired, "endpoint retirement changed");
            }
        }
        Ok(())
    }

    pub fn labels(&self) -> Vec<String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn record(&self, label: &str) -> Option<Shared> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned()
    }

    pub fn state(&self, label: &str) -> Option<EndpointState> {
        self.record(label).map(|record| lock(&record).breaker.state())
    }

    /// Whether `operation` on `label` may be retried after a transient error.
    pub fn is_idempotent(&self, label: &str, operation: &str) -> bool {
        self.record(label)
            .is_some_and(|record| lock(&record).config.is_idempotent(operation))
    }

    /// Check, admit and execute one remote action. Every outcome leaves one
    /// audit event in the run's stream.
    pub async fn invoke(&self, request: &ActionRequest) -> Result<RemoteOutput, RemoteError> {
        let Action::Remote(args) = &request.action else {
            return Err(RemoteError::UnknownEndpoint(request.action.kind().to_string()));
        };
        let label = args.endpoint.as_str();
        let metric = format!("remote:{label}");
        let started = Instant::now();

        let Some(record) = self.record(label) else {
            self.refused(
                request,
                None,
                "unknown_endpoint",
                &format!("no endpoint named `{label}`"),
                false,
            );
            return Err(RemoteError::UnknownEndpoint(label.to_string()));
        };
        let (host, transport, call_timeout) = {
            let record = lock(&record);
            if !record.active() {
                drop(record);
                self.refused(
                    request,
                    None,
                    "unavailable",
                    "endpoint is disabled or retired",
                    false,
                );
                return Err(RemoteError::Unavailable(label.to_string()));
            }
            (
                record.config.host(),
                Arc::clone(&record.transport),
                record.config.call_timeout,
            )
        };

        let policy = self.engine.policy();
        let decision = self.engine.check_against(&policy, request, host.as_deref());
        if !decision.is_allowed() {
            self.refused(
                request,
                Some(decision.policy_version),
                &decision.rule,
                &decision.reason,
                false,
            );
            self.record_metric(&metric, CallOutcome::Denied, Duration::ZERO);
            return Err(RemoteError::Denied(decision));
        }

        let trial = {
            let mut guard = lock(&record);
            let now = Instant::now();
            let (admission, transition) = guard.breaker.admit(now);
            if let Some(transition) = transition {
                self.transitioned(label, transition, &guard, "cool-down elapsed");
            }
            if let Admission::Refused { retry_after } = admission {
                drop(guard);
                self.refused(
                    request,
                    Some(policy.version),
                    "circuit_open",
                    "endpoint circuit is open",
                    true,
                );
                return Err(RemoteError::CircuitOpen {
                    endpoint: label.to_string(),
                    retry_after,
                });
            }
            let limit = policy
                .network
                .rate_limit_for(label)
                .or(guard.config.rate_limit_per_minute);
            if let Err(retry_after) = guard.window.try_acquire(now, limit) {
                if admission == Admission::Trial {
                    guard.breaker.release_trial();
                }
                drop(guard);
                self.refused(
                    request,
                    Some(policy.version),
                    "rate_limited",
                    "endpoint rate limit reached",
                    true,
                );
                return Err(RemoteError::RateLimited {
                    endpoint: label.to_string(),
                    retry_after,
                });
            }
            admission == Admission::Trial
        };

        debug!(
            run_id = %request.run_id,
            endpoint = %label,
            operation = %args.operation,
            trial,
            "invoking remote endpoint"
        );
        let trial = TrialGuard::new(&record, trial);
        let call = transport.call(&args.operation, &args.payload);
        let outcome = match tokio::time::timeout(call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Unreachable(format!(
                "timed out after {call_timeout:?}"
            ))),
        };
        trial.settle();
        let latency = started.elapsed();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.observe(label, &record, outcome.as_ref().map(|_| ()).map_err(Clone::clone));

        let audit_args = self.audit.redactor().redact_value(&args.payload);
        match outcome {
            Ok(result) => {
                self.audit.emit(
                    AuditRecord::new(AuditKind::RemoteCallCompleted)
                        .run(&request.run_id)
                        .policy_version(decision.policy_version)
                        .payload(json!({
                            "endpoint": label,
                            "operation": args.operation,
                            "args": audit_args,
                            "step_index": request.step_index,
                            "rule": decision.rule,
                            "latency_ms": latency_ms,
                        })),
                );
                self.record_metric(&metric, CallOutcome::Completed, latency);
                Ok(RemoteOutput {
                    endpoint: label.to_string(),
                    operation: args.operation.clone(),
                    result,
                    rule: decision.rule,
                    policy_version: decision.policy_version,
                    latency_ms,
                })
            }
            Err(err) => {
                warn!(
                    run_id = %request.run_id,
                    endpoint = %label,
                    error = %err,
                    "remote call failed"
                );
                self.audit.emit(
                    AuditRecord::new(AuditKind::RemoteCallFailed)
                        .run(&request.run_id)
                        .policy_version(decision.policy_version)
                        .payload(json!({
                            "endpoint": label,
                            "operation": args.operation,
                            "args": audit_args,
                            "step_index": request.step_index,
                            "rule": decision.rule,
                            "latency_ms": latency_ms,
                            "error": err.to_string(),
                        })),
                );
                self.record_metric(&metric, CallOutcome::Failed, latency);
                Err(RemoteError::from_transport(label, err))
            }
        }
    }

    /// Probe one endpoint. Open circuits are not contacted until their
    /// cool-down has elapsed; the first probe after that is the half-open
    /// trial. Returns the resulting state, or `None` for unknown labels.
    pub async fn probe_endpoint(&self, label: &str) -> Option<EndpointState> {
        let record = self.record(label)?;
        let (transport, trial) = {
            let mut guard = lock(&record);
            if !guard.active() {
                return Some(guard.breaker.state());
            }
            let (admission, transition) = guard.breaker.admit(Instant::now());
            if let Some(transition) = transition {
                self.transitioned(label, transition, &guard, "cool-down elapsed");
            }
            if matches!(admission, Admission::Refused { .. }) {
                return Some(guard.breaker.state());
            }
            (Arc::clone(&guard.transport), admission == Admission::Trial)
        };
        let trial = TrialGuard::new(&record, trial);
        let probed = tokio::time::timeout(self.settings.probe_timeout, transport.probe()).await;
        let outcome = match probed {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Unreachable(format!(
                "probe timed out after {:?}",
                self.settings.probe_timeout
            ))),
        };
        trial.settle();
        {
            let mut guard = lock(&record);
            guard.last_probe_at = Some(Utc::now());
        }
        Some(self.observe(label, &record, outcome))
    }

    /// Probe every active endpoint concurrently, then refresh the snapshot.
    pub async fn probe_all(&self) -> Vec<EndpointHealth> {
        let labels = self.labels();
        futures::future::join_all(labels.iter().map(|label| self.probe_endpoint(label))).await;
        if let Err(err) = self.write_snapshot() {
            warn!(error = %err, "failed to write endpoint snapshot");
        }
        self.health()
    }

    /// Start one prober task per endpoint that does not have one yet. Tasks
    /// stop when `cancel` fires or their endpoint is retired.
    pub fn spawn_probers(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut probers = self.probers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handles = Vec::new();
        for label in self.labels() {
            if !probers.insert(label.clone()) {
                continue;
            }
            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.settings.probe_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let retired = manager
                                .record(&label)
                                .is_none_or(|record| lock(&record).retired);
                            if retired {
                                break;
                            }
                            manager.probe_endpoint(&label).await;
                        }
                    }
                }
                manager
                    .probers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&label);
                debug!(endpoint = %label, "endpoint prober stopped");
            }));
        }
        handles
    }

    pub fn health(&self) -> Vec<EndpointHealth> {
        let policy = self.engine.policy();
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .iter()
            .map(|(label, record)| {
                let record = lock(record);
                let state = record.breaker.state();
                EndpointHealth {
                    label: label.clone(),
                    transport: record.config.transport,
                    target: record.config.target(),
                    rate_limit_per_minute: policy
                        .network
                        .rate_limit_for(label)
                        .or(record.config.rate_limit_per_minute),
                    authenticated: record.authenticated,
                    enabled: record.config.enabled,
                    retired: record.retired,
                    state,
                    reachable: record.active() && state.is_reachable(),
                    consecutive_failures: record.breaker.consecutive_failures(),
                    last_probe_at: record.last_probe_at,
                    last_failure_at: record.last_failure_at,
                    last_error: record.last_error.clone(),
                }
            })
            .collect()
    }

    /// Write the health report as JSON, replacing the previous snapshot
    /// atomically. `None` when no snapshot path is configured.
    pub fn write_snapshot(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(path) = &self.snapshot_path else {
            return Ok(None);
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(
            &mut tmp,
            &json!({
                "generated_at": Utc::now().to_rfc3339(),
                "endpoints": self.health(),
            }),
        )?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(Some(path.clone()))
    }

    /// Feed one outcome into the endpoint's breaker.
    fn observe(
        &self,
        label: &str,
        record: &Shared,
        outcome: Result<(), TransportError>,
    ) -> EndpointState {
        let mut guard = lock(record);
        let transition = match &outcome {
            Ok(()) => {
                guard.last_error = None;
                guard.breaker.record_success()
            }
            Err(err) if err.is_endpoint_failure() => {
                guard.last_error = Some(err.to_string());
                guard.last_failure_at = Some(Utc::now());
                guard.breaker.record_failure(Instant::now())
            }
            // The endpoint answered and asked us to back off.
            Err(TransportError::RateLimited { .. }) => {
                guard.breaker.release_trial();
                None
            }
            // The endpoint answered; the operation itself failed.
            Err(_) => guard.breaker.record_success(),
        };
        if let Some(transition) = transition {
            let reason = match &outcome {
                Ok(()) => "success".to_string(),
                Err(err) => err.to_string(),
            };
            self.transitioned(label, transition, &guard, &reason);
        }
        guard.breaker.state()
    }

    fn transitioned(
        &self,
        label: &str,
        transition: Transition,
        record: &EndpointRecord,
        reason: &str,
    ) {
        info!(
            endpoint = %label,
            from = %transition.from,
            to = %transition.to,
            failures = record.breaker.consecutive_failures(),
            "endpoint state changed"
        );
        self.audit.emit(AuditRecord::new(AuditKind::EndpointStateChanged).payload(json!({
            "endpoint": label,
            "from": transition.from,
            "to": transition.to,
            "consecutive_failures": record.breaker.consecutive_failures(),
            "reason": reason,
        })));
    }

    /// Audit a call that never went out. `charged` says whether the budget
    /// already counted it.
    fn refused(
        &self,
        request: &ActionRequest,
        policy_version: Option<u64>,
        rule: &str,
        reason: &str,
        charged: bool,
    ) {
        let (endpoint, operation) = match &request.action {
            Action::Remote(args) => (args.endpoint.as_str(), args.operation.as_str()),
            _ => ("", ""),
        };
        info!(run_id = %request.run_id, endpoint, rule, "remote call refused");
        let mut record = AuditRecord::new(AuditKind::RemoteCallRefused)
            .run(&request.run_id)
            .payload(json!({
                "endpoint": endpoint,
                "operation": operation,
                "step_index": request.step_index,
                "rule": rule,
                "reason": reason,
                "charged": charged,
            }));
        if let Some(version) = policy_version {
            record = record.policy_version(version);
        }
        self.audit.emit(record);
    }

    fn record_metric(&self, name: &str, outcome: CallOutcome, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call(name, outcome, latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use toolgate_security::CommandOverrides;
    use toolgate_security::PolicyStore;
    use toolgate_security::PolicyTexts;
    use toolgate_security::action::RemoteArgs;

    #[derive(Default)]
    struct Fake {
        probe_fails: AtomicBool,
        call_fails: AtomicBool,
        call_hangs: AtomicBool,
        probes: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EndpointTransport for Fake {
        async fn probe(&self) -> Result<(), TransportError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_fails.load(Ordering::SeqCst) {
                Err(TransportError::Unreachable("connection refused".into()))
            } else {
                Ok(())
            }
        }

        async fn call(&self, operation: &str, payload: &Value) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.call_hangs.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.call_fails.load(Ordering::SeqCst) {
                Err(TransportError::Transient("HTTP 503: busy".into()))
            } else {
                Ok(json!({"operation": operation, "echo": payload}))
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        fake: Arc<Fake>,
        audit: Arc<AuditLog>,
        manager: Arc<RemoteEndpointManager>,
    }

    const NETWORK: &str = "allow_net: true\nallowed_hosts: [\"tools.example\"]\nrate_limits:\n  limited: 1\n";

    fn harness(settings: ManagerSettings, network: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let texts = PolicyTexts {
            paths: "roots:\n  workspace: \".\"\nconfine_to: workspace\n".into(),
            tools: "{}".into(),
            network: network.into(),
        };
        let store = Arc::new(PolicyStore::from_texts(texts, dir.path()).unwrap());
        let engine = Arc::new(GuardrailEngine::new(store, CommandOverrides::None));
        let audit = Arc::new(AuditLog::in_memory());
        let fake = Arc::new(Fake::default());
        let shared = Arc::clone(&fake);
        let manager = RemoteEndpointManager::new(engine, Arc::clone(&audit), settings)
            .with_secrets(Arc::new(|name: &str| (name == "TOOLS_TOKEN").then(|| "tok".to_string())))
            .with_transport_factory(Arc::new(move |_: &EndpointConfig, _: Option<String>| {
                Ok::<_, ProviderError>(Arc::clone(&shared) as Arc<dyn EndpointTransport>)
            }))
            .with_snapshot_path(&dir.path().join("state/endpoints.json"));
        let mut endpoints = BTreeMap::new();
        let mut tools = EndpointConfig::http("https://tools.example/api");
        tools.auth_token_env = Some("TOOLS_TOKEN".into());
        tools.rate_limit_per_minute = Some(2);
        endpoints.insert("tools".to_string(), tools);
        endpoints.insert("limited".to_string(), EndpointConfig::http("https://tools.example/other"));
        endpoints.insert("elsewhere".to_string(), EndpointConfig::http("https://evil.example"));
        endpoints.insert("local".to_string(), EndpointConfig::stdio("tool-server", Vec::new()));
        manager.configure(&endpoints).unwrap();
        Harness {
            _dir: dir,
            fake,
            audit,
            manager: Arc::new(manager),
        }
    }

    fn remote(endpoint: &str) -> ActionRequest {
        ActionRequest::new(
            "r1",
            Action::Remote(RemoteArgs {
                endpoint: endpoint.into(),
                operation: "search".into(),
                payload: json!({"q": "x", "api_key": "sk-123"}),
            }),
        )
    }

    fn fast_breaker() -> ManagerSettings {
        ManagerSettings {
            breaker: BreakerConfig {
                base_cooldown: Duration::from_millis(50),
                jitter_ratio: 0.0,
                ..BreakerConfig::default()
            },
            ..ManagerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_invoke_success_is_audited_and_redacted() {
        let h = harness(ManagerSettings::default(), NETWORK);
        let output = h.manager.invoke(&remote("tools")).await.unwrap();
        assert_eq!(output.result["operation"], "search");
        assert_eq!(output.rule, "network.allowed_hosts[tools.example]");

        let events = h.audit.recent(Some("r1"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::RemoteCallCompleted);
        assert_eq!(events[0].payload["args"]["api_key"], "[REDACTED]");
        assert_eq!(h.manager.state("tools"), Some(EndpointState::Healthy));
    }

    #[tokio::test]
    async fn test_probe_failures_open_circuit_and_refuse_locally() {
        let h = harness(ManagerSettings::default(), NETWORK);
        h.fake.probe_fails.store(true, Ordering::SeqCst);
        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(h.manager.probe_endpoint("tools").await.unwrap());
        }
        assert_eq!(
            states,
            vec![EndpointState::Degraded, EndpointState::Degraded, EndpointState::CircuitOpen]
        );

        let err = h.manager.invoke(&remote("tools")).await.unwrap_err();
        assert!(matches!(err, RemoteError::CircuitOpen { .. }), "{err:?}");
        assert_eq!(h.fake.calls.load(Ordering::SeqCst), 0);

        // An open circuit is not probed again before its cool-down.
        h.manager.probe_endpoint("tools").await;
        assert_eq!(h.fake.probes.load(Ordering::SeqCst), 3);

        let refused = h.audit.recent(Some("r1"));
        assert_eq!(refused[0].kind, AuditKind::RemoteCallRefused);
        assert_eq!(refused[0].payload["rule"], "circuit_open");
    }

    #[tokio::test]
    async fn test_half_open_trial_recovers() {
        let h = harness(fast_breaker(), NETWORK);
        h.fake.call_fails.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            let err = h.manager.invoke(&remote("local")).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert_eq!(h.manager.state("local"), Some(EndpointState::CircuitOpen));

        tokio::time::sleep(Duration::from_millis(80)).await;
        h.fake.call_fails.store(false, Ordering::SeqCst);
        h.manager.invoke(&remote("local")).await.unwrap();
        assert_eq!(h.manager.state("local"), Some(EndpointState::Healthy));
    }

    #[tokio::test]
    async fn test_abandoned_trial_is_handed_back() {
        let h = harness(fast_breaker(), NETWORK);
        h.fake.call_fails.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            h.manager.invoke(&remote("local")).await.unwrap_err();
        }
        let health = h.manager.health();
        let local = health.iter().find(|row| row.label == "local").unwrap();
        assert!(local.last_failure_at.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        h.fake.call_fails.store(false, Ordering::SeqCst);
        h.fake.call_hangs.store(true, Ordering::SeqCst);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), h.manager.invoke(&remote("local"))).await;
        assert!(abandoned.is_err());
        assert_eq!(h.manager.state("local"), Some(EndpointState::HalfOpen));

        h.fake.call_hangs.store(false, Ordering::SeqCst);
        h.manager.invoke(&remote("local")).await.unwrap();
        assert_eq!(h.manager.state("local"), Some(EndpointState::Healthy));
        assert_eq!(h.fake.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_rate_limit_refuses_without_outbound_call() {
        let h = harness(ManagerSettings::default(), NETWORK);
        h.manager.invoke(&remote("tools")).await.unwrap();
        h.manager.invoke(&remote("tools")).await.unwrap();
        let err = h.manager.invoke(&remote("tools")).await.unwrap_err();
        assert!(matches!(err, RemoteError::RateLimited { .. }), "{err:?}");
        assert_eq!(h.fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_policy_rate_limit_overrides_endpoint_config() {
        let h = harness(ManagerSettings::default(), NETWORK);
        h.manager.invoke(&remote("limited")).await.unwrap();
        let err = h.manager.invoke(&remote("limited")).await.unwrap_err();
        assert!(matches!(err, RemoteError::RateLimited { .. }));
        let health = h.manager.health();
        let limited = health.iter().find(|row| row.label == "limited").unwrap();
        assert_eq!(limited.rate_limit_per_minute, Some(1));
    }

    #[tokio::test]
    async fn test_network_rule_denies_unlisted_host() {
        let h = harness(ManagerSettings::default(), NETWORK);
        let err = h.manager.invoke(&remote("elsewhere")).await.unwrap_err();
        match err {
            RemoteError::Denied(decision) => assert_eq!(decision.rule, "network.allowed_hosts"),
            other => panic!("expected Denied, got {other:?}"),
        }
        assert_eq!(h.fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_off_denies_http_but_not_stdio() {
        let h = harness(ManagerSettings::default(), "allow_net: false\n");
        assert!(matches!(
            h.manager.invoke(&remote("tools")).await,
            Err(RemoteError::Denied(_))
        ));
        h.manager.invoke(&remote("local")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_and_retired_endpoints() {
        let h = harness(ManagerSettings::default(), NETWORK);
        assert!(matches!(
            h.manager.invoke(&remote("nope")).await,
            Err(RemoteError::UnknownEndpoint(_))
        ));

        let mut endpoints = BTreeMap::new();
        endpoints.insert("local".to_string(), EndpointConfig::stdio("tool-server", Vec::new()));
        h.manager.configure(&endpoints).unwrap();
        assert!(matches!(
            h.manager.invoke(&remote("tools")).await,
            Err(RemoteError::Unavailable(_))
        ));
        let health = h.manager.health();
        assert_eq!(health.len(), 4);
        let tools = health.iter().find(|row| row.label == "tools").unwrap();
        assert!(tools.retired);
        assert!(tools.authenticated);
        assert!(!tools.reachable);
    }

    #[tokio::test]
    async fn test_probe_all_writes_snapshot() {
        let h = harness(ManagerSettings::default(), NETWORK);
        let health = h.manager.probe_all().await;
        assert!(health.iter().all(|row| row.state == EndpointState::Healthy));
        let path = h.manager.write_snapshot().unwrap().unwrap();
        let snapshot: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(snapshot["endpoints"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_probers_stop_on_cancel() {
        let settings = ManagerSettings {
            probe_interval: Duration::from_millis(10),
            ..ManagerSettings::default()
        };
        let h = harness(settings, NETWORK);
        let cancel = CancellationToken::new();
        let handles = h.manager.spawn_probers(&cancel);
        assert_eq!(handles.len(), 4);
        assert!(h.manager.spawn_probers(&cancel).is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(h.fake.probes.load(Ordering::SeqCst) >= 4);
    }
}
