//! Capability negotiation with the reasoning backend.
//!
//! The negotiator owns the cached [`CapabilityMap`]. It starts in fallback
//! mode and only moves to rich mode after a probe clearly succeeds; any
//! timeout, error or unexpected reply leaves it in fallback.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use toolgate_security::AuditKind;
use toolgate_security::AuditLog;
use toolgate_security::AuditRecord;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::BackendConfig;
use crate::backend::WireProtocol;
use crate::error::ProviderError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMode {
    /// Tool-calling loop: backend output may carry actions.
    Rich,
    /// Plain completions; backend output is advisory only.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySource {
    /// Nothing probed yet.
    Initial,
    Probe,
    /// Forced by configuration.
    Override,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMap {
    pub rich_tool_calling: bool,
    pub fallback_required: bool,
    pub probed_at: Option<DateTime<Utc>>,
    pub source: CapabilitySource,
    pub detail: String,
}

impl CapabilityMap {
    pub fn initial() -> Self {
        Self {
            rich_tool_calling: false,
            fallback_required: true,
            probed_at: None,
            source: CapabilitySource::Initial,
            detail: "not probed yet".to_string(),
        }
    }

    fn probed(rich: bool, source: CapabilitySource, detail: String) -> Self {
        Self {
            rich_tool_calling: rich,
            fallback_required: !rich,
            probed_at: Some(Utc::now()),
            source,
            detail,
        }
    }

    pub fn mode(&self) -> CapabilityMode {
        if self.rich_tool_calling && !self.fallback_required {
            CapabilityMode::Rich
        } else {
            CapabilityMode::Fallback
        }
    }
}

/// What a single probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Supported(String),
    /// The backend answered and rejected tool definitions.
    Unsupported(String),
    /// No usable answer.
    Failed(String),
}

#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self) -> ProbeVerdict;
}

/// Errors from a backend that suggest it does not understand tool calling.
pub fn is_capability_mismatch(status: u16, body: &str) -> bool {
    if !matches!(status, 400 | 404 | 405 | 422 | 501) {
        return false;
    }
    let body = body.to_ascii_lowercase();
    ["tool", "function", "not supported", "unsupported", "unrecognized"]
        .iter()
        .any(|needle| body.contains(needle))
}

/// Probes an HTTP backend with a minimal tool-bearing request.
pub struct HttpBackendProbe {
    client: reqwest::Client,
    config: BackendConfig,
    api_key: Option<String>,
}

impl HttpBackendProbe {
    pub fn new(config: BackendConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout)
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let protocol = self.config.wire_protocol;
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            protocol.probe_path()
        );
        let mut request = self
            .client
            .post(url)
            .json(&protocol.probe_body(&self.config.model));
        request = match (&self.api_key, protocol) {
            (Some(key), WireProtocol::AnthropicMessages) => request
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            (Some(key), _) => request.bearer_auth(key),
            (None, _) => request,
        };
        for (name, value) in &self.config.extra_headers {
            request = request.header(name, value);
        }
        request
    }
}

#[async_trait]
impl BackendProbe for HttpBackendProbe {
    async fn probe(&self) -> ProbeVerdict {
        let response = match self.request().send().await {
            Ok(response) => response,
            Err(err) => return ProbeVerdict::Failed(format!("probe request failed: {err}")),
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return if is_capability_mismatch(status.as_u16(), &body) {
                ProbeVerdict::Unsupported(format!(
                    "backend rejected tool definitions (HTTP {})",
                    status.as_u16()
                ))
            } else {
                ProbeVerdict::Failed(format!("probe returned HTTP {}", status.as_u16()))
            };
        }
        match response.json::<serde_json::Value>().await {
            Ok(body) if self.config.wire_protocol.is_expected_reply(&body) => {
                let path = self.config.wire_protocol.probe_path();
                ProbeVerdict::Supported(format!("{path} accepted tool definitions"))
            }
            Ok(_) => ProbeVerdict::Failed("probe reply has an unexpected shape".to_string()),
            Err(err) => ProbeVerdict::Failed(format!("probe reply is not JSON: {err}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    pub force_fallback: bool,
    pub probe_timeout: Duration,
    pub mismatch_threshold: u32,
}

impl From<&BackendConfig> for NegotiatorSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            force_fallback: config.force_fallback,
            probe_timeout: config.probe_timeout,
            mismatch_threshold: config.mismatch_threshold,
        }
    }
}

pub struct CapabilityNegotiator {
    probe: Arc<dyn BackendProbe>,
    settings: NegotiatorSettings,
    current: ArcSwap<CapabilityMap>,
    mismatches: AtomicU32,
    probing: tokio::sync::Mutex<()>,
    audit: Option<Arc<AuditLog>>,
}

impl CapabilityNegotiator {
    pub fn new(probe: Arc<dyn BackendProbe>, settings: NegotiatorSettings) -> Self {
        Self {
            probe,
            settings,
            current: ArcSwap::from_pointee(CapabilityMap::initial()),
            mismatches: AtomicU32::new(0),
            probing: tokio::sync::Mutex::new(()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn current(&self) -> Arc<CapabilityMap> {
        self.current.load_full()
    }

    pub fn mode(&self) -> CapabilityMode {
        self.current.load().mode()
    }

    /// Probe the backend and replace the cached map. Concurrent callers
    /// share one probe at a time.
    pub async fn probe(&self) -> Arc<CapabilityMap> {
        let _guard = self.probing.lock().await;
        let map = if self.settings.force_fallback {
            CapabilityMap::probed(
                false,
                CapabilitySource::Override,
                "fallback forced by configuration".to_string(),
            )
        } else {
            match tokio::time::timeout(self.settings.probe_timeout, self.probe.probe()).await {
                Ok(ProbeVerdict::Supported(detail)) => {
                    CapabilityMap::probed(true, CapabilitySource::Probe, detail)
                }
                Ok(ProbeVerdict::Unsupported(detail) | ProbeVerdict::Failed(detail)) => {
                    CapabilityMap::probed(false, CapabilitySource::Probe, detail)
                }
                Err(_) => CapabilityMap::probed(
                    false,
                    CapabilitySource::Probe,
                    format!("probe timed out after {:?}", self.settings.probe_timeout),
                ),
            }
        };
        self.mismatches.store(0, Ordering::SeqCst);
        let previous = self.current.swap(Arc::new(map.clone()));
        if previous.mode() != map.mode() {
            info!(mode = ?map.mode(), detail = %map.detail, "backend capability changed");
        } else {
            debug!(mode = ?map.mode(), detail = %map.detail, "backend capability probed");
        }
        if let Some(audit) = &self.audit {
            audit.emit(AuditRecord::new(AuditKind::CapabilityProbe).payload(json!({
                "mode": map.mode(),
                "rich_tool_calling": map.rich_tool_calling,
                "fallback_required": map.fallback_required,
                "source": map.source,
                "detail": map.detail,
            })));
        }
        self.current.load_full()
    }

    /// Note a backend error. Returns `true` once enough mismatch errors
    /// accumulated that the caller should re-probe.
    pub fn report_backend_error(&self, mismatch: bool) -> bool {
        if !mismatch {
            return false;
        }
        let seen = self.mismatches.fetch_add(1, Ordering::SeqCst) + 1;
        let due = seen >= self.settings.mismatch_threshold.max(1);
        if due {
            warn!(mismatches = seen, "repeated capability mismatch errors from backend");
        }
        due
    }

    /// Record an error and re-probe when the mismatch threshold is reached.
    pub async fn observe_backend_error(&self, mismatch: bool) -> Option<Arc<CapabilityMap>> {
        if self.report_backend_error(mismatch) {
            Some(self.probe().await)
        } else {
            None
        }
    }

    /// Re-probe every `interval` until `cancel` fires.
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup probes separately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    struct Scripted {
        verdict: ProbeVerdict,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendProbe for Scripted {
        async fn probe(&self) -> ProbeVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.verdict.clone()
        }
    }

    fn scripted(verdict: ProbeVerdict, delay: Duration) -> Arc<Scripted> {
        Arc::new(Scripted {
            verdict,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn settings() -> NegotiatorSettings {
        NegotiatorSettings {
            force_fallback: false,
            probe_timeout: Duration::from_millis(200),
            mismatch_threshold: 2,
        }
    }

    #[tokio::test]
    async fn test_starts_in_fallback() {
        let negotiator = CapabilityNegotiator::new(scripted(ProbeVerdict::Supported("ok".into()), Duration::ZERO), settings());
        assert_eq!(negotiator.mode(), CapabilityMode::Fallback);
        assert_eq!(negotiator.current().source, CapabilitySource::Initial);
    }

    #[tokio::test]
    async fn test_supported_probe_enables_rich_mode() {
        let audit = Arc::new(AuditLog::in_memory());
        let negotiator = CapabilityNegotiator::new(scripted(ProbeVerdict::Supported("ok".into()), Duration::ZERO), settings())
            .with_audit(Arc::clone(&audit));
        let map = negotiator.probe().await;
        assert!(map.rich_tool_calling);
        assert!(!map.fallback_required);
        assert!(map.probed_at.is_some());
        assert_eq!(negotiator.mode(), CapabilityMode::Rich);

        let events = audit.recent(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::CapabilityProbe);
        assert_eq!(events[0].payload["mode"], "rich");
    }

    #[tokio::test]
    async fn test_probe_timeout_means_fallback() {
        let negotiator = CapabilityNegotiator::new(scripted(ProbeVerdict::Supported("ok".into()), Duration::from_secs(5)), settings());
        let map = negotiator.probe().await;
        assert_eq!(map.mode(), CapabilityMode::Fallback);
        assert!(map.detail.contains("timed out"), "{}", map.detail);
    }

    #[tokio::test]
    async fn test_force_fallback_skips_probe() {
        let probe = scripted(ProbeVerdict::Supported("ok".into()), Duration::ZERO);
        let negotiator = CapabilityNegotiator::new(
            Arc::clone(&probe) as Arc<dyn BackendProbe>,
            NegotiatorSettings {
                force_fallback: true,
                ..settings()
            },
        );
        let map = negotiator.probe().await;
        assert_eq!(map.source, CapabilitySource::Override);
        assert_eq!(map.mode(), CapabilityMode::Fallback);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mismatch_threshold_triggers_reprobe() {
        let probe = scripted(ProbeVerdict::Unsupported("no tools".into()), Duration::ZERO);
        let negotiator = CapabilityNegotiator::new(Arc::clone(&probe) as Arc<dyn BackendProbe>, settings());
        assert!(negotiator.observe_backend_error(false).await.is_none());
        assert!(negotiator.observe_backend_error(true).await.is_none());
        let map = negotiator.observe_backend_error(true).await.unwrap();
        assert_eq!(map.mode(), CapabilityMode::Fallback);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        // Counter resets after a probe.
        assert!(!negotiator.report_backend_error(true));
    }

    #[test]
    fn test_mismatch_detection() {
        assert!(is_capability_mismatch(400, "{\"error\": \"tools are not supported by this model\"}"));
        assert!(is_capability_mismatch(404, "Unrecognized request URL"));
        assert!(!is_capability_mismatch(500, "tool crashed"));
        assert!(!is_capability_mismatch(400, "bad temperature"));
    }

    async fn http_probe(server: &MockServer, template: ResponseTemplate) -> ProbeVerdict {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(template)
            .mount(server)
            .await;
        let config = BackendConfig {
            base_url: format!("{}/v1", server.uri()),
            ..BackendConfig::default()
        };
        HttpBackendProbe::new(config, Some("key".into()))
            .unwrap()
            .probe()
            .await
    }

    #[tokio::test]
    async fn test_http_probe_supported() {
        let server = MockServer::start().await;
        let verdict = http_probe(
            &server,
            ResponseTemplate::new(200).set_body_json(json!({"choices": [{"message": {"role": "assistant", "content": ""}}]})),
        )
        .await;
        assert!(matches!(verdict, ProbeVerdict::Supported(_)), "{verdict:?}");
    }

    #[tokio::test]
    async fn test_http_probe_rejected_tools() {
        let server = MockServer::start().await;
        let verdict = http_probe(
            &server,
            ResponseTemplate::new(400).set_body_string("tools not supported"),
        )
        .await;
        assert!(matches!(verdict, ProbeVerdict::Unsupported(_)), "{verdict:?}");
    }

    #[tokio::test]
    async fn test_http_probe_ambiguous_reply() {
        let server = MockServer::start().await;
        let verdict = http_probe(&server, ResponseTemplate::new(200).set_body_string("<html>ok</html>")).await;
        assert!(matches!(verdict, ProbeVerdict::Failed(_)), "{verdict:?}");
    }
}
