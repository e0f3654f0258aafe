//! Endpoint configuration and the health report derived from it.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use toolgate_security::scope::url_host;

use crate::breaker::EndpointState;
use crate::error::ProviderError;

/// How a remote tool provider is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Request/response over HTTP.
    Http,
    /// Duplex streaming over a WebSocket.
    #[serde(alias = "ws")]
    Websocket,
    /// Local subprocess speaking JSON over stdin/stdout.
    Stdio,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Websocket => "websocket",
            Self::Stdio => "stdio",
        }
    }
}

/// One `[endpoints.<label>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub transport: TransportKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Name of the secret holding a bearer token.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_call_timeout", with = "duration_secs")]
    pub call_timeout: Duration,
    /// Operations that are safe to retry.
    #[serde(default)]
    pub idempotent_operations: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

impl EndpointConfig {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            url: Some(url.into()),
            command: None,
            args: Vec::new(),
            auth_token_env: None,
            rate_limit_per_minute: None,
            enabled: true,
            call_timeout: default_call_timeout(),
            idempotent_operations: Vec::new(),
        }
    }

    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Stdio,
            url: None,
            command: Some(command.into()),
            args,
            ..Self::http("")
        }
    }

    pub fn validate(&self, label: &str) -> Result<(), ProviderError> {
        let invalid =
            |message: &str| ProviderError::InvalidConfig(format!("endpoints.{label}: {message}"));
        if label.is_empty() {
            return Err(ProviderError::InvalidConfig(
                "endpoint label must not be empty".to_string(),
            ));
        }
        match self.transport {
            TransportKind::Http | TransportKind::Websocket => {
                let url = self.url.as_deref().ok_or_else(|| invalid("`url` is required"))?;
                let parsed =
                    url::Url::parse(url).map_err(|err| invalid(&format!("invalid url: {err}")))?;
                let expected: &[&str] = match self.transport {
                    TransportKind::Http => &["http", "https"],
                    _ => &["ws", "wss"],
                };
                if !expected.contains(&parsed.scheme()) {
                    return Err(invalid(&format!("unsupported scheme `{}`", parsed.scheme())));
                }
            }
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(invalid("`command` is required"));
                }
            }
        }
        if self.rate_limit_per_minute == Some(0) {
            return Err(invalid("`rate_limit_per_minute` must be at least 1"));
        }
        Ok(())
    }

    /// Network host the endpoint talks to; `None` for local subprocesses.
    pub fn host(&self) -> Option<String> {
        match self.transport {
            TransportKind::Stdio => None,
            _ => self.url.as_deref().and_then(url_host),
        }
    }

    /// URL or command line, for reports.
    pub fn target(&self) -> String {
        match (&self.url, &self.command) {
            (Some(url), _) => url.clone(),
            (None, Some(command)) if self.args.is_empty() => command.clone(),
            (None, Some(command)) => format!("{command} {}", self.args.join(" ")),
            (None, None) => "unknown".to_string(),
        }
    }

    pub fn is_idempotent(&self, operation: &str) -> bool {
        self.idempotent_operations.iter().any(|op| op == operation)
    }
}

/// One row of the endpoint health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub label: String,
    pub transport: TransportKind,
    pub target: String,
    /// Effective per-minute limit; `None` is unlimited.
    pub rate_limit_per_minute: Option<u32>,
    pub authenticated: bool,
    pub enabled: bool,
    pub retired: bool,
    pub state: EndpointState,
    pub reachable: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Durations written as (possibly fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(serde::de::Error::custom("durations must be a positive number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
