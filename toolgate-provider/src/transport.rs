//! Wire transports for remote tool providers.
//!
//! Every transport speaks the same envelope: a request carries
//! `{"tool": <operation>, "payload": <args>}` and a reply is either a bare
//! JSON value, `{"result": ...}` or `{"error": ...}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use toolgate_runtime::ExecutionLimits;
use toolgate_runtime::process;
use toolgate_runtime::process::ProcessError;
use tracing::debug;

use crate::endpoint::EndpointConfig;
use crate::endpoint::TransportKind;
use crate::error::ProviderError;
use crate::error::TransportError;
use crate::retry::ErrorClass;

const MAX_ERROR_BODY: usize = 512;

#[async_trait]
pub trait EndpointTransport: Send + Sync {
    /// Lightweight reachability and auth check. Must not invoke tools.
    async fn probe(&self) -> Result<(), TransportError>;

    async fn call(&self, operation: &str, payload: &Value) -> Result<Value, TransportError>;
}

/// Build the transport an endpoint's configuration asks for.
pub fn build_transport(
    config: &EndpointConfig,
    token: Option<String>,
) -> Result<Arc<dyn EndpointTransport>, ProviderError> {
    let missing = |field: &str| {
        ProviderError::InvalidConfig(format!(
            "`{field}` is required for {} endpoints",
            config.transport.as_str()
        ))
    };
    Ok(match config.transport {
        TransportKind::Http => Arc::new(HttpTransport::new(
            config.url.as_deref().ok_or_else(|| missing("url"))?,
            token,
            config.call_timeout,
        )?),
        TransportKind::Websocket => Arc::new(WebSocketTransport::new(
            config.url.as_deref().ok_or_else(|| missing("url"))?,
            token,
        )),
        TransportKind::Stdio => Arc::new(StdioTransport::new(
            config.command.clone().ok_or_else(|| missing("command"))?,
            config.args.clone(),
            config.call_timeout,
        )),
    })
}

fn envelope(operation: &str, payload: &Value) -> Value {
    json!({ "tool": operation, "payload": payload })
}

fn interpret_reply(reply: Value) -> Result<Value, TransportError> {
    match reply {
        Value::Object(mut map) => {
            if let Some(error) = map.remove("error").filter(|e| !e.is_null()) {
                let message = match error {
                    Value::String(text) => text,
                    Value::Object(ref obj) => obj
                        .get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| error.to_string(), str::to_string),
                    other => other.to_string(),
                };
                return Err(TransportError::Tool(message));
            }
            match map.remove("result") {
                Some(result) => Ok(result),
                None => Ok(Value::Object(map)),
            }
        }
        other => Ok(other),
    }
}

fn clip(body: &str) -> &str {
    let mut end = body.len().min(MAX_ERROR_BODY);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {}: {}", status.as_u16(), clip(&body));
        let class =
            ErrorClass::from_status_with_retry_after(status.as_u16(), retry_after.as_deref());
        Err(match class {
            ErrorClass::AuthError => TransportError::Auth(detail),
            ErrorClass::RateLimit { retry_after } => TransportError::RateLimited { retry_after },
            ErrorClass::Retryable { .. } => TransportError::Transient(detail),
            ErrorClass::Fatal => TransportError::Tool(detail),
        })
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        TransportError::Tool(format!("invalid response: {err}"))
    } else if err.is_timeout() || err.is_connect() || err.is_request() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Transient(err.to_string())
    }
}

#[async_trait]
impl EndpointTransport for HttpTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let request = self.authorize(self.client.get(format!("{}/health", self.base_url)));
        let response = request.send().await.map_err(classify_reqwest)?;
        Self::check_status(response).await.map(|_| ())
    }

    async fn call(&self, operation: &str, payload: &Value) -> Result<Value, TransportError> {
        let request = self
            .authorize(self.client.post(format!("{}/invoke", self.base_url)))
            .json(&envelope(operation, payload));
        let response = request.send().await.map_err(classify_reqwest)?;
        let response = Self::check_status(response).await?;
        let reply: Value = response.json().await.map_err(classify_reqwest)?;
        interpret_reply(reply)
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

impl WebSocketTransport {
    pub fn new(url: &str, token: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            token,
        }
    }

    async fn connect(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| {
                    TransportError::Auth("token is not a valid header value".to_string())
                })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| match err {
                WsError::Http(response) => match response.status().as_u16() {
                    code @ (401 | 403) => {
                        TransportError::Auth(format!("handshake rejected with HTTP {code}"))
                    }
                    code => {
                        TransportError::Unreachable(format!("handshake rejected with HTTP {code}"))
                    }
                },
                other => TransportError::Unreachable(other.to_string()),
            })?;
        Ok(stream)
    }
}

#[async_trait]
impl EndpointTransport for WebSocketTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let mut stream = self.connect().await?;
        if let Err(err) = stream.close(None).await {
            debug!(error = %err, "websocket probe close failed");
        }
        Ok(())
    }

    async fn call(&self, operation: &str, payload: &Value) -> Result<Value, TransportError> {
        let mut stream = self.connect().await?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut request = envelope(operation, payload);
        if let Value::Object(map) = &mut request {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        stream
            .send(Message::text(request.to_string()))
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;

        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|err| TransportError::Unreachable(err.to_string()))?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let reply: Value = serde_json::from_str(text.as_str())
                .map_err(|err| TransportError::Tool(format!("invalid reply: {err}")))?;
            // Frames for other requests on a shared socket are skipped.
            if reply.get("id").and_then(Value::as_str).is_some_and(|reply_id| reply_id != id) {
                continue;
            }
            if let Err(err) = stream.close(None).await {
                debug!(error = %err, "websocket close failed");
            }
            let reply = match reply {
                Value::Object(mut map) => {
                    map.remove("id");
                    Value::Object(map)
                }
                other => other,
            };
            return interpret_reply(reply);
        }
        Err(TransportError::Unreachable("connection closed before a reply arrived".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Stdio subprocess
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    limits: ExecutionLimits,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            args,
            limits: ExecutionLimits {
                timeout,
                spool: false,
                ..ExecutionLimits::default()
            },
        }
    }
}

#[async_trait]
impl EndpointTransport for StdioTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        which::which(&self.command)
            .map(|_| ())
            .map_err(|err| {
                TransportError::Unreachable(format!("`{}` not found: {err}", self.command))
            })
    }

    async fn call(&self, operation: &str, payload: &Value) -> Result<Value, TransportError> {
        let argv: Vec<String> = std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect();
        let input = envelope(operation, payload).to_string();
        let cwd = std::env::temp_dir();
        let output = process::run(&argv, &cwd, Some(input.as_bytes()), &self.limits)
            .await
            .map_err(|err| match err {
                ProcessError::Timeout { limit } => {
                    TransportError::Unreachable(format!("timed out after {limit:?}"))
                }
                other => TransportError::Unreachable(other.to_string()),
            })?;
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Tool(format!(
                "exited with {:?}: {}",
                output.exit_code,
                clip(stderr.trim())
            )));
        }
        let reply: Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| TransportError::Tool(format!("invalid reply on stdout: {err}")))?;
        interpret_reply(reply)
    }
}
