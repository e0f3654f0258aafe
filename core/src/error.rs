use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use toolgate_persist::CheckpointError;
use toolgate_provider::RemoteError;
use toolgate_runtime::InvokeError;
use toolgate_security::ActionError;
use toolgate_security::Decision;
use toolgate_security::PolicyError;

/// Every way a gateway operation can end without a result. None of these
/// are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("denied by `{}`: {}", .0.rule, .0.reason)]
    GuardrailDenied(Decision),

    #[error("tool error: {message}")]
    ToolError {
        message: String,
        transient: bool,
        detail: Value,
    },

    #[error("timed out after {limit:?}")]
    Timeout { limit: Duration },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("endpoint `{endpoint}` circuit is open; retry in {retry_after:?}")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("endpoint `{endpoint}` rate limit reached; retry in {retry_after:?}")]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("policy invalid: {0}")]
    PolicyInvalid(#[from] PolicyError),

    #[error(transparent)]
    Malformed(#[from] ActionError),

    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    #[error("run `{0}` was cancelled")]
    Cancelled(String),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl GatewayError {
    /// Stable name used on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GuardrailDenied(_) => "guardrail_denied",
            Self::ToolError { .. } => "tool_error",
            Self::Timeout { .. } => "timeout",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::PolicyInvalid(_) => "policy_invalid",
            Self::Malformed(_) => "malformed",
            Self::UnknownEndpoint(_) => "unknown_endpoint",
            Self::Cancelled(_) => "cancelled",
            Self::Unauthorized(_) => "unauthorized",
            Self::Checkpoint(_) => "checkpoint",
        }
    }

    /// Worth retrying for idempotent actions. Denials and local refusals
    /// never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ToolError { transient: true, .. } | Self::BackendUnavailable(_)
        )
    }

    /// Structured form handed back to the reasoning loop.
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        let extra = match self {
            Self::GuardrailDenied(decision) => json!({
                "rule": decision.rule,
                "reason": decision.reason,
                "policy_version": decision.policy_version,
            }),
            Self::ToolError {
                detail, transient, ..
            } => json!({"detail": detail, "transient": transient}),
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                json!({"retry_after_ms": millis})
            }
            _ => Value::Null,
        };
        if let (Value::Object(body), Value::Object(extra)) = (&mut body, extra) {
            body.extend(extra);
        }
        body
    }
}

impl From<InvokeError> for GatewayError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Denied(decision) => Self::GuardrailDenied(decision),
            InvokeError::Tool {
                message,
                transient,
                detail,
            } => Self::ToolError {
                message,
                transient,
                detail,
            },
            InvokeError::Timeout { limit } => Self::Timeout { limit },
            InvokeError::NotLocal(endpoint) => Self::UnknownEndpoint(endpoint),
        }
    }
}

impl From<RemoteError> for GatewayError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Denied(decision) => Self::GuardrailDenied(decision),
            RemoteError::UnknownEndpoint(endpoint) => Self::UnknownEndpoint(endpoint),
            RemoteError::Unavailable(endpoint) => {
                Self::BackendUnavailable(format!("endpoint `{endpoint}` is disabled or retired"))
            }
            RemoteError::Unreachable { endpoint, message } => {
                Self::BackendUnavailable(format!("endpoint `{endpoint}`: {message}"))
            }
            RemoteError::RateLimited {
                endpoint,
                retry_after,
            } => Self::RateLimited {
                endpoint,
                retry_after,
            },
            RemoteError::CircuitOpen {
                endpoint,
                retry_after,
            } => Self::CircuitOpen {
                endpoint,
                retry_after,
            },
            RemoteError::Tool {
                endpoint,
                message,
                transient,
            } => Self::ToolError {
                message: format!("endpoint `{endpoint}`: {message}"),
                transient,
                detail: Value::Null,
            },
        }
    }
}
