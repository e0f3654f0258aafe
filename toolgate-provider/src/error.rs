use std::time::Duration;

use toolgate_security::Decision;

/// Why a transport exchange failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Could not connect, or the exchange timed out.
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The remote side asked us to slow down.
    #[error("remote rate limit")]
    RateLimited { retry_after: Option<Duration> },
    /// 408/5xx and similar; the endpoint may recover.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The endpoint answered and rejected the operation.
    #[error("{0}")]
    Tool(String),
}

impl TransportError {
    /// Counts toward opening the circuit.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Auth(_) | Self::Transient(_)
        )
    }
}

/// Outcome of a remote invocation that produced no result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("denied: {0}")]
    Denied(Decision),
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),
    #[error("endpoint `{0}` is disabled or retired")]
    Unavailable(String),
    #[error("endpoint `{endpoint}` is unreachable: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("endpoint `{endpoint}` rate limit reached; retry in {retry_after:?}")]
    RateLimited {
        endpoint: String,
        retry_after: Duration,
    },
    #[error("circuit open for endpoint `{endpoint}`; retry in {retry_after:?}")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },
    #[error("endpoint `{endpoint}` failed: {message}")]
    Tool {
        endpoint: String,
        message: String,
        transient: bool,
    },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Tool { transient: true, .. }
        )
    }

    pub(crate) fn from_transport(endpoint: &str, err: TransportError) -> Self {
        let endpoint = endpoint.to_string();
        match err {
            TransportError::Unreachable(message) => Self::Unreachable { endpoint, message },
            TransportError::RateLimited { retry_after } => Self::RateLimited {
                endpoint,
                retry_after: retry_after.unwrap_or_default(),
            },
            TransportError::Transient(message) => Self::Tool {
                endpoint,
                message,
                transient: true,
            },
            TransportError::Auth(message) => Self::Tool {
                endpoint,
                message: format!("authentication failed: {message}"),
                transient: false,
            },
            TransportError::Tool(message) => Self::Tool {
                endpoint,
                message,
                transient: false,
            },
        }
    }
}

/// Configuration and setup errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
