use std::time::Duration;

use toolgate_security::Decision;

/// Why a local tool call did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("denied: {0}")]
    Denied(Decision),
    /// The tool ran (or tried to) and failed. `detail` carries whatever
    /// output it produced.
    #[error("{message}")]
    Tool {
        message: String,
        transient: bool,
        detail: serde_json::Value,
    },
    #[error("timed out after {limit:?}")]
    Timeout { limit: Duration },
    #[error("`{0}` is not a local tool")]
    NotLocal(String),
}

impl InvokeError {
    pub(crate) fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            transient: false,
            detail: serde_json::Value::Null,
        }
    }

    pub(crate) fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        Self::Tool {
            message: format!("{context}: {err}"),
            transient: matches!(
                err.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            detail: serde_json::Value::Null,
        }
    }

    /// Worth retrying when the action is idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Tool { transient: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, InvokeError>;
