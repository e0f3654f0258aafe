//! Line-delimited JSON pipe between the reasoning loop and the gateway.
//!
//! Each input line is one request:
//!
//! ```text
//! {"id": 7, "method": "execute", "params": {"run_id": "r1", "action": {...}}}
//! ```
//!
//! and produces exactly one output line carrying the same `id`, either
//! `{"id": 7, "ok": true, "result": ...}` or
//! `{"id": 7, "ok": false, "error": {"error": "<kind>", "message": ...}}`.
//! Requests run concurrently, so responses may arrive out of order.
//!
//! `reload_policy` changes what the loop on the other end is allowed to do,
//! so it must carry the admin token.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolgate_core::Gateway;
use toolgate_core::GatewayError;
use toolgate_persist::PendingOutput;
use toolgate_security::ActionRequest;
use toolgate_security::PolicyDocument;
use tracing::debug;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PipeCall {
    Execute(ActionRequest),
    /// Interpret a raw backend response and run whatever it asks for.
    BackendTurn {
        run_id: String,
        #[serde(default)]
        step_index: Option<u64>,
        body: String,
    },
    /// A failed backend request; may trigger renegotiation.
    BackendError { status: u16, body: String },
    CompleteStep {
        run_id: String,
        step_index: u64,
        #[serde(default)]
        pending_outputs: Vec<PendingOutput>,
    },
    Acknowledge { run_id: String, output_id: String },
    Resume { run_id: String },
    RecordTokens { run_id: String, tokens: u64 },
    Cancel { run_id: String },
    /// Without a document, reload the whole bundle from disk.
    ReloadPolicy {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        document: Option<PolicyDocument>,
        #[serde(default)]
        text: Option<String>,
    },
    Health,
    Negotiate,
}

pub async fn dispatch(gateway: &Gateway, call: PipeCall) -> Result<Value, GatewayError> {
    let result = match call {
        PipeCall::Execute(request) => to_value(gateway.execute(request).await?),
        PipeCall::BackendTurn {
            run_id,
            step_index,
            body,
        } => gateway.execute_backend_turn(&run_id, step_index, &body).await?,
        PipeCall::BackendError { status, body } => {
            let renegotiated = gateway.backend_error(status, &body).await;
            json!({
                "renegotiated": renegotiated.is_some(),
                "capability": to_value(gateway.capabilities().as_ref()),
            })
        }
        PipeCall::CompleteStep {
            run_id,
            step_index,
            pending_outputs,
        } => to_value(gateway.complete_step(&run_id, step_index, pending_outputs)?),
        PipeCall::Acknowledge { run_id, output_id } => {
            to_value(gateway.acknowledge_output(&run_id, &output_id)?)
        }
        PipeCall::Resume { run_id } => to_value(gateway.resume(&run_id)?),
        PipeCall::RecordTokens { run_id, tokens } => {
            to_value(gateway.record_tokens(&run_id, tokens))
        }
        PipeCall::Cancel { run_id } => json!({ "cancelled": gateway.cancel_run(&run_id) }),
        PipeCall::ReloadPolicy {
            token,
            document,
            text,
        } => {
            gateway.authorize_admin(token.as_deref())?;
            let outcome = match (document, text) {
                (Some(document), Some(text)) => gateway.reload_policy_document(document, text)?,
                (Some(document), None) => {
                    return Err(GatewayError::Malformed(toolgate_security::ActionError::Invalid {
                        field: "text",
                        message: format!("replacing {document} needs its text"),
                    }));
                }
                (None, _) => gateway.reload_policy("pipe")?,
            };
            json!({ "previous_version": outcome.previous_version, "version": outcome.version })
        }
        PipeCall::Health => to_value(gateway.health()),
        PipeCall::Negotiate => to_value(gateway.negotiate().await.as_ref()),
    };
    Ok(result)
}

/// Answer one request line.
pub async fn handle_line(gateway: &Gateway, line: &str) -> Value {
    let raw: Value = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(err) => return failure(Value::Null, malformed(err.to_string())),
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let call = match serde_json::from_value::<PipeCall>(raw) {
        Ok(call) => call,
        Err(err) => return failure(id, malformed(err.to_string())),
    };
    match dispatch(gateway, call).await {
        Ok(result) => json!({ "id": id, "ok": true, "result": result }),
        Err(err) => failure(id, err.to_json()),
    }
}

/// Serve requests from `input` until it ends or `cancel` fires. Requests
/// already running are allowed to finish and their responses are written.
pub async fn serve<R, W>(
    gateway: Arc<Gateway>,
    input: R,
    mut output: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let mut lines = input.lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("pipe cancelled; draining in-flight requests");
                break;
            }
            Some(response) = rx.recv() => write_line(&mut output, &response).await?,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let gateway = Arc::clone(&gateway);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = handle_line(&gateway, &line).await;
                        if tx.send(response).is_err() {
                            debug!("pipe closed before response was written");
                        }
                    });
                }
                None => {
                    debug!("pipe input closed");
                    break;
                }
            },
        }
    }
    drop(tx);
    while let Some(response) = rx.recv().await {
        write_line(&mut output, &response).await?;
    }
    output.flush().await?;
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, value: &Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn malformed(message: String) -> Value {
    json!({ "error": "malformed", "message": message })
}

fn failure(id: Value, error: Value) -> Value {
    json!({ "id": id, "ok": false, "error": error })
}
