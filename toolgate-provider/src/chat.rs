//! Chat Completions wire types used for capability probes and for reading
//! tool calls out of backend responses. Data only; no IO.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use toolgate_security::Action;
use toolgate_security::ActionError;
use toolgate_security::ToolKind;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// A non-streaming Chat Completions request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    /// One of `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
        }
    }
}

/// A tool call emitted by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: ChatFunction,
}

/// Function name plus JSON-encoded arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: ChatToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ChatTool {
    /// A tool that takes no arguments and is never meant to be called.
    pub fn noop() -> Self {
        Self {
            tool_type: function_type(),
            function: ChatToolFunction {
                name: "noop".into(),
                description: "Does nothing. Do not call.".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
        }
    }
}

fn function_type() -> String {
    "function".to_string()
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl ChatCompletion {
    /// Text of the first choice, if any.
    pub fn text(&self) -> Option<&str> {
        self.choices.first().and_then(|choice| choice.message.content.as_deref())
    }

    /// Tool calls of the first choice.
    pub fn tool_calls(&self) -> &[ChatToolCall] {
        self.choices
            .first()
            .and_then(|choice| choice.message.tool_calls.as_deref())
            .unwrap_or_default()
    }
}

impl ChatToolCall {
    /// Convert into a gateway action. Names outside the closed tool set and
    /// arguments that do not fit the tool's schema are rejected.
    pub fn to_action(&self) -> Result<Action, ActionError> {
        let kind: ToolKind = self.function.name.parse().map_err(ActionError::Malformed)?;
        if kind == ToolKind::WorkspaceStatus {
            return Ok(Action::WorkspaceStatus);
        }
        let args: Value = if self.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.function.arguments)
                .map_err(|err| ActionError::Malformed(format!("tool call arguments: {err}")))?
        };
        serde_json::from_value(serde_json::json!({ "tool": kind, "args": args }))
            .map_err(|err| ActionError::Malformed(err.to_string()))
    }
}
