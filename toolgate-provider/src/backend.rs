use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::chat::ChatMessage;
use crate::chat::ChatRequest;
use crate::chat::ChatTool;

/// Identifies which wire protocol the reasoning backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    /// OpenAI Responses API.
    OpenAiResponses,
    /// Anthropic Messages API.
    AnthropicMessages,
    /// OpenAI Chat Completions (OpenRouter, LM Studio, vLLM, etc.).
    OpenAiChat,
}

impl WireProtocol {
    /// Path appended to the base URL for a probe request.
    pub fn probe_path(self) -> &'static str {
        match self {
            Self::OpenAiResponses => "responses",
            Self::AnthropicMessages => "messages",
            Self::OpenAiChat => "chat/completions",
        }
    }

    /// Smallest request that exercises tool definitions without producing
    /// side effects: one short prompt, one no-op tool, tool use disabled or
    /// token output capped.
    pub fn probe_body(self, model: &str) -> Value {
        match self {
            Self::OpenAiChat => {
                let request = ChatRequest {
                    model: model.to_string(),
                    messages: vec![ChatMessage::user("ping")],
                    tools: Some(vec![ChatTool::noop()]),
                    stream: false,
                    max_tokens: Some(1),
                    tool_choice: Some("none".into()),
                };
                serde_json::to_value(request).unwrap_or(Value::Null)
            }
            Self::OpenAiResponses => json!({
                "model": model,
                "input": "ping",
                "tools": [{
                    "type": "function",
                    "name": "noop",
                    "description": "Does nothing. Do not call.",
                    "parameters": {"type": "object", "properties": {}},
                }],
                "tool_choice": "none",
                "max_output_tokens": 16,
                "store": false,
            }),
            Self::AnthropicMessages => json!({
                "model": model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}],
                "tools": [{
                    "name": "noop",
                    "description": "Does nothing. Do not call.",
                    "input_schema": {"type": "object", "properties": {}},
                }],
            }),
        }
    }

    /// Whether a successful probe body looks like this protocol's reply.
    pub fn is_expected_reply(self, body: &Value) -> bool {
        let key = match self {
            Self::OpenAiResponses => "output",
            Self::AnthropicMessages => "content",
            Self::OpenAiChat => "choices",
        };
        body.get(key).and_then(Value::as_array).is_some()
    }
}

/// The `[backend]` section: where the reasoning backend lives and how to
/// negotiate with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the secret holding the API key.
    pub api_key_env: Option<String>,
    pub wire_protocol: WireProtocol,
    /// Skip probing and always run in fallback mode.
    pub force_fallback: bool,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub probe_timeout: Duration,
    #[serde(with = "crate::endpoint::duration_secs")]
    pub reprobe_interval: Duration,
    /// Capability-mismatch errors that trigger an early re-probe.
    pub mismatch_threshold: u32,
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".into(),
            model: "local-model".into(),
            api_key_env: Some("OPENAI_API_KEY".into()),
            wire_protocol: WireProtocol::OpenAiChat,
            force_fallback: false,
            probe_timeout: Duration::from_secs(10),
            reprobe_interval: Duration::from_secs(300),
            mismatch_threshold: 3,
            extra_headers: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_protocol_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&WireProtocol::OpenAiResponses).unwrap(),
            "\"open_ai_responses\""
        );
        assert_eq!(
            serde_json::to_string(&WireProtocol::OpenAiChat).unwrap(),
            "\"open_ai_chat\""
        );
    }

    #[test]
    fn test_chat_probe_disables_tool_use() {
        let body = WireProtocol::OpenAiChat.probe_body("m");
        assert_eq!(body["tool_choice"], "none");
        assert_eq!(body["max_tokens"], 1);
        assert_eq!(body["tools"][0]["function"]["name"], "noop");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_expected_reply_shapes() {
        assert!(WireProtocol::OpenAiChat.is_expected_reply(&json!({"choices": []})));
        assert!(!WireProtocol::OpenAiChat.is_expected_reply(&json!({"output": []})));
        assert!(WireProtocol::AnthropicMessages.is_expected_reply(&json!({"content": []})));
        assert!(!WireProtocol::OpenAiResponses.is_expected_reply(&json!("ok")));
    }

    #[test]
    fn test_backend_section_from_toml() {
        let config: BackendConfig = toml::from_str(
            "base_url = \"https://api.example.com/v1\"\nwire_protocol = \"open_ai_responses\"\nprobe_timeout = 3\n",
        )
        .unwrap();
        assert_eq!(config.wire_protocol, WireProtocol::OpenAiResponses);
        assert_eq!(config.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.mismatch_threshold, 3);
    }
}
