//! Chat payloads for the two backends.
//!
//! The local service speaks the `/api/chat` shape with the reply nested under
//! `message`; the cloud backend answers with `content` and `tool_calls` at the
//! top level. Both are normalized into [`ChatReply`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tether_core::{BackendMode, ConfigDocument};

use crate::backend::{BackendError, HttpRequest, HttpResponse};

/// Chat requests can run long on a cold local model.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", "assistant" or "tool"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: JsonValue,
}

impl ToolCall {
    /// Accepts `{function: {name, arguments}}` and flat `{name, arguments}`.
    /// Arguments sent as a JSON string are decoded when possible.
    fn from_value(value: &JsonValue) -> Option<Self> {
        let call = value.get("function").unwrap_or(value);
        let name = call.get("name")?.as_str()?.to_string();
        let arguments = match call.get("arguments") {
            Some(JsonValue::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.clone()))
            }
            Some(other) => other.clone(),
            None => JsonValue::Object(Default::default()),
        };
        Some(Self { name, arguments })
    }
}

/// Normalized assistant reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Backend that produced the reply
    pub backend: BackendMode,
}

/// Build the chat request for `mode`.
pub fn build_request(
    config: &ConfigDocument,
    mode: BackendMode,
    messages: &[ChatMessage],
    model: &str,
) -> HttpRequest {
    let request = match mode {
        BackendMode::Local => HttpRequest::post(
            format!("{}/api/chat", config.local_url),
            json!({ "model": model, "messages": messages, "stream": false }),
        ),
        BackendMode::Cloud => HttpRequest::post(
            format!("{}/v1/chat", config.cloud_url),
            json!({ "model": model, "messages": messages }),
        ),
    };
    request.with_timeout(CHAT_TIMEOUT)
}

/// Parse a chat response from `mode`.
pub fn parse_reply(mode: BackendMode, response: HttpResponse) -> Result<ChatReply, BackendError> {
    if !response.is_success() {
        return Err(BackendError::from_response(&response));
    }

    let body = match mode {
        BackendMode::Local => response
            .body
            .get("message")
            .ok_or_else(|| BackendError::Protocol("chat reply has no message".into()))?,
        BackendMode::Cloud => &response.body,
    };

    let content = body
        .get("content")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = body
        .get("tool_calls")
        .and_then(JsonValue::as_array)
        .map(|calls| calls.iter().filter_map(ToolCall::from_value).collect())
        .unwrap_or_default();

    Ok(ChatReply {
        content,
        tool_calls,
        backend: mode,
    })
}
