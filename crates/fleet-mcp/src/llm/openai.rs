//! OpenAI-compatible chat-completions client with function calling.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value as JsonValue, json};

use super::{ChatMessage, LlmClient, LlmReply, Role, ToolCall};
use crate::error::{FleetError, Result};
use crate::mcp::CallableFunctionSpec;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], functions: &[CallableFunctionSpec]) -> JsonValue {
        let messages: Vec<JsonValue> = messages.iter().map(message_json).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !functions.is_empty() {
            let tools: Vec<JsonValue> = functions
                .iter()
                .map(|f| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": f.name,
                            "description": f.description,
                            "parameters": f.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = JsonValue::Array(tools);
        }
        body
    }
}

fn message_json(m: &ChatMessage) -> JsonValue {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut v = json!({ "role": role, "content": m.content });
    if !m.tool_calls.is_empty() {
        v["tool_calls"] = m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() }
                })
            })
            .collect();
    }
    if let Some(id) = &m.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

/// Parse `choices[0].message`; tool-call arguments arrive as a JSON string.
fn parse_reply(resp: &JsonValue) -> Result<LlmReply> {
    let message = resp
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| FleetError::execution("LLM response has no choices"))?;
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(idx, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = match function.get("arguments") {
                        Some(JsonValue::String(raw)) if raw.trim().is_empty() => json!({}),
                        Some(JsonValue::String(raw)) => serde_json::from_str(raw)
                            .unwrap_or_else(|_| JsonValue::String(raw.clone())),
                        Some(other) => other.clone(),
                        None => json!({}),
                    };
                    let id = call
                        .get("id")
                        .and_then(|i| i.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", idx));
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmReply {
        content,
        tool_calls,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        functions: &[CallableFunctionSpec],
    ) -> Result<LlmReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(messages, functions);
        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            functions = functions.len(),
            "chat completion request"
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::execution(format!("transport: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FleetError::execution(format!(
                "LLM call failed ({}): {}",
                status, text
            )));
        }
        let json: JsonValue = resp
            .json()
            .await
            .map_err(|e| FleetError::execution(format!("LLM response decode failed: {}", e)))?;
        parse_reply(&json)
    }
}
