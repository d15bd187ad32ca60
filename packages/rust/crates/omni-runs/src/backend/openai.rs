//! Hosted backend: OpenAI-compatible chat completions (`tool_choice` forcing supported).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Message, MessageRole, ToolCall, ToolContract};

use super::{BackendClient, Completion, InvocationRequest, synthesize_call_id};

pub const DEFAULT_OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Connection and default sampling parameters, fixed at process start.
#[derive(Debug, Clone)]
pub struct OpenAiClientConfig {
    /// Full chat completions endpoint.
    pub inference_url: String,
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for OpenAiClientConfig {
    fn default() -> Self {
        Self {
            inference_url: DEFAULT_OPENAI_CHAT_URL.to_string(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default = "function_type")]
    typ: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON string of arguments.
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize)]
struct ToolDef<'a> {
    #[serde(rename = "type")]
    typ: &'static str,
    function: FunctionDef<'a>,
}

#[derive(Debug, Serialize)]
struct FunctionDef<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    parameters: &'a serde_json::Value,
}

/// Response: `choices[0].message`.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// HTTP client for OpenAI-compatible chat completions.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiClientConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn build_request<'a>(&self, request: &InvocationRequest<'a>) -> ChatCompletionRequest<'a> {
        let transcript: &'a [Message] = request.transcript;
        let messages = transcript.iter().map(wire_message).collect();
        let (tools, tool_choice) = match request.contract {
            Some(contract) => (
                Some(vec![tool_def(contract)]),
                Some(serde_json::json!({
                    "type": "function",
                    "function": { "name": contract.name }
                })),
            ),
            None => (None, None),
        };
        ChatCompletionRequest {
            model: request.model,
            messages,
            tools,
            tool_choice,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        }
    }
}

fn wire_message(message: &Message) -> WireMessage<'_> {
    let tool_calls: Vec<WireToolCall> = message
        .tool_calls
        .iter()
        .map(|call| WireToolCall {
            id: Some(call.id.clone()),
            typ: function_type(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        })
        .collect();
    let content = if message.content.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(message.content.as_str())
    };
    WireMessage {
        role: message.role.as_str(),
        content,
        tool_calls,
        tool_call_id: match message.role {
            MessageRole::Tool => message.tool_call_id.as_deref(),
            _ => None,
        },
    }
}

fn tool_def(contract: &ToolContract) -> ToolDef<'_> {
    ToolDef {
        typ: "function",
        function: FunctionDef {
            name: &contract.name,
            description: contract.description.as_deref(),
            parameters: &contract.schema,
        },
    }
}

fn decode_tool_calls(calls: Vec<WireToolCall>) -> Result<Vec<ToolCall>> {
    calls
        .into_iter()
        .map(|call| {
            let raw = call.function.arguments.trim();
            let arguments = if raw.is_empty() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(raw).with_context(|| {
                    format!(
                        "malformed arguments for tool call `{}`: {raw}",
                        call.function.name
                    )
                })?
            };
            Ok(ToolCall {
                id: call.id.unwrap_or_else(synthesize_call_id),
                name: call.function.name,
                arguments,
            })
        })
        .collect()
}

fn completion_from_message(
    message: AssistantMessage,
    contract: Option<&ToolContract>,
) -> Result<Completion> {
    let calls = decode_tool_calls(message.tool_calls.unwrap_or_default())?;
    if contract.is_some() || !calls.is_empty() {
        return Ok(Completion::ToolCalls(calls));
    }
    Ok(Completion::Text(message.content.unwrap_or_default()))
}

#[async_trait]
impl BackendClient for OpenAiClient {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Completion> {
        let body = self.build_request(&request);
        let mut req = self
            .client
            .post(&self.config.inference_url)
            .json(&body)
            .header("Content-Type", "application/json");
        if let Some(ref key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let res = req.send().await.with_context(|| {
            format!(
                "chat completions request to {} failed",
                self.config.inference_url
            )
        })?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("LLM API error {status}: {text}"));
        }
        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("LLM response parse error: {e}; body: {text}"))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("LLM response has no choices"))?;
        completion_from_message(choice.message, request.contract)
    }
}
