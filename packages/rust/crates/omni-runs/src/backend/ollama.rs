//! Local backend: Ollama `/api/chat`.
//!
//! Ollama cannot force a named tool, so a contract is bound through the
//! `format` structured-output field and the JSON reply is lifted into a
//! single call named after the contract.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Message, ToolCall, ToolContract};

use super::{BackendClient, Completion, InvocationRequest, synthesize_call_id};

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Clone)]
pub struct OllamaClientConfig {
    /// Server base URL (without `/api/chat`).
    pub base_url: String,
    pub temperature: Option<f32>,
    pub num_predict: Option<i32>,
    pub timeout_secs: u64,
}

impl Default for OllamaClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            temperature: None,
            num_predict: None,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "OllamaOptions::is_empty")]
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

impl OllamaOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaReply,
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

/// HTTP client for an Ollama server.
pub struct OllamaClient {
    client: reqwest::Client,
    chat_url: String,
    config: OllamaClientConfig,
}

impl OllamaClient {
    pub fn new(config: OllamaClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        let chat_url = format!("{}/api/chat", config.base_url.trim_end_matches('/'));
        Self {
            client,
            chat_url,
            config,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    fn build_request<'a>(&self, request: &InvocationRequest<'a>) -> OllamaChatRequest<'a> {
        let transcript: &'a [Message] = request.transcript;
        OllamaChatRequest {
            model: request.model,
            messages: transcript.iter().map(ollama_message).collect(),
            stream: false,
            format: request.contract.map(|contract| &contract.schema),
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.num_predict,
            },
        }
    }
}

fn ollama_message(message: &Message) -> OllamaMessage<'_> {
    OllamaMessage {
        role: message.role.as_str(),
        content: &message.content,
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| OllamaToolCall {
                function: OllamaFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect(),
    }
}

fn completion_from_reply(reply: OllamaReply, contract: Option<&ToolContract>) -> Completion {
    let mut calls: Vec<ToolCall> = reply
        .tool_calls
        .into_iter()
        .map(|call| ToolCall {
            id: synthesize_call_id(),
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();
    let Some(contract) = contract else {
        if calls.is_empty() {
            return Completion::Text(reply.content);
        }
        return Completion::ToolCalls(calls);
    };
    if calls.is_empty() {
        // Structured output arrives as JSON content; anything else yields no call.
        if let Ok(arguments) = serde_json::from_str::<serde_json::Value>(reply.content.trim())
            && arguments.is_object()
        {
            calls.push(ToolCall {
                id: synthesize_call_id(),
                name: contract.name.clone(),
                arguments,
            });
        }
    }
    Completion::ToolCalls(calls)
}

#[async_trait]
impl BackendClient for OllamaClient {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Completion> {
        let body = self.build_request(&request);
        let res = self
            .client
            .post(&self.chat_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("ollama chat request to {} failed", self.chat_url))?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("ollama API error {status}: {text}"));
        }
        let parsed: OllamaChatResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("ollama response parse error: {e}; body: {text}"))?;
        Ok(completion_from_reply(parsed.message, request.contract))
    }
}
