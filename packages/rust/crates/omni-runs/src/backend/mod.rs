//! Backend clients: one long-lived client per inference provider.
//!
//! Capability: given a transcript and an optional output contract, produce
//! free text or structured tool calls, or fail.

mod ollama;
mod openai;
mod registry;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Message, ToolCall, ToolContract};

pub use ollama::{DEFAULT_OLLAMA_URL, OllamaClient, OllamaClientConfig};
pub use openai::{DEFAULT_OPENAI_CHAT_URL, OpenAiClient, OpenAiClientConfig};
pub use registry::BackendRegistry;

/// One backend call.
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    /// Provider-specific model name from the run's descriptor.
    pub model: &'a str,
    /// Full ordered transcript.
    pub transcript: &'a [Message],
    /// Contract the backend should bind to; `None` means free text.
    pub contract: Option<&'a ToolContract>,
}

/// Backend result: free text or structured calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// Inference provider capability.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Completion>;
}

pub(crate) fn synthesize_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
