//! Backend client descriptors (immutable reference data).

use serde::{Deserialize, Serialize};

/// Closed set of inference provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hosted OpenAI-compatible chat completions API (OpenAI, LiteLLM, vLLM, ...).
    #[serde(rename = "openai")]
    OpenAi,
    /// Local small model served by Ollama.
    Ollama,
}

impl Provider {
    pub const ALL: [Self; 2] = [Self::OpenAi, Self::Ollama];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" | "litellm" => Ok(Self::OpenAi),
            "ollama" | "local" => Ok(Self::Ollama),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// `{id, provider, concreteName}`: which backend and which concrete model a run targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: Provider,
    /// Provider-specific model name (e.g. `gpt-4o-mini`, `qwen2.5:3b`).
    pub concrete_name: String,
}

/// Collaborator request to register a model descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewModel {
    pub provider: Provider,
    pub concrete_name: String,
}

impl NewModel {
    pub fn new(provider: Provider, concrete_name: impl Into<String>) -> Self {
        Self {
            provider,
            concrete_name: concrete_name.into(),
        }
    }
}
