//! Run scheduler: bounded-concurrency model invocation jobs.
//!
//! A run binds a transcript to a model descriptor and, optionally, a tool
//! contract. Runs are admitted FIFO under a concurrency cap, dispatched to the
//! provider's backend client, and finish with an assistant message or an
//! error. Callers may block on a run's terminal state with
//! [`RunScheduler::invoke`].

#![allow(missing_docs)]

mod backend;
mod config;
mod error;
mod model;
mod observability;
mod scheduler;
mod store;

pub use backend::{
    BackendClient, BackendRegistry, Completion, DEFAULT_OLLAMA_URL, DEFAULT_OPENAI_CHAT_URL,
    InvocationRequest, OllamaClient, OllamaClientConfig, OpenAiClient, OpenAiClientConfig,
};
pub use config::{
    BackendsSettings, OllamaSettings, OpenAiSettings, RuntimeSettings, SchedulerSettings,
    StoreBackend, StoreSettings, load_runtime_settings, load_runtime_settings_from_paths,
    runtime_settings_paths, set_config_home_override,
};
pub use error::{RunError, RunResult};
pub use model::{
    Message, MessageRole, ModelDescriptor, NewMessage, NewModel, NewRun, NewToolContract,
    Provider, Run, RunStatus, ToolCall, ToolContract,
};
pub use observability::RunEvent;
pub use scheduler::{
    RunScheduler, SchedulerConfig, SchedulerHealthState, SchedulerMetricsSnapshot,
    StaleRunPolicy, classify_scheduler_health, materialize_completion,
};
pub use store::{DEFAULT_VALKEY_KEY_PREFIX, JobStore, MemoryJobStore, ValkeyJobStore};
