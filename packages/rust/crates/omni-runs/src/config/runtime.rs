//! Settings -> live components: scheduler config, backend clients, job store.
//!
//! Env overrides are resolved here, at build time, through an injectable
//! lookup so tests never touch the process environment.

use std::sync::Arc;

use anyhow::{Result, bail};

use crate::backend::{
    BackendRegistry, DEFAULT_OLLAMA_URL, DEFAULT_OPENAI_CHAT_URL, OllamaClient,
    OllamaClientConfig, OpenAiClient, OpenAiClientConfig,
};
use crate::model::Provider;
use crate::observability::RunEvent;
use crate::scheduler::{SchedulerConfig, StaleRunPolicy};
use crate::store::{JobStore, MemoryJobStore, ValkeyJobStore};

use super::RuntimeSettings;

const DEFAULT_OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Which job store backend to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Valkey { url: String, key_prefix: Option<String> },
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl RuntimeSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        self.scheduler_config_with_env(process_env)
    }

    #[doc(hidden)]
    pub fn scheduler_config_with_env(&self, env: impl Fn(&str) -> Option<String>) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        let settings = &self.scheduler;
        let max_concurrent_runs = match non_empty(env("OMNI_RUNS_MAX_CONCURRENT_RUNS")) {
            Some(raw) => match raw.parse::<usize>() {
                Ok(value) => Some(value),
                Err(error) => {
                    tracing::warn!(
                        event = RunEvent::ConfigValueIgnored.as_str(),
                        value = %raw,
                        error = %error,
                        "invalid OMNI_RUNS_MAX_CONCURRENT_RUNS; using settings value"
                    );
                    settings.max_concurrent_runs
                }
            },
            None => settings.max_concurrent_runs,
        };
        let stale_run_policy = match settings.stale_run_policy.as_deref() {
            Some(raw) => raw.parse::<StaleRunPolicy>().unwrap_or_else(|error| {
                tracing::warn!(
                    event = RunEvent::ConfigValueIgnored.as_str(),
                    error = %error,
                    "invalid scheduler.stale_run_policy; using requeue"
                );
                StaleRunPolicy::Requeue
            }),
            None => defaults.stale_run_policy,
        };
        SchedulerConfig {
            max_concurrent_runs: max_concurrent_runs.unwrap_or(defaults.max_concurrent_runs),
            sweep_interval_ms: settings
                .sweep_interval_ms
                .unwrap_or(defaults.sweep_interval_ms),
            run_timeout_secs: settings.run_timeout_secs.unwrap_or(defaults.run_timeout_secs),
            event_triggers: settings.event_triggers.unwrap_or(defaults.event_triggers),
            stale_run_policy,
            heartbeat_interval_secs: settings
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            heartbeat_probe_timeout_ms: settings
                .heartbeat_probe_timeout_ms
                .unwrap_or(defaults.heartbeat_probe_timeout_ms),
            max_pending_age_secs: settings
                .max_pending_age_secs
                .unwrap_or(defaults.max_pending_age_secs),
            max_running_age_secs: settings
                .max_running_age_secs
                .unwrap_or(defaults.max_running_age_secs),
            lease_secs: settings.lease_secs.unwrap_or(defaults.lease_secs),
        }
        .normalized()
    }

    pub fn openai_client_config(&self) -> OpenAiClientConfig {
        self.openai_client_config_with_env(process_env)
    }

    #[doc(hidden)]
    pub fn openai_client_config_with_env(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> OpenAiClientConfig {
        let settings = &self.backends.openai;
        let defaults = OpenAiClientConfig::default();
        let inference_url = non_empty(env("OMNI_RUNS_OPENAI_BASE_URL"))
            .or_else(|| non_empty(settings.base_url.clone()))
            .map_or_else(|| DEFAULT_OPENAI_CHAT_URL.to_string(), |base| chat_completions_url(&base));
        let key_env = non_empty(settings.api_key_env.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_API_KEY_ENV.to_string());
        let api_key = non_empty(env(key_env.as_str())).or_else(|| non_empty(settings.api_key.clone()));
        OpenAiClientConfig {
            inference_url,
            api_key,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            timeout_secs: settings.timeout_secs.unwrap_or(defaults.timeout_secs),
        }
    }

    pub fn ollama_client_config(&self) -> OllamaClientConfig {
        self.ollama_client_config_with_env(process_env)
    }

    #[doc(hidden)]
    pub fn ollama_client_config_with_env(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> OllamaClientConfig {
        let settings = &self.backends.ollama;
        let defaults = OllamaClientConfig::default();
        let base_url = non_empty(env("OLLAMA_HOST"))
            .or_else(|| non_empty(settings.base_url.clone()))
            .map_or_else(|| DEFAULT_OLLAMA_URL.to_string(), |host| with_http_scheme(&host));
        OllamaClientConfig {
            base_url,
            temperature: settings.temperature,
            num_predict: settings.num_predict,
            timeout_secs: settings.timeout_secs.unwrap_or(defaults.timeout_secs),
        }
    }

    /// One long-lived client per provider.
    pub fn backend_registry(&self) -> BackendRegistry {
        BackendRegistry::new()
            .with_client(
                Provider::OpenAi,
                Arc::new(OpenAiClient::new(self.openai_client_config())),
            )
            .with_client(
                Provider::Ollama,
                Arc::new(OllamaClient::new(self.ollama_client_config())),
            )
    }

    pub fn store_backend(&self) -> Result<StoreBackend> {
        self.store_backend_with_env(process_env)
    }

    /// An explicit `store.backend` wins; otherwise a resolved Valkey URL
    /// selects Valkey and its absence selects memory.
    #[doc(hidden)]
    pub fn store_backend_with_env(&self, env: impl Fn(&str) -> Option<String>) -> Result<StoreBackend> {
        let settings = &self.store;
        let url = non_empty(env("VALKEY_URL")).or_else(|| non_empty(settings.valkey_url.clone()));
        let key_prefix =
            non_empty(env("OMNI_RUNS_VALKEY_PREFIX")).or_else(|| non_empty(settings.key_prefix.clone()));
        let requested = non_empty(settings.backend.clone()).map(|v| v.to_ascii_lowercase());
        match (requested.as_deref(), url) {
            (Some("memory"), _) | (None, None) => Ok(StoreBackend::Memory),
            (Some("valkey" | "redis") | None, Some(url)) => Ok(StoreBackend::Valkey { url, key_prefix }),
            (Some("valkey" | "redis"), None) => {
                bail!("store.backend=valkey requires store.valkey_url or VALKEY_URL")
            }
            (Some(other), _) => bail!("unknown store.backend `{other}` (expected memory|valkey)"),
        }
    }

    pub fn build_store(&self) -> Result<Arc<dyn JobStore>> {
        let store: Arc<dyn JobStore> = match self.store_backend()? {
            StoreBackend::Memory => Arc::new(MemoryJobStore::new()),
            StoreBackend::Valkey { url, key_prefix } => {
                Arc::new(ValkeyJobStore::new(&url, key_prefix)?)
            }
        };
        tracing::info!(
            event = RunEvent::StoreBackendEnabled.as_str(),
            backend = store.backend_name(),
            "job store backend enabled"
        );
        Ok(store)
    }
}

fn chat_completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn with_http_scheme(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}
