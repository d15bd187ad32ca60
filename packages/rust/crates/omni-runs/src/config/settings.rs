//! Runtime settings loader for omni-runs.
//!
//! Loads and merges:
//! - System defaults: `<PRJ_ROOT>/packages/conf/runs.yaml`
//! - User overrides:  `<PRJ_CONFIG_HOME>/omni-dev-fusion/runs.yaml`
//!
//! Merge precedence is user over system.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

use crate::observability::RunEvent;

const DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH: &str = "packages/conf/runs.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "omni-dev-fusion/runs.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";
static CONFIG_HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub backends: BackendsSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSettings {
    pub max_concurrent_runs: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
    pub run_timeout_secs: Option<u64>,
    pub event_triggers: Option<bool>,
    pub stale_run_policy: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_probe_timeout_ms: Option<u64>,
    pub max_pending_age_secs: Option<u64>,
    pub max_running_age_secs: Option<u64>,
    pub lease_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    /// `memory` or `valkey`.
    pub backend: Option<String>,
    pub valkey_url: Option<String>,
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendsSettings {
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub ollama: OllamaSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiSettings {
    /// API base (`.../v1`) or the full chat completions URL.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Env var holding the API key (default `OPENAI_API_KEY`).
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaSettings {
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub num_predict: Option<i32>,
    pub timeout_secs: Option<u64>,
}

impl RuntimeSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            scheduler: self.scheduler.merge(overlay.scheduler),
            store: self.store.merge(overlay.store),
            backends: BackendsSettings {
                openai: self.backends.openai.merge(overlay.backends.openai),
                ollama: self.backends.ollama.merge(overlay.backends.ollama),
            },
        }
    }
}

impl SchedulerSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            max_concurrent_runs: overlay.max_concurrent_runs.or(self.max_concurrent_runs),
            sweep_interval_ms: overlay.sweep_interval_ms.or(self.sweep_interval_ms),
            run_timeout_secs: overlay.run_timeout_secs.or(self.run_timeout_secs),
            event_triggers: overlay.event_triggers.or(self.event_triggers),
            stale_run_policy: overlay.stale_run_policy.or(self.stale_run_policy),
            heartbeat_interval_secs: overlay
                .heartbeat_interval_secs
                .or(self.heartbeat_interval_secs),
            heartbeat_probe_timeout_ms: overlay
                .heartbeat_probe_timeout_ms
                .or(self.heartbeat_probe_timeout_ms),
            max_pending_age_secs: overlay.max_pending_age_secs.or(self.max_pending_age_secs),
            max_running_age_secs: overlay.max_running_age_secs.or(self.max_running_age_secs),
            lease_secs: overlay.lease_secs.or(self.lease_secs),
        }
    }
}

impl StoreSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            backend: overlay.backend.or(self.backend),
            valkey_url: overlay.valkey_url.or(self.valkey_url),
            key_prefix: overlay.key_prefix.or(self.key_prefix),
        }
    }
}

impl OpenAiSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            base_url: overlay.base_url.or(self.base_url),
            api_key: overlay.api_key.or(self.api_key),
            api_key_env: overlay.api_key_env.or(self.api_key_env),
            temperature: overlay.temperature.or(self.temperature),
            max_tokens: overlay.max_tokens.or(self.max_tokens),
            timeout_secs: overlay.timeout_secs.or(self.timeout_secs),
        }
    }
}

impl OllamaSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            base_url: overlay.base_url.or(self.base_url),
            temperature: overlay.temperature.or(self.temperature),
            num_predict: overlay.num_predict.or(self.num_predict),
            timeout_secs: overlay.timeout_secs.or(self.timeout_secs),
        }
    }
}

/// Load merged runtime settings from the standard locations.
pub fn load_runtime_settings() -> RuntimeSettings {
    let (system_path, user_path) = runtime_settings_paths();
    load_runtime_settings_from_paths(&system_path, &user_path)
}

#[doc(hidden)]
pub fn runtime_settings_paths() -> (PathBuf, PathBuf) {
    let root = project_root();
    let system_path = root.join(DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH);
    let user_path = resolve_config_home(&root).join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system_path, user_path)
}

#[doc(hidden)]
pub fn load_runtime_settings_from_paths(system: &Path, user: &Path) -> RuntimeSettings {
    load_one(system).merge(load_one(user))
}

fn load_one(path: &Path) -> RuntimeSettings {
    if !path.exists() {
        return RuntimeSettings::default();
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(
                event = RunEvent::ConfigValueIgnored.as_str(),
                path = %path.display(),
                error = %error,
                "failed to read settings file; ignoring"
            );
            return RuntimeSettings::default();
        }
    };
    match serde_yaml::from_str::<RuntimeSettings>(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                event = RunEvent::ConfigValueIgnored.as_str(),
                path = %path.display(),
                error = %error,
                "failed to parse settings yaml; ignoring file"
            );
            RuntimeSettings::default()
        }
    }
}

fn project_root() -> PathBuf {
    std::env::var("PRJ_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Set config-home override (used by CLI `--conf`).
///
/// The path can be absolute, or relative to `PRJ_ROOT`/cwd.
pub fn set_config_home_override(path: impl Into<PathBuf>) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        return;
    }
    if CONFIG_HOME_OVERRIDE.set(path.clone()).is_err()
        && let Some(current) = CONFIG_HOME_OVERRIDE.get()
        && current != &path
    {
        tracing::warn!(
            event = RunEvent::ConfigValueIgnored.as_str(),
            current = %current.display(),
            ignored = %path.display(),
            "config home override already set; ignoring subsequent value"
        );
    }
}

fn resolve_config_home(project_root: &Path) -> PathBuf {
    if let Some(path) = CONFIG_HOME_OVERRIDE.get() {
        return absolutize(project_root, path.clone());
    }

    let configured = std::env::var("PRJ_CONFIG_HOME")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_HOME_RELATIVE_PATH.to_string());
    absolutize(project_root, PathBuf::from(configured))
}

fn absolutize(project_root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    }
}
