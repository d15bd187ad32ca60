//! Config namespace: YAML runtime settings and component builders.

mod runtime;
mod settings;

pub use runtime::StoreBackend;
pub use settings::{
    BackendsSettings, OllamaSettings, OpenAiSettings, RuntimeSettings, SchedulerSettings,
    StoreSettings, load_runtime_settings, load_runtime_settings_from_paths,
    runtime_settings_paths, set_config_home_override,
};
