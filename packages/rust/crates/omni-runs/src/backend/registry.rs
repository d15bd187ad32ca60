//! Provider -> client selection, fixed at process start.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RunError;
use crate::model::{ModelDescriptor, Provider};
use crate::observability::RunEvent;

use super::BackendClient;

/// Live backend clients keyed by provider kind.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    clients: HashMap<Provider, Arc<dyn BackendClient>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client serving `provider`.
    pub fn register(&mut self, provider: Provider, client: Arc<dyn BackendClient>) {
        tracing::debug!(
            event = RunEvent::BackendRegistered.as_str(),
            provider = %provider,
            "backend client registered"
        );
        self.clients.insert(provider, client);
    }

    #[must_use]
    pub fn with_client(mut self, provider: Provider, client: Arc<dyn BackendClient>) -> Self {
        self.register(provider, client);
        self
    }

    /// Resolve the client for a model descriptor.
    pub fn resolve(&self, model: &ModelDescriptor) -> Result<Arc<dyn BackendClient>, RunError> {
        self.clients
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| {
                RunError::Backend(format!(
                    "no backend client registered for provider `{}` (model `{}`)",
                    model.provider, model.id
                ))
            })
    }
}
