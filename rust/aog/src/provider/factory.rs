//! Composite provider factory.
//!
//! Resolves a provider name to a concrete instance: the built-in registry is
//! consulted first, then the plugin registry through the [`ProviderResolver`]
//! seam. The seam keeps this module free of a dependency on the plugin
//! runtime; the composition root wires the concrete registry in at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{GatewayError, Result};

use super::ProviderHandle;

/// Anything that can turn a provider name into a handle. Implemented by the
/// plugin registry.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    /// Resolve a provider by name.
    async fn resolve(&self, name: &str) -> Result<ProviderHandle>;

    /// Provider names this resolver knows about.
    fn known_names(&self) -> Vec<String>;
}

/// Composite factory over built-in providers and the plugin registry.
#[derive(Default)]
pub struct ProviderFactory {
    builtins: RwLock<HashMap<String, ProviderHandle>>,
    plugin_resolver: RwLock<Option<Arc<dyn ProviderResolver>>>,
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("builtins", &self.builtins.read().keys().collect::<Vec<_>>())
            .field("has_plugin_resolver", &self.plugin_resolver.read().is_some())
            .finish()
    }
}

impl ProviderFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in provider.
    pub fn register_builtin(&self, handle: ProviderHandle) {
        let name = handle.name().to_string();
        tracing::debug!(provider = %name, "Registering built-in provider");
        self.builtins.write().insert(name, handle);
    }

    /// Install the plugin-registry resolver. Called once from the
    /// composition root after discovery is set up.
    pub fn set_plugin_resolver(&self, resolver: Arc<dyn ProviderResolver>) {
        *self.plugin_resolver.write() = Some(resolver);
    }

    /// Resolve a provider by name: built-ins first, then plugins.
    pub async fn get(&self, name: &str) -> Result<ProviderHandle> {
        if let Some(handle) = self.builtins.read().get(name).cloned() {
            return Ok(handle);
        }

        let resolver = self.plugin_resolver.read().clone();
        if let Some(resolver) = resolver {
            match resolver.resolve(name).await {
                Ok(handle) => return Ok(handle),
                Err(GatewayError::ProviderNotFound(_)) => {}
                Err(other) => return Err(other),
            }
        }

        Err(GatewayError::ProviderNotFound(name.to_string()))
    }

    /// All resolvable provider names.
    pub fn known_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtins.read().keys().cloned().collect();
        if let Some(resolver) = self.plugin_resolver.read().as_ref() {
            names.extend(resolver.known_names());
        }
        names.sort();
        names.dedup();
        names
    }

    /// Built-in local providers, for engine management and startup resets.
    pub fn builtin_handles(&self) -> Vec<ProviderHandle> {
        self.builtins.read().values().cloned().collect()
    }
}
