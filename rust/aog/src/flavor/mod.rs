//! API flavor registry.
//!
//! A flavor is a named API dialect for a family of providers. The registry
//! holds, per flavor and service, the capability and default-model facts
//! dispatch consults for built-in providers; plugin discovery registers a
//! flavor per plugin so its services resolve the same way.
//!
//! Request/response transcoding between flavors is owned by the API edge and
//! stays outside this module.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use aog_plugin::manifest::{PluginManifest, WireProtocol};

/// Per-service facts within one flavor.
#[derive(Debug, Clone)]
pub struct FlavorService {
    /// Backend endpoint path for the service.
    pub endpoint: String,
    /// Documented default model, used for remote backfill.
    pub default_model: Option<String>,
    /// The service can emit server-streamed chunks.
    pub support_streaming: bool,
    /// The service can drive a bidirectional exchange.
    pub support_bidirectional: bool,
    /// Protocol the provider speaks to its backend.
    pub protocol: WireProtocol,
    /// Protocol the gateway exposes for this service.
    pub expose_protocol: WireProtocol,
    /// Declared invocation timeout in seconds; 0 = gateway default.
    pub timeout_s: u64,
}

impl FlavorService {
    fn http(endpoint: &str, streaming: bool) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            default_model: None,
            support_streaming: streaming,
            support_bidirectional: false,
            protocol: WireProtocol::Http,
            expose_protocol: WireProtocol::Http,
            timeout_s: 0,
        }
    }

    /// Set the documented default model.
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }
}

/// A named API dialect.
#[derive(Debug, Clone)]
pub struct FlavorDescriptor {
    /// Flavor name (e.g. `ollama`, `openai`).
    pub name: String,
    /// Facts per service name.
    pub services: HashMap<String, FlavorService>,
}

impl FlavorDescriptor {
    /// Derive a flavor from a plugin manifest; the flavor carries the
    /// plugin's provider name.
    pub fn from_manifest(manifest: &PluginManifest) -> Self {
        let services = manifest
            .services
            .iter()
            .map(|s| {
                let service = FlavorService {
                    endpoint: s.endpoint.clone(),
                    default_model: (!s.default_model.is_empty()).then(|| s.default_model.clone()),
                    support_streaming: s.capabilities.support_streaming,
                    support_bidirectional: s.capabilities.support_bidirectional,
                    protocol: s.protocol,
                    expose_protocol: s.expose_protocol,
                    timeout_s: s.timeout_s,
                };
                (s.service_name.clone(), service)
            })
            .collect();
        Self {
            name: manifest.provider.name.clone(),
            services,
        }
    }
}

/// Registry of flavors, shared across dispatch and discovery.
#[derive(Debug, Clone, Default)]
pub struct FlavorRegistry {
    inner: Arc<RwLock<HashMap<String, FlavorDescriptor>>>,
}

impl FlavorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in flavors.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ollama_flavor());
        registry.register(openai_flavor());
        registry.register(openvino_flavor());
        registry
    }

    /// Register (or replace) a flavor.
    pub fn register(&self, descriptor: FlavorDescriptor) {
        tracing::debug!(flavor = %descriptor.name, services = descriptor.services.len(), "Registering flavor");
        self.inner.write().insert(descriptor.name.clone(), descriptor);
    }

    /// Remove a flavor. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.write().remove(name).is_some()
    }

    /// A flavor by name.
    pub fn get(&self, name: &str) -> Option<FlavorDescriptor> {
        self.inner.read().get(name).cloned()
    }

    /// The per-service facts for `(flavor, service)`.
    pub fn service(&self, flavor: &str, service: &str) -> Option<FlavorService> {
        self.inner
            .read()
            .get(flavor)
            .and_then(|d| d.services.get(service))
            .cloned()
    }

    /// Registered flavor names.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

/// Ollama-style local engine flavor: chat/generate/embed over HTTP.
fn ollama_flavor() -> FlavorDescriptor {
    let mut services = HashMap::new();
    services.insert(
        crate::domain::service::CHAT.to_string(),
        FlavorService::http("/api/chat", true),
    );
    services.insert(
        crate::domain::service::GENERATE.to_string(),
        FlavorService::http("/api/generate", true),
    );
    services.insert(
        crate::domain::service::EMBED.to_string(),
        FlavorService::http("/api/embed", false),
    );
    FlavorDescriptor {
        name: "ollama".to_string(),
        services,
    }
}

/// OpenAI-style remote flavor.
fn openai_flavor() -> FlavorDescriptor {
    let mut services = HashMap::new();
    services.insert(
        crate::domain::service::CHAT.to_string(),
        FlavorService::http("/v1/chat/completions", true).with_default_model("gpt-4o-mini"),
    );
    services.insert(
        crate::domain::service::EMBED.to_string(),
        FlavorService::http("/v1/embeddings", false).with_default_model("text-embedding-3-small"),
    );
    services.insert(
        crate::domain::service::TEXT_TO_IMAGE.to_string(),
        FlavorService::http("/v1/images/generations", false).with_default_model("dall-e-3"),
    );
    FlavorDescriptor {
        name: "openai".to_string(),
        services,
    }
}

/// OpenVINO-model-server-style local flavor for media services.
fn openvino_flavor() -> FlavorDescriptor {
    let mut services = HashMap::new();
    services.insert(
        crate::domain::service::TEXT_TO_IMAGE.to_string(),
        FlavorService::http("/v1/images", false),
    );
    services.insert(crate::domain::service::SPEECH_TO_TEXT.to_string(), {
        let mut s = FlavorService::http("/v1/audio/transcriptions", true);
        s.support_bidirectional = true;
        s.expose_protocol = WireProtocol::Websocket;
        s
    });
    services.insert(
        crate::domain::service::TEXT_TO_SPEECH.to_string(),
        FlavorService::http("/v1/audio/speech", false),
    );
    FlavorDescriptor {
        name: "openvino".to_string(),
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aog_plugin::manifest::current_platform_key;

    #[test]
    fn test_builtin_flavors_present() {
        let registry = FlavorRegistry::with_builtins();
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["ollama", "openai", "openvino"]);
    }

    #[test]
    fn test_service_lookup() {
        let registry = FlavorRegistry::with_builtins();
        let chat = registry.service("ollama", "chat").unwrap();
        assert!(chat.support_streaming);
        assert_eq!(chat.expose_protocol, WireProtocol::Http);

        let stt = registry.service("openvino", "speech-to-text").unwrap();
        assert!(stt.support_bidirectional);
        assert_eq!(stt.expose_protocol, WireProtocol::Websocket);

        assert!(registry.service("ollama", "text-to-image").is_none());
        assert!(registry.service("ghost", "chat").is_none());
    }

    #[test]
    fn test_remote_default_model() {
        let registry = FlavorRegistry::with_builtins();
        let chat = registry.service("openai", "chat").unwrap();
        assert_eq!(chat.default_model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_flavor_from_manifest() {
        let json = serde_json::json!({
            "provider": {"name": "acme", "version": "1.0", "type": "remote"},
            "services": [{
                "service_name": "chat",
                "endpoint": "/chat",
                "default_model": "acme-1",
                "capabilities": {"support_streaming": true},
                "timeout_s": 30
            }],
            "platforms": {current_platform_key(): {"executable": "bin/acme"}}
        });
        let manifest: PluginManifest = serde_json::from_value(json).unwrap();

        let flavor = FlavorDescriptor::from_manifest(&manifest);
        assert_eq!(flavor.name, "acme");
        let chat = flavor.services.get("chat").unwrap();
        assert_eq!(chat.default_model.as_deref(), Some("acme-1"));
        assert!(chat.support_streaming);
        assert_eq!(chat.timeout_s, 30);
    }

    #[test]
    fn test_register_replace_unregister() {
        let registry = FlavorRegistry::new();
        registry.register(FlavorDescriptor {
            name: "x".to_string(),
            services: HashMap::new(),
        });
        assert!(registry.get("x").is_some());
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
    }
}
