//! Dispatch: resolve a request to a concrete (location, provider, model)
//! target.
//!
//! Resolution is synchronous — it walks the persistent rows and the flavor
//! registry and never touches a provider, so the event loop can run it
//! inline and hand admissions to the per-engine queues in strict arrival
//! order. Capability mismatches are rejected here, before any provider
//! call is made.

use aog_plugin::manifest::WireProtocol;

use crate::domain::{
    HybridPolicy, Location, ModelRecord, ModelStatus, ServiceRequest, ServiceSource, ServiceTarget,
};
use crate::error::{GatewayError, Result};
use crate::provider::AuthInfo;

use super::SchedulerDeps;

/// Everything the run step needs, produced by [`resolve`]. The provider
/// instance itself is fetched by the worker; workers may block on a plugin
/// cold start, the event loop may not.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    /// The resolved target.
    pub target: ServiceTarget,
    /// Credentials forwarded to the provider.
    pub auth: AuthInfo,
}

/// Resolve a request to a target, per the dispatch algorithm.
pub(crate) fn resolve(deps: &SchedulerDeps, request: &ServiceRequest) -> Result<Resolution> {
    // 1. Location selection. The default policy resolves to local until a
    // utilization signal exists.
    let preferred = match request.hybrid_policy {
        HybridPolicy::AlwaysRemote => Location::Remote,
        HybridPolicy::AlwaysLocal | HybridPolicy::Default => Location::Local,
    };

    // 2. Model resolution; 4. default-model backfill.
    let model_row = resolve_model(deps, request, preferred)?;

    // 3. Provider resolution; the provider's source overrides the location.
    let provider_row = deps
        .store
        .get_provider(&model_row.provider_name)?
        .ok_or_else(|| GatewayError::ProviderNotFound(model_row.provider_name.clone()))?;
    let location = match provider_row.service_source {
        ServiceSource::Local => Location::Local,
        ServiceSource::Remote => Location::Remote,
    };

    // 5./6. Stream reconciliation and protocol selection from the flavor
    // facts (manifest-registered for plugins, built-in otherwise). Absent
    // facts mean "does not restrict": streaming allowed, no bidirectional.
    let facts = deps.flavors.service(&provider_row.flavor, &request.service);
    let (support_streaming, support_bidi, protocol, expose_protocol, timeout_s) = match &facts {
        Some(f) => (
            f.support_streaming,
            f.support_bidirectional,
            f.protocol,
            f.expose_protocol,
            f.timeout_s,
        ),
        None => (true, false, WireProtocol::Http, WireProtocol::Http, 0),
    };

    let mut stream = request.stream;
    if stream && !support_streaming {
        if expose_protocol == WireProtocol::Websocket {
            return Err(GatewayError::CapabilityMismatch(format!(
                "{}: streaming not declared for {}",
                provider_row.provider_name, request.service
            )));
        }
        tracing::info!(
            provider = %provider_row.provider_name,
            service = %request.service,
            "Provider does not stream; downgrading to unary"
        );
        stream = false;
    }

    if expose_protocol == WireProtocol::Websocket && !support_bidi {
        return Err(GatewayError::CapabilityMismatch(format!(
            "{}: bidirectional not declared for {}",
            provider_row.provider_name, request.service
        )));
    }
    if request.ws_conn_id.is_some() && expose_protocol != WireProtocol::Websocket {
        return Err(GatewayError::CapabilityMismatch(format!(
            "{}: {} is not a websocket service",
            provider_row.provider_name, request.service
        )));
    }
    if expose_protocol == WireProtocol::Websocket && request.ws_conn_id.is_none() {
        return Err(GatewayError::BadRequest(format!(
            "{} requires a websocket connection",
            request.service
        )));
    }

    let mut auth = AuthInfo::new();
    auth.insert("auth_type".to_string(), provider_row.auth_type.clone());
    if !provider_row.auth_key.is_empty() {
        auth.insert("api_key".to_string(), provider_row.auth_key.clone());
    }

    Ok(Resolution {
        target: ServiceTarget {
            location,
            model: model_row.model_name,
            provider: provider_row.provider_name,
            flavor: provider_row.flavor,
            stream,
            protocol,
            expose_protocol,
            timeout_s,
        },
        auth,
    })
}

/// Steps 2 and 4: pick the model row.
fn resolve_model(
    deps: &SchedulerDeps,
    request: &ServiceRequest,
    preferred: Location,
) -> Result<ModelRecord> {
    if let Some(name) = &request.model {
        let row = deps
            .store
            .get_model(name)?
            .ok_or_else(|| GatewayError::ModelNotFound(name.clone()))?;
        if row.status != ModelStatus::Downloaded {
            return Err(GatewayError::ModelNotFound(format!("{name} is not downloaded")));
        }
        if row.service_name != request.service {
            return Err(GatewayError::ModelNotFound(format!(
                "{name} does not serve {}",
                request.service
            )));
        }
        return Ok(row);
    }

    let source = match preferred {
        Location::Local => ServiceSource::Local,
        Location::Remote => ServiceSource::Remote,
    };
    if let Some(row) = deps.store.default_model(&request.service, source)? {
        return Ok(row);
    }

    // Remote services may fall back to the flavor's documented default even
    // without a model row; local services require a downloaded row.
    if preferred == Location::Remote {
        if let Some(row) = remote_flavor_default(deps, &request.service)? {
            return Ok(row);
        }
    }

    Err(GatewayError::ModelNotFound(format!(
        "no downloaded model for {}",
        request.service
    )))
}

/// Synthesize a model row from a remote provider's flavor default.
fn remote_flavor_default(deps: &SchedulerDeps, service: &str) -> Result<Option<ModelRecord>> {
    let providers = deps.store.list_providers(Some(service))?;
    for row in providers
        .iter()
        .filter(|p| p.service_source == ServiceSource::Remote)
    {
        let Some(facts) = deps.flavors.service(&row.flavor, service) else {
            continue;
        };
        if let Some(default_model) = facts.default_model {
            return Ok(Some(ModelRecord::downloaded(
                default_model,
                row.provider_name.clone(),
                service.to_string(),
                ServiceSource::Remote,
            )));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::domain::{ProviderScope, ServiceProviderRecord};
    use crate::flavor::FlavorRegistry;
    use crate::memory::MemoryManager;
    use crate::provider::ProviderFactory;
    use crate::store::Datastore;
    use crate::ws::WsConnectionManager;
    use std::sync::Arc;
    use uuid::Uuid;

    fn deps() -> SchedulerDeps {
        SchedulerDeps {
            store: Datastore::open_in_memory().unwrap(),
            flavors: FlavorRegistry::with_builtins(),
            providers: Arc::new(ProviderFactory::new()),
            memory: MemoryManager::new(crate::config::MemoryConfig::default()),
            ws: WsConnectionManager::new(),
            config: SchedulerConfig::default(),
        }
    }

    fn seed_local_chat(deps: &SchedulerDeps, provider: &str, model: &str) {
        let row = ServiceProviderRecord::new(provider, "chat", ServiceSource::Local)
            .with_flavor("ollama")
            .with_scope(ProviderScope::Builtin);
        deps.store.upsert_provider(&row).unwrap();
        deps.store
            .upsert_model(&ModelRecord::downloaded(model, provider, "chat", ServiceSource::Local))
            .unwrap();
    }

    #[test]
    fn test_resolve_named_model() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m1");

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_model("m1");
        let resolution = resolve(&deps, &request).unwrap();
        assert_eq!(resolution.target.model, "m1");
        assert_eq!(resolution.target.provider, "local_ollama");
        assert_eq!(resolution.target.location, Location::Local);
        assert!(!resolution.target.stream);
    }

    #[test]
    fn test_unknown_model_fails() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m1");

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_model("ghost");
        assert!(matches!(
            resolve(&deps, &request),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_non_downloaded_model_fails() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m1");
        let mut row = ModelRecord::downloaded("m2", "local_ollama", "chat", ServiceSource::Local);
        row.status = ModelStatus::Downloading;
        deps.store.upsert_model(&row).unwrap();

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_model("m2");
        assert!(matches!(
            resolve(&deps, &request),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_model_must_serve_requested_service() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m1");

        let request = ServiceRequest::new("embed", &b"{}"[..]).with_model("m1");
        assert!(matches!(
            resolve(&deps, &request),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_default_model_backfill_prefers_is_default() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m-new");
        let mut marked = ModelRecord::downloaded("m-default", "local_ollama", "chat", ServiceSource::Local);
        marked.is_default = true;
        marked.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
        deps.store.upsert_model(&marked).unwrap();

        let request = ServiceRequest::new("chat", &b"{}"[..]);
        let resolution = resolve(&deps, &request).unwrap();
        assert_eq!(resolution.target.model, "m-default");
    }

    #[test]
    fn test_no_models_fails() {
        let deps = deps();
        let request = ServiceRequest::new("chat", &b"{}"[..]);
        assert!(matches!(
            resolve(&deps, &request),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_provider_source_overrides_location() {
        let deps = deps();
        let row = ServiceProviderRecord::new("remote_openai", "chat", ServiceSource::Remote)
            .with_flavor("openai");
        deps.store.upsert_provider(&row).unwrap();
        deps.store
            .upsert_model(&ModelRecord::downloaded(
                "gpt-4o-mini",
                "remote_openai",
                "chat",
                ServiceSource::Remote,
            ))
            .unwrap();

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_model("gpt-4o-mini");
        let resolution = resolve(&deps, &request).unwrap();
        assert_eq!(resolution.target.location, Location::Remote);
    }

    #[test]
    fn test_remote_flavor_default_backfill() {
        let deps = deps();
        let row = ServiceProviderRecord::new("remote_openai", "chat", ServiceSource::Remote)
            .with_flavor("openai");
        deps.store.upsert_provider(&row).unwrap();

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_policy(HybridPolicy::AlwaysRemote);
        let resolution = resolve(&deps, &request).unwrap();
        // No model rows at all: the flavor's documented default applies.
        assert_eq!(resolution.target.model, "gpt-4o-mini");
    }

    #[test]
    fn test_stream_downgrade_when_not_declared() {
        let deps = deps();
        // The built-in ollama flavor declares no streaming for embed.
        let row = ServiceProviderRecord::new("local_ollama", "embed", ServiceSource::Local)
            .with_flavor("ollama");
        deps.store.upsert_provider(&row).unwrap();
        deps.store
            .upsert_model(&ModelRecord::downloaded(
                "nomic-embed-text",
                "local_ollama",
                "embed",
                ServiceSource::Local,
            ))
            .unwrap();

        let request = ServiceRequest::new("embed", &b"{}"[..]).streamed();
        let resolution = resolve(&deps, &request).unwrap();
        assert!(!resolution.target.stream, "must downgrade, not fail");
    }

    #[test]
    fn test_ws_caller_on_http_service_is_capability_mismatch() {
        let deps = deps();
        seed_local_chat(&deps, "local_ollama", "m1");

        let mut request = ServiceRequest::new("chat", &b"{}"[..]).with_model("m1");
        request.ws_conn_id = Some(Uuid::new_v4());
        let err = resolve(&deps, &request).unwrap_err();
        assert_eq!(err.kind(), "capability_mismatch");
    }

    #[test]
    fn test_missing_provider_row() {
        let deps = deps();
        deps.store
            .upsert_model(&ModelRecord::downloaded("m1", "ghost", "chat", ServiceSource::Local))
            .unwrap();

        let request = ServiceRequest::new("chat", &b"{}"[..]).with_model("m1");
        assert!(matches!(
            resolve(&deps, &request),
            Err(GatewayError::ProviderNotFound(_))
        ));
    }
}
