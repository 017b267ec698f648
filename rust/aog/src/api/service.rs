//! Service management endpoints.

use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::{HybridPolicy, ModelRecord, ServiceProviderRecord, ServiceRecord};
use crate::error::{GatewayError, Result};

use super::response::ok;
use super::AppState;

/// Body for `POST /service/install` and `PUT /service`.
#[derive(Debug, Deserialize)]
pub struct ServiceBody {
    /// Service name (chat, embed, ...).
    pub service_name: String,
    /// Routing preference.
    #[serde(default)]
    pub hybrid_policy: HybridPolicy,
    /// Preferred remote provider.
    #[serde(default)]
    pub remote_provider: Option<String>,
    /// Preferred local provider.
    #[serde(default)]
    pub local_provider: Option<String>,
}

/// Install a service: create its row and, when no local provider is named,
/// bind it to the built-in local engine provider.
pub async fn install(
    State(state): State<AppState>,
    Json(body): Json<ServiceBody>,
) -> Result<Response> {
    if !crate::domain::service::ALL.contains(&body.service_name.as_str()) {
        return Err(GatewayError::BadRequest(format!(
            "unknown service {:?}",
            body.service_name
        )));
    }

    let mut record = ServiceRecord::new(&body.service_name);
    record.hybrid_policy = body.hybrid_policy;
    record.remote_provider = body.remote_provider.clone();
    record.local_provider = body
        .local_provider
        .clone()
        .or_else(|| Some(crate::server::BUILTIN_LOCAL_PROVIDER.to_string()));
    state.store.upsert_service(&record)?;

    // Make sure the bound local provider has a row so dispatch can resolve
    // models pulled for this service.
    if let Some(provider_name) = &record.local_provider {
        if state.store.get_provider(provider_name)?.is_none()
            && provider_name == crate::server::BUILTIN_LOCAL_PROVIDER
        {
            let row = ServiceProviderRecord::new(
                provider_name,
                &body.service_name,
                crate::domain::ServiceSource::Local,
            )
            .with_flavor("ollama")
            .with_url(crate::server::BUILTIN_LOCAL_ENGINE_URL);
            state.store.upsert_provider(&row)?;
        }
    }

    tracing::info!(service = %body.service_name, "Service installed");
    Ok(ok(record))
}

/// Update a service row.
pub async fn update(
    State(state): State<AppState>,
    Json(body): Json<ServiceBody>,
) -> Result<Response> {
    let mut record = state
        .store
        .get_service(&body.service_name)?
        .ok_or_else(|| GatewayError::ServiceNotFound(body.service_name.clone()))?;
    record.hybrid_policy = body.hybrid_policy;
    record.remote_provider = body.remote_provider;
    record.local_provider = body.local_provider.or(record.local_provider);
    record.updated_at = chrono::Utc::now();
    state.store.upsert_service(&record)?;
    Ok(ok(record))
}

/// List installed services.
pub async fn list(State(state): State<AppState>) -> Result<Response> {
    Ok(ok(state.store.list_services()?))
}

/// Everything `export` emits and `import` accepts.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportBundle {
    /// Installed services.
    pub services: Vec<ServiceRecord>,
    /// Registered providers.
    pub service_providers: Vec<ServiceProviderRecord>,
    /// Known models.
    pub models: Vec<ModelRecord>,
}

/// Export the full configuration.
pub async fn export(State(state): State<AppState>) -> Result<Response> {
    let bundle = ExportBundle {
        services: state.store.list_services()?,
        service_providers: state.store.list_providers(None)?,
        models: state.store.list_models(None, None)?,
    };
    Ok(ok(bundle))
}

/// Import a configuration bundle, upserting every row.
pub async fn import(
    State(state): State<AppState>,
    Json(bundle): Json<ExportBundle>,
) -> Result<Response> {
    for record in &bundle.services {
        state.store.upsert_service(record)?;
    }
    for record in &bundle.service_providers {
        state.store.upsert_provider(record)?;
    }
    for record in &bundle.models {
        state.store.upsert_model(record)?;
    }
    tracing::info!(
        services = bundle.services.len(),
        providers = bundle.service_providers.len(),
        models = bundle.models.len(),
        "Configuration imported"
    );
    Ok(ok(serde_json::json!({
        "services": bundle.services.len(),
        "service_providers": bundle.service_providers.len(),
        "models": bundle.models.len(),
    })))
}
