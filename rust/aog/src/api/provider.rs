//! Service-provider management endpoints.

use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

use crate::domain::{ProviderScope, ServiceProviderRecord, ServiceSource};
use crate::error::{GatewayError, Result};

use super::response::{ok, ok_empty};
use super::AppState;

/// Query for `GET /service_provider`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Filter by service name.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Return one provider by name.
    #[serde(default)]
    pub provider_name: Option<String>,
}

/// Body for create/update.
#[derive(Debug, Deserialize)]
pub struct ProviderBody {
    /// Unique provider name.
    pub provider_name: String,
    /// Service this provider serves.
    pub service_name: String,
    /// Where the provider's inference runs.
    pub service_source: ServiceSource,
    /// API flavor.
    #[serde(default)]
    pub flavor: String,
    /// Authentication style.
    #[serde(default)]
    pub auth_type: Option<String>,
    /// Credential forwarded verbatim.
    #[serde(default)]
    pub auth_key: Option<String>,
    /// Backend URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra properties (JSON object).
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
}

/// Body for `DELETE /service_provider`.
#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    /// Provider to delete.
    pub provider_name: String,
}

/// List providers (or fetch one by name).
pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Response> {
    if let Some(name) = &query.provider_name {
        let record = state
            .store
            .get_provider(name)?
            .ok_or_else(|| GatewayError::ProviderNotFound(name.clone()))?;
        return Ok(ok(record));
    }
    Ok(ok(state.store.list_providers(query.service_name.as_deref())?))
}

/// Create a provider row.
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<ProviderBody>,
) -> Result<Response> {
    if body.provider_name.is_empty() {
        return Err(GatewayError::BadRequest("provider_name must not be empty".into()));
    }
    if state.store.get_provider(&body.provider_name)?.is_some() {
        return Err(GatewayError::BadRequest(format!(
            "provider {} already exists",
            body.provider_name
        )));
    }
    let record = record_from(body);
    state.store.upsert_provider(&record)?;
    tracing::info!(provider = %record.provider_name, "Provider registered");
    Ok(ok(record))
}

/// Update (or create) a provider row.
pub async fn update(
    State(state): State<AppState>,
    Json(body): Json<ProviderBody>,
) -> Result<Response> {
    let record = record_from(body);
    state.store.upsert_provider(&record)?;
    Ok(ok(record))
}

/// Delete a provider row.
pub async fn delete(
    State(state): State<AppState>,
    Json(body): Json<DeleteBody>,
) -> Result<Response> {
    if !state.store.delete_provider(&body.provider_name)? {
        return Err(GatewayError::ProviderNotFound(body.provider_name));
    }
    tracing::info!(provider = %body.provider_name, "Provider deleted");
    Ok(ok_empty())
}

fn record_from(body: ProviderBody) -> ServiceProviderRecord {
    let mut record =
        ServiceProviderRecord::new(&body.provider_name, &body.service_name, body.service_source)
            .with_flavor(body.flavor)
            .with_scope(ProviderScope::Builtin);
    if let Some(auth_type) = body.auth_type {
        record.auth_type = auth_type;
    }
    if let Some(auth_key) = body.auth_key {
        record.auth_key = auth_key;
    }
    if let Some(url) = body.url {
        record.url = url;
    }
    if let Some(properties) = body.properties {
        record.properties = properties.to_string();
    }
    record
}
