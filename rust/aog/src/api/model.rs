//! Model management endpoints.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::domain::{ModelRecord, ModelStatus, ServiceSource};
use crate::error::{GatewayError, Result};

use super::response::{ok, ok_empty};
use super::AppState;

/// Query for `GET /model`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Filter by service.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Filter by status.
    #[serde(default)]
    pub status: Option<ModelStatus>,
}

/// Body for model create/delete/stream.
#[derive(Debug, Deserialize)]
pub struct ModelBody {
    /// Model to operate on.
    pub model_name: String,
    /// Owning provider; defaults to the service's bound local provider.
    #[serde(default)]
    pub provider_name: Option<String>,
    /// Service the model serves.
    #[serde(default)]
    pub service_name: Option<String>,
}

/// Query for `GET /model/support`.
#[derive(Debug, Deserialize)]
pub struct SupportQuery {
    /// Service to list supported models for.
    #[serde(default)]
    pub service_name: Option<String>,
}

/// List known models.
pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Response> {
    Ok(ok(state
        .store
        .list_models(query.service_name.as_deref(), query.status)?))
}

/// Pull a model through its provider and record it as downloaded.
pub async fn create(State(state): State<AppState>, Json(body): Json<ModelBody>) -> Result<Response> {
    let (provider_row, service_name) = resolve_provider(&state, &body)?;

    let mut record = ModelRecord::downloaded(
        &body.model_name,
        &provider_row.provider_name,
        &service_name,
        provider_row.service_source,
    );
    record.status = ModelStatus::Downloading;
    state.store.upsert_model(&record)?;

    // Remote models have nothing to download.
    if provider_row.service_source == ServiceSource::Remote {
        state
            .store
            .set_model_status(&body.model_name, &provider_row.provider_name, ModelStatus::Downloaded)?;
        record.status = ModelStatus::Downloaded;
        return Ok(ok(record));
    }

    let handle = state.providers.get(&provider_row.provider_name).await?;
    let pull = match handle.provider().model_ops() {
        Some(ops) => ops.pull_model(&body.model_name).await,
        None => Err(GatewayError::ProviderUnavailable(format!(
            "{}: provider cannot pull models",
            provider_row.provider_name
        ))),
    };

    match pull {
        Ok(()) => {
            state.store.set_model_status(
                &body.model_name,
                &provider_row.provider_name,
                ModelStatus::Downloaded,
            )?;
            record.status = ModelStatus::Downloaded;
            tracing::info!(model = %body.model_name, provider = %provider_row.provider_name, "Model downloaded");
            Ok(ok(record))
        }
        Err(e) => {
            state.store.set_model_status(
                &body.model_name,
                &provider_row.provider_name,
                ModelStatus::Failed,
            )?;
            Err(e)
        }
    }
}

/// Delete a model from its provider and the store.
pub async fn delete(State(state): State<AppState>, Json(body): Json<ModelBody>) -> Result<Response> {
    let (provider_row, _) = resolve_provider(&state, &body)?;

    if provider_row.service_source == ServiceSource::Local {
        if let Ok(handle) = state.providers.get(&provider_row.provider_name).await {
            if let Some(ops) = handle.provider().model_ops() {
                if let Err(e) = ops.delete_model(&body.model_name).await {
                    tracing::warn!(model = %body.model_name, error = %e, "Engine delete failed; removing row anyway");
                }
            }
        }
    }

    if !state
        .store
        .delete_model(&body.model_name, &provider_row.provider_name)?
    {
        return Err(GatewayError::ModelNotFound(body.model_name));
    }
    Ok(ok_empty())
}

/// Pull a model, streaming progress as SSE. Cancellable via
/// `POST /model/stream/cancel`.
pub async fn stream(
    State(state): State<AppState>,
    Json(body): Json<ModelBody>,
) -> Result<impl IntoResponse> {
    let (provider_row, service_name) = resolve_provider(&state, &body)?;
    let handle = state.providers.get(&provider_row.provider_name).await?;

    let mut record = ModelRecord::downloaded(
        &body.model_name,
        &provider_row.provider_name,
        &service_name,
        provider_row.service_source,
    );
    record.status = ModelStatus::Downloading;
    state.store.upsert_model(&record)?;

    let cancel = CancellationToken::new();
    state
        .pulls
        .lock()
        .insert(body.model_name.clone(), cancel.clone());

    let model_name = body.model_name.clone();
    let provider_name = provider_row.provider_name.clone();
    let store = state.store.clone();
    let pulls = state.pulls.clone();

    let sse = async_stream::stream! {
        let ops_stream = match handle.provider().model_ops() {
            Some(ops) => ops.pull_model_stream(&model_name).await,
            None => Err(GatewayError::ProviderUnavailable(format!(
                "{provider_name}: provider cannot pull models"
            ))),
        };

        let mut progress = match ops_stream {
            Ok(stream) => stream,
            Err(e) => {
                let _ = store.set_model_status(&model_name, &provider_name, ModelStatus::Failed);
                pulls.lock().remove(&model_name);
                yield Ok::<_, Infallible>(Event::default()
                    .event("error")
                    .data(serde_json::json!({"error": e.kind(), "message": e.to_string()}).to_string()));
                return;
            }
        };

        loop {
            let chunk = tokio::select! {
                c = progress.next() => c,
                () = cancel.cancelled() => {
                    let _ = store.set_model_status(&model_name, &provider_name, ModelStatus::Failed);
                    pulls.lock().remove(&model_name);
                    yield Ok(Event::default()
                        .event("cancelled")
                        .data(serde_json::json!({"model_name": model_name}).to_string()));
                    return;
                }
            };
            match chunk {
                Some(Ok(chunk)) => {
                    if !chunk.data.is_empty() {
                        yield Ok(Event::default()
                            .event("progress")
                            .data(String::from_utf8_lossy(&chunk.data).into_owned()));
                    }
                    if chunk.is_final {
                        let _ = store.set_model_status(&model_name, &provider_name, ModelStatus::Downloaded);
                        pulls.lock().remove(&model_name);
                        yield Ok(Event::default()
                            .event("done")
                            .data(serde_json::json!({"model_name": model_name}).to_string()));
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = store.set_model_status(&model_name, &provider_name, ModelStatus::Failed);
                    pulls.lock().remove(&model_name);
                    yield Ok(Event::default()
                        .event("error")
                        .data(serde_json::json!({"error": e.kind(), "message": e.to_string()}).to_string()));
                    return;
                }
                None => {
                    let _ = store.set_model_status(&model_name, &provider_name, ModelStatus::Downloaded);
                    pulls.lock().remove(&model_name);
                    yield Ok(Event::default()
                        .event("done")
                        .data(serde_json::json!({"model_name": model_name}).to_string()));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

/// Cancel an in-flight streamed pull.
pub async fn stream_cancel(
    State(state): State<AppState>,
    Json(body): Json<ModelBody>,
) -> Result<Response> {
    match state.pulls.lock().remove(&body.model_name) {
        Some(cancel) => {
            cancel.cancel();
            Ok(ok_empty())
        }
        None => Err(GatewayError::ModelNotFound(format!(
            "no active pull for {}",
            body.model_name
        ))),
    }
}

/// Recommended models per service, from the bundled catalog.
pub async fn recommend(State(state): State<AppState>) -> Result<Response> {
    Ok(ok(state
        .docs
        .table("recommended_models")
        .cloned()
        .unwrap_or_default()))
}

/// Supported models, optionally for one service.
pub async fn support(
    State(state): State<AppState>,
    Query(query): Query<SupportQuery>,
) -> Result<Response> {
    let table = state.docs.table("support_models").cloned().unwrap_or_default();
    match query.service_name {
        Some(service) => Ok(ok(table.get(service.as_str()).cloned().unwrap_or_default())),
        None => Ok(ok(table)),
    }
}

/// Pick the provider row a model operation applies to.
fn resolve_provider(
    state: &AppState,
    body: &ModelBody,
) -> Result<(crate::domain::ServiceProviderRecord, String)> {
    if let Some(provider_name) = &body.provider_name {
        let row = state
            .store
            .get_provider(provider_name)?
            .ok_or_else(|| GatewayError::ProviderNotFound(provider_name.clone()))?;
        let service = body
            .service_name
            .clone()
            .unwrap_or_else(|| row.service_name.clone());
        return Ok((row, service));
    }

    // No provider named: use the service's bound local provider.
    let service = body
        .service_name
        .clone()
        .ok_or_else(|| GatewayError::BadRequest("service_name or provider_name required".into()))?;
    let record = state
        .store
        .get_service(&service)?
        .ok_or_else(|| GatewayError::ServiceNotFound(service.clone()))?;
    let provider_name = record
        .local_provider
        .ok_or_else(|| GatewayError::ProviderNotFound(format!("{service}: no local provider bound")))?;
    let row = state
        .store
        .get_provider(&provider_name)?
        .ok_or_else(|| GatewayError::ProviderNotFound(provider_name))?;
    Ok((row, service))
}
