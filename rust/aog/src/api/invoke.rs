//! Service invocation endpoints.
//!
//! `POST /services/{service}` carries the caller's body straight into the
//! scheduler and answers with the provider payload (unary) or an SSE chunk
//! stream. `GET /services/{service}` upgrades to a WebSocket for services
//! exposed bidirectionally; the socket is registered in the connection
//! manager and bridged by the task worker.

use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{HybridPolicy, ServiceRequest, TaskResult};
use crate::error::{GatewayError, Result};
use crate::provider::BidiPayload;
use crate::ws::CONN_ID_HEADER;

use super::AppState;

/// Cancels the task when the response stream is dropped (client gone).
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Build a [`ServiceRequest`] from the HTTP pieces.
fn build_request(
    state: &AppState,
    service: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<ServiceRequest> {
    if !crate::domain::service::ALL.contains(&service) {
        return Err(GatewayError::ServiceNotFound(service.to_string()));
    }

    // Model and stream hints ride in the caller's JSON body.
    let hints: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let model = hints
        .get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    let stream = hints.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    // Routing preference comes from the installed service row.
    let hybrid_policy = state
        .store
        .get_service(service)?
        .map(|record| record.hybrid_policy)
        .unwrap_or(HybridPolicy::Default);

    let mut header_map = std::collections::HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_string(), value.to_string());
        }
    }

    let ws_conn_id = headers
        .get(CONN_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    Ok(ServiceRequest {
        service: service.to_string(),
        model,
        hybrid_policy,
        stream,
        body,
        headers: header_map,
        ws_conn_id,
    })
}

/// `POST /services/{service}`.
pub async fn invoke_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request = build_request(&state, &service, &headers, body)?;
    let wants_stream = request.stream;
    let mut ticket = state.scheduler.enqueue(request)?;

    if wants_stream {
        let guard = CancelOnDrop(ticket.cancel.clone());
        let sse = async_stream::stream! {
            let _guard = guard;
            while let Some(result) = ticket.results.recv().await {
                match result {
                    TaskResult::Chunk { data, .. } => {
                        yield Ok::<_, Infallible>(Event::default()
                            .data(String::from_utf8_lossy(&data).into_owned()));
                    }
                    TaskResult::Failed { error, .. } => {
                        yield Ok(Event::default()
                            .event("error")
                            .data(serde_json::json!({
                                "code": error.code(),
                                "error": error.kind(),
                                "message": error.to_string(),
                            }).to_string()));
                        return;
                    }
                }
            }
            yield Ok(Event::default().data("[DONE]"));
        };
        return Ok(Sse::new(sse).keep_alive(KeepAlive::default()).into_response());
    }

    // Unary: gather the chunks; the provider body passes through.
    let mut chunks: Vec<Bytes> = Vec::new();
    while let Some(result) = ticket.results.recv().await {
        match result {
            TaskResult::Chunk { data, .. } => chunks.push(data),
            TaskResult::Failed { error, .. } => return Err(error),
        }
    }
    let body = chunks.concat();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

/// `GET /services/{service}` — WebSocket entry for bidirectional services.
pub async fn ws_invoke(
    State(state): State<AppState>,
    Path(service): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, service, socket))
}

/// Drive one WebSocket connection: register it, enqueue the task that will
/// bridge it, and pump frames both ways until either side closes.
async fn handle_socket(state: AppState, service: String, mut socket: WebSocket) {
    let conn_id = Uuid::new_v4();
    let mut channels = state.ws.register(conn_id);

    let mut request = match build_request(&state, &service, &HeaderMap::new(), Bytes::new()) {
        Ok(request) => request,
        Err(e) => {
            let _ = socket
                .send(Message::Text(error_frame(&e).into()))
                .await;
            let _ = socket.close().await;
            state.ws.unregister(conn_id);
            return;
        }
    };
    request.ws_conn_id = Some(conn_id);

    let mut ticket = match state.scheduler.enqueue(request) {
        Ok(ticket) => ticket,
        Err(e) => {
            let _ = socket
                .send(Message::Text(error_frame(&e).into()))
                .await;
            let _ = socket.close().await;
            state.ws.unregister(conn_id);
            return;
        }
    };

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if channels.to_bridge.send(BidiPayload::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if channels.to_bridge.send(BidiPayload::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        let _ = channels.to_bridge.send(BidiPayload::Ping).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        let _ = channels.to_bridge.send(BidiPayload::Pong).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = channels.to_bridge.send(BidiPayload::Close).await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
            outbound = channels.from_bridge.recv() => {
                match outbound {
                    Some(BidiPayload::Text(text)) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(BidiPayload::Binary(data)) => {
                        if socket.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(BidiPayload::Ping) => {
                        let _ = socket.send(Message::Ping(Bytes::new())).await;
                    }
                    Some(BidiPayload::Pong) => {
                        let _ = socket.send(Message::Pong(Bytes::new())).await;
                    }
                    Some(BidiPayload::Close) | None => break,
                }
            }
            result = ticket.results.recv() => {
                match result {
                    Some(TaskResult::Failed { error, .. }) => {
                        let _ = socket.send(Message::Text(error_frame(&error).into())).await;
                        break;
                    }
                    Some(TaskResult::Chunk { data, .. }) => {
                        // Bidirectional output normally rides the bridge;
                        // forward stray chunks as text.
                        if socket.send(Message::Text(String::from_utf8_lossy(&data).into_owned().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Single close path: cancel the task, drop the registration, close the
    // socket. All of it is idempotent.
    ticket.cancel.cancel();
    state.ws.unregister(conn_id);
    let _ = socket.close().await;
}

fn error_frame(error: &GatewayError) -> String {
    serde_json::json!({
        "error": {
            "code": error.code(),
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
    .to_string()
}
