//! Plugin-to-provider adapters.
//!
//! Bridges a connected [`PluginClient`] to the internal [`Provider`]
//! capability surface. Local plugins expose the full engine-management
//! surface; remote plugins expose invocation only, so lifecycle, installer,
//! and model-management calls hard-fail by absence of the trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aog_plugin::manifest::{PluginManifest, ProviderKind};
use aog_plugin::proto::{method, BidiMessage, BidiMessageType, InvokeRequest, InvokeResponse};

use crate::domain::ServiceSource;
use crate::error::{GatewayError, Result};
use crate::provider::{
    BidiInvoker, BidiPayload, ChunkData, ChunkStream, EngineInfo, EngineLifecycle, InvokeContext,
    InvokeOutcome, ModelOps, Provider, StreamInvoker,
};

use super::transport::PluginClient;

/// Default timeout for lifecycle and model-management RPCs.
const MGMT_TIMEOUT: Duration = Duration::from_secs(60);
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// A plugin exposed as an internal provider.
pub struct PluginProvider {
    name: String,
    manifest: PluginManifest,
    client: Arc<PluginClient>,
}

impl std::fmt::Debug for PluginProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProvider")
            .field("name", &self.name)
            .field("kind", &self.manifest.provider.kind)
            .finish_non_exhaustive()
    }
}

impl PluginProvider {
    /// Wrap a connected client.
    pub fn new(manifest: PluginManifest, client: Arc<PluginClient>) -> Self {
        Self {
            name: manifest.provider.name.clone(),
            manifest,
            client,
        }
    }

    fn is_local(&self) -> bool {
        self.manifest.provider.kind == ProviderKind::Local
    }

    fn declares_streaming(&self) -> bool {
        self.manifest
            .services
            .iter()
            .any(|s| s.capabilities.support_streaming)
    }

    fn declares_bidirectional(&self) -> bool {
        self.manifest
            .services
            .iter()
            .any(|s| s.capabilities.support_bidirectional)
    }

    fn invoke_payload(&self, ctx: &InvokeContext) -> Vec<u8> {
        InvokeRequest {
            service_name: ctx.service.clone(),
            auth_info: ctx.auth.clone(),
            request_bytes: ctx.body.to_vec(),
            model: ctx.model.clone(),
            headers: ctx.headers.clone(),
        }
        .encode_to_vec()
    }
}

#[async_trait]
impl Provider for PluginProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ServiceSource {
        match self.manifest.provider.kind {
            ProviderKind::Local => ServiceSource::Local,
            ProviderKind::Remote => ServiceSource::Remote,
        }
    }

    async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome> {
        let payload = self.invoke_payload(&ctx);
        let frame = tokio::select! {
            f = self.client.request(method::INVOKE_SERVICE, payload, ctx.timeout) => f?,
            () = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let response = InvokeResponse::decode(frame.payload.as_slice()).map_err(|e| {
            GatewayError::ProviderUnavailable(format!("{}: malformed invoke response: {e}", self.name))
        })?;
        Ok(InvokeOutcome {
            status: u16::try_from(response.status).unwrap_or(200),
            body: Bytes::from(response.body),
            metadata: response.metadata,
        })
    }

    fn as_stream(&self) -> Option<&dyn StreamInvoker> {
        self.declares_streaming().then_some(self as &dyn StreamInvoker)
    }

    fn as_bidi(&self) -> Option<&dyn BidiInvoker> {
        self.declares_bidirectional().then_some(self as &dyn BidiInvoker)
    }

    fn model_ops(&self) -> Option<&dyn ModelOps> {
        self.is_local().then_some(self as &dyn ModelOps)
    }

    fn lifecycle(&self) -> Option<&dyn EngineLifecycle> {
        self.is_local().then_some(self as &dyn EngineLifecycle)
    }

    fn info(&self) -> Option<&dyn EngineInfo> {
        self.is_local().then_some(self as &dyn EngineInfo)
    }
}

#[async_trait]
impl StreamInvoker for PluginProvider {
    async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream> {
        let payload = self.invoke_payload(&ctx);
        let mut rx = self
            .client
            .request_stream(method::INVOKE_SERVICE_STREAM, payload)
            .await?;

        let cancel = ctx.cancel.clone();
        let stream = async_stream::stream! {
            loop {
                let chunk = tokio::select! {
                    c = rx.recv() => c,
                    () = cancel.cancelled() => {
                        yield Err(GatewayError::Cancelled);
                        return;
                    }
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        if !chunk.error.is_empty() {
                            yield Err(GatewayError::ProviderUnavailable(chunk.error));
                            return;
                        }
                        let is_final = chunk.is_final;
                        yield Ok(ChunkData {
                            data: Bytes::from(chunk.data),
                            is_final,
                            metadata: chunk.metadata,
                        });
                        if is_final {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => return,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl BidiInvoker for PluginProvider {
    async fn invoke_bidi(
        &self,
        ctx: InvokeContext,
        mut incoming: mpsc::Receiver<BidiPayload>,
        outgoing: mpsc::Sender<BidiPayload>,
    ) -> Result<()> {
        let first = BidiMessage {
            service_name: ctx.service.clone(),
            auth_info: ctx.auth.clone(),
            data: Vec::new(),
            message_type: BidiMessageType::Text as i32,
            metadata: ctx.headers.clone(),
            is_first: true,
        };
        let (id, mut plugin_rx) = self.client.open_bidi(method::INVOKE_SERVICE_BIDI, first).await?;

        let result = loop {
            tokio::select! {
                () = ctx.cancel.cancelled() => break Ok(()),
                message = incoming.recv() => {
                    match message {
                        Some(payload) => {
                            let close = matches!(payload, BidiPayload::Close);
                            self.client.send_bidi(id, payload_to_message(payload)).await?;
                            if close {
                                break Ok(());
                            }
                        }
                        // Caller side closed; tell the plugin and stop.
                        None => {
                            let _ = self.client.send_bidi(id, close_message()).await;
                            break Ok(());
                        }
                    }
                }
                message = plugin_rx.recv() => {
                    match message {
                        Some(message) => {
                            let payload = message_to_payload(&message);
                            let close = matches!(payload, BidiPayload::Close);
                            if outgoing.send(payload).await.is_err() {
                                break Ok(());
                            }
                            if close {
                                break Ok(());
                            }
                        }
                        None => {
                            break Err(GatewayError::ProviderUnavailable(format!(
                                "{}: plugin closed the exchange",
                                self.name
                            )));
                        }
                    }
                }
            }
        };

        self.client.close_bidi(id);
        result
    }
}

#[derive(serde::Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
}

#[derive(serde::Serialize)]
struct Empty {}

#[derive(serde::Deserialize, Default)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<String>,
}

#[derive(serde::Deserialize)]
struct VersionResponse {
    version: String,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    status: String,
}

#[async_trait]
impl ModelOps for PluginProvider {
    async fn pull_model(&self, model: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request_json(method::PULL_MODEL, &ModelRequest { model }, Duration::from_secs(3600))
            .await?;
        Ok(())
    }

    async fn pull_model_stream(&self, model: &str) -> Result<ChunkStream> {
        let payload = serde_json::to_vec(&ModelRequest { model })
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut rx = self
            .client
            .request_stream(method::PULL_MODEL_STREAM, payload)
            .await?;
        let stream = async_stream::stream! {
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(chunk) => {
                        if !chunk.error.is_empty() {
                            yield Err(GatewayError::ModelPreparationFailed(chunk.error));
                            return;
                        }
                        let is_final = chunk.is_final;
                        yield Ok(ChunkData {
                            data: Bytes::from(chunk.data),
                            is_final,
                            metadata: chunk.metadata,
                        });
                        if is_final {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn delete_model(&self, model: &str) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request_json(method::DELETE_MODEL, &ModelRequest { model }, MGMT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response: ModelListResponse = self
            .client
            .request_json(method::LIST_MODELS, &Empty {}, MGMT_TIMEOUT)
            .await?;
        Ok(response.models)
    }

    async fn load_model(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        let request = ModelRequest { model };
        let call = self.client.request_json::<_, serde_json::Value>(
            method::LOAD_MODEL,
            &request,
            LOAD_TIMEOUT,
        );
        tokio::select! {
            r = call => r.map(|_| ()).map_err(|e| match e {
                GatewayError::DeadlineExceeded(m) => GatewayError::DeadlineExceeded(m),
                other => GatewayError::ModelPreparationFailed(other.to_string()),
            }),
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        self.client
            .request_json::<_, serde_json::Value>(
                method::UNLOAD_MODEL,
                &ModelRequest { model },
                UNLOAD_TIMEOUT,
            )
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::ModelPreparationFailed(e.to_string()))
    }

    async fn running_models(&self) -> Result<Vec<String>> {
        let response: ModelListResponse = self
            .client
            .request_json(method::GET_RUNNING_MODELS, &Empty {}, MGMT_TIMEOUT)
            .await?;
        Ok(response.models)
    }

    async fn supported_models(&self) -> Result<Vec<String>> {
        let response: ModelListResponse = self
            .client
            .request_json(method::LIST_SUPPORTED_MODELS, &Empty {}, MGMT_TIMEOUT)
            .await?;
        Ok(response.models)
    }
}

#[async_trait]
impl EngineLifecycle for PluginProvider {
    async fn start(&self) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request_json(method::START_ENGINE, &Empty {}, MGMT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request_json(method::STOP_ENGINE, &Empty {}, MGMT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let _: StatusResponse = self
            .client
            .request_json(method::HEALTH, &Empty {}, Duration::from_secs(10))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EngineInfo for PluginProvider {
    async fn version(&self) -> Result<String> {
        let response: VersionResponse = self
            .client
            .request_json(method::GET_VERSION, &Empty {}, Duration::from_secs(10))
            .await?;
        Ok(response.version)
    }

    async fn operate_status(&self) -> Result<String> {
        let response: StatusResponse = self
            .client
            .request_json(method::GET_OPERATE_STATUS, &Empty {}, Duration::from_secs(10))
            .await?;
        Ok(response.status)
    }

    async fn set_operate_status(&self, status: &str) -> Result<()> {
        #[derive(serde::Serialize)]
        struct SetStatus<'a> {
            status: &'a str,
        }
        let _: serde_json::Value = self
            .client
            .request_json(
                method::SET_OPERATE_STATUS,
                &SetStatus { status },
                Duration::from_secs(10),
            )
            .await?;
        Ok(())
    }
}

fn payload_to_message(payload: BidiPayload) -> BidiMessage {
    let (message_type, data) = match payload {
        BidiPayload::Text(text) => (BidiMessageType::Text, text.into_bytes()),
        BidiPayload::Binary(data) => (BidiMessageType::Binary, data.to_vec()),
        BidiPayload::Ping => (BidiMessageType::Ping, Vec::new()),
        BidiPayload::Pong => (BidiMessageType::Pong, Vec::new()),
        BidiPayload::Close => (BidiMessageType::Close, Vec::new()),
    };
    BidiMessage {
        service_name: String::new(),
        auth_info: HashMap::new(),
        data,
        message_type: message_type as i32,
        metadata: HashMap::new(),
        is_first: false,
    }
}

fn close_message() -> BidiMessage {
    payload_to_message(BidiPayload::Close)
}

fn message_to_payload(message: &BidiMessage) -> BidiPayload {
    match BidiMessageType::try_from(message.message_type) {
        Ok(BidiMessageType::Text) => {
            BidiPayload::Text(String::from_utf8_lossy(&message.data).into_owned())
        }
        Ok(BidiMessageType::Binary) => BidiPayload::Binary(Bytes::from(message.data.clone())),
        Ok(BidiMessageType::Ping) => BidiPayload::Ping,
        Ok(BidiMessageType::Pong) => BidiPayload::Pong,
        Ok(BidiMessageType::Close) | Err(_) => BidiPayload::Close,
    }
}
