//! Built-in providers.
//!
//! Two providers ship with the gateway: an Ollama-style local engine driver
//! and a generic OpenAI-compatible remote driver. Both speak HTTP through
//! reqwest; engine binaries themselves are installed and launched outside
//! the gateway.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::domain::ServiceSource;
use crate::error::{GatewayError, Result};

use super::{
    ChunkData, ChunkStream, EngineInfo, EngineInstaller, EngineLifecycle, InvokeContext,
    InvokeOutcome, ModelOps, Provider, StreamInvoker,
};

/// Bound on model load/unload calls against the engine.
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Ollama-style local engine provider.
///
/// Serves chat/generate/embed over the engine's HTTP API and manages engine
/// memory through the `keep_alive` load/unload convention.
pub struct OllamaProvider {
    name: String,
    base_url: String,
    endpoints: HashMap<String, String>,
    client: Client,
    operate_status: Mutex<String>,
}

impl std::fmt::Debug for OllamaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OllamaProvider {
    /// Create a provider against an engine base URL.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(crate::domain::service::CHAT.to_string(), "/api/chat".to_string());
        endpoints.insert(crate::domain::service::GENERATE.to_string(), "/api/generate".to_string());
        endpoints.insert(crate::domain::service::EMBED.to_string(), "/api/embed".to_string());

        Self {
            name: name.into(),
            base_url: base_url.into(),
            endpoints,
            client: Client::new(),
            operate_status: Mutex::new("running".to_string()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn endpoint(&self, service: &str) -> Result<String> {
        self.endpoints
            .get(service)
            .cloned()
            .ok_or_else(|| GatewayError::ServiceNotFound(format!("{}: {service}", self.name)))
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ServiceSource {
        ServiceSource::Local
    }

    async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome> {
        let endpoint = self.endpoint(&ctx.service)?;
        let request = self
            .client
            .post(self.url(&endpoint))
            .header("content-type", "application/json")
            .body(ctx.body.clone())
            .timeout(ctx.timeout);

        let response = tokio::select! {
            r = request.send() => r?,
            () = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        if status >= 500 {
            return Err(GatewayError::ProviderUnavailable(snippet(&body)));
        }
        if status >= 400 {
            return Err(GatewayError::BadRequest(snippet(&body)));
        }
        Ok(InvokeOutcome {
            status,
            body,
            metadata: HashMap::new(),
        })
    }

    fn as_stream(&self) -> Option<&dyn StreamInvoker> {
        Some(self)
    }

    fn model_ops(&self) -> Option<&dyn ModelOps> {
        Some(self)
    }

    fn lifecycle(&self) -> Option<&dyn EngineLifecycle> {
        Some(self)
    }

    fn installer(&self) -> Option<&dyn EngineInstaller> {
        Some(self)
    }

    fn info(&self) -> Option<&dyn EngineInfo> {
        Some(self)
    }
}

#[async_trait]
impl StreamInvoker for OllamaProvider {
    async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream> {
        let endpoint = self.endpoint(&ctx.service)?;
        let request = self
            .client
            .post(self.url(&endpoint))
            .header("content-type", "application/json")
            .body(ctx.body.clone())
            .timeout(ctx.timeout);

        let response = tokio::select! {
            r = request.send() => r?,
            () = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.bytes().await.unwrap_or_default();
            return Err(if status >= 500 {
                GatewayError::ProviderUnavailable(snippet(&body))
            } else {
                GatewayError::BadRequest(snippet(&body))
            });
        }

        let cancel = ctx.cancel.clone();
        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            loop {
                let chunk = tokio::select! {
                    c = bytes.next() => c,
                    () = cancel.cancelled() => {
                        yield Err(GatewayError::Cancelled);
                        return;
                    }
                };
                match chunk {
                    Some(Ok(data)) => {
                        yield Ok(ChunkData {
                            data,
                            is_final: false,
                            metadata: HashMap::new(),
                        });
                    }
                    Some(Err(e)) => {
                        yield Err(GatewayError::from(e));
                        return;
                    }
                    None => break,
                }
            }
            yield Ok(ChunkData {
                data: Bytes::new(),
                is_final: true,
                metadata: HashMap::new(),
            });
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ModelOps for OllamaProvider {
    async fn pull_model(&self, model: &str) -> Result<()> {
        let response = self
            .post_json(
                "/api/pull",
                serde_json::json!({"name": model, "stream": false}),
                Duration::from_secs(3600),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::ModelPreparationFailed(format!(
                "pull {model}: engine returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn pull_model_stream(&self, model: &str) -> Result<ChunkStream> {
        let response = self
            .post_json(
                "/api/pull",
                serde_json::json!({"name": model, "stream": true}),
                Duration::from_secs(3600),
            )
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::ModelPreparationFailed(format!(
                "pull {model}: engine returned {}",
                response.status()
            )));
        }
        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(data) => yield Ok(ChunkData { data, is_final: false, metadata: HashMap::new() }),
                    Err(e) => {
                        yield Err(GatewayError::from(e));
                        return;
                    }
                }
            }
            yield Ok(ChunkData { data: Bytes::new(), is_final: true, metadata: HashMap::new() });
        };
        Ok(Box::pin(stream))
    }

    async fn delete_model(&self, model: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url("/api/delete"))
            .json(&serde_json::json!({"name": model}))
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        // Deleting an absent model is a no-op.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(GatewayError::Internal(format!(
                "delete {model}: engine returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(model_names(&body))
    }

    async fn load_model(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        // keep_alive = -1 pins the model resident until the gateway unloads it.
        let request = self.post_json(
            "/api/generate",
            serde_json::json!({"model": model, "keep_alive": -1}),
            LOAD_TIMEOUT,
        );
        let response = tokio::select! {
            r = request => r,
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
        }
        .map_err(|e| GatewayError::ModelPreparationFailed(format!("load {model}: {e}")))?;

        if !response.status().is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(GatewayError::ModelPreparationFailed(format!(
                "load {model}: {}",
                snippet(&body)
            )));
        }
        Ok(())
    }

    async fn unload_model(&self, model: &str) -> Result<()> {
        let response = self
            .post_json(
                "/api/generate",
                serde_json::json!({"model": model, "keep_alive": 0}),
                UNLOAD_TIMEOUT,
            )
            .await
            .map_err(|e| GatewayError::ModelPreparationFailed(format!("unload {model}: {e}")))?;

        // "not loaded"/"not found" unloads are fine.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let body = response.bytes().await.unwrap_or_default();
            return Err(GatewayError::ModelPreparationFailed(format!(
                "unload {model}: {}",
                snippet(&body)
            )));
        }
        Ok(())
    }

    async fn running_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("/api/ps"))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(model_names(&body))
    }

    async fn supported_models(&self) -> Result<Vec<String>> {
        self.list_models().await
    }
}

#[async_trait]
impl EngineLifecycle for OllamaProvider {
    async fn start(&self) -> Result<()> {
        // Engine binaries are launched outside the gateway; starting means
        // verifying the engine answers.
        self.health().await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/api/version"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::ProviderUnavailable(format!(
                "{}: engine returned {}",
                self.name,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl EngineInstaller for OllamaProvider {
    async fn check(&self) -> Result<bool> {
        Ok(self.health().await.is_ok())
    }

    async fn install(&self) -> Result<()> {
        Err(GatewayError::ProviderUnavailable(format!(
            "{}: engine installation is managed outside the gateway",
            self.name
        )))
    }

    async fn init_env(&self) -> Result<()> {
        Ok(())
    }

    async fn upgrade(&self) -> Result<()> {
        Err(GatewayError::ProviderUnavailable(format!(
            "{}: engine upgrade is managed outside the gateway",
            self.name
        )))
    }
}

#[async_trait]
impl EngineInfo for OllamaProvider {
    async fn version(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url("/api/version"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(body
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn operate_status(&self) -> Result<String> {
        Ok(self.operate_status.lock().clone())
    }

    async fn set_operate_status(&self, status: &str) -> Result<()> {
        *self.operate_status.lock() = status.to_string();
        Ok(())
    }
}

/// Generic OpenAI-compatible remote provider.
///
/// Forwards the caller's body to the remote endpoint with bearer credentials
/// from the provider record. Lifecycle, installer, and model management stay
/// unimplemented: a cloud endpoint has no engine to manage.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    endpoints: HashMap<String, String>,
    client: Client,
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatProvider {
    /// Create a provider against a remote base URL.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            crate::domain::service::CHAT.to_string(),
            "/v1/chat/completions".to_string(),
        );
        endpoints.insert(crate::domain::service::EMBED.to_string(), "/v1/embeddings".to_string());
        endpoints.insert(
            crate::domain::service::TEXT_TO_IMAGE.to_string(),
            "/v1/images/generations".to_string(),
        );

        Self {
            name: name.into(),
            base_url: base_url.into(),
            endpoints,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, ctx: &InvokeContext) -> Result<reqwest::RequestBuilder> {
        let endpoint = self
            .endpoints
            .get(&ctx.service)
            .ok_or_else(|| GatewayError::ServiceNotFound(format!("{}: {}", self.name, ctx.service)))?;

        let mut request = self
            .client
            .post(self.url(endpoint))
            .header("content-type", "application/json")
            .body(ctx.body.clone())
            .timeout(ctx.timeout);
        if let Some(key) = ctx.auth.get("api_key") {
            request = request.header("authorization", format!("Bearer {key}"));
        }
        Ok(request)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ServiceSource {
        ServiceSource::Remote
    }

    async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome> {
        let request = self.request(&ctx)?;
        let response = tokio::select! {
            r = request.send() => r?,
            () = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        if status >= 500 {
            return Err(GatewayError::ProviderUnavailable(snippet(&body)));
        }
        if status >= 400 {
            return Err(GatewayError::BadRequest(snippet(&body)));
        }
        Ok(InvokeOutcome {
            status,
            body,
            metadata: HashMap::new(),
        })
    }

    fn as_stream(&self) -> Option<&dyn StreamInvoker> {
        Some(self)
    }
}

#[async_trait]
impl StreamInvoker for OpenAiCompatProvider {
    async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream> {
        let request = self.request(&ctx)?;
        let response = tokio::select! {
            r = request.send() => r?,
            () = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.bytes().await.unwrap_or_default();
            return Err(if status >= 500 {
                GatewayError::ProviderUnavailable(snippet(&body))
            } else {
                GatewayError::BadRequest(snippet(&body))
            });
        }

        let cancel = ctx.cancel.clone();
        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            loop {
                let chunk = tokio::select! {
                    c = bytes.next() => c,
                    () = cancel.cancelled() => {
                        yield Err(GatewayError::Cancelled);
                        return;
                    }
                };
                match chunk {
                    Some(Ok(data)) => {
                        yield Ok(ChunkData { data, is_final: false, metadata: HashMap::new() });
                    }
                    Some(Err(e)) => {
                        yield Err(GatewayError::from(e));
                        return;
                    }
                    None => break,
                }
            }
            yield Ok(ChunkData { data: Bytes::new(), is_final: true, metadata: HashMap::new() });
        };
        Ok(Box::pin(stream))
    }
}

/// Truncate an error body for messages. Cuts on a char boundary so a
/// multi-byte codepoint straddling the limit cannot panic the slice.
fn snippet(body: &[u8]) -> String {
    const LIMIT: usize = 256;
    let text = String::from_utf8_lossy(body);
    if text.len() <= LIMIT {
        return text.into_owned();
    }
    let truncated: String = text
        .char_indices()
        .take_while(|(i, _)| *i < LIMIT)
        .map(|(_, c)| c)
        .collect();
    format!("{truncated}…")
}

/// Pull `models[].name` out of an Ollama-style listing.
fn model_names(body: &serde_json::Value) -> Vec<String> {
    body.get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names_parsing() {
        let body = serde_json::json!({
            "models": [{"name": "qwen2.5:7b"}, {"name": "llama3.1:8b"}, {"nameless": true}]
        });
        assert_eq!(model_names(&body), vec!["qwen2.5:7b", "llama3.1:8b"]);
        assert!(model_names(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn test_snippet_truncates() {
        let long = vec![b'x'; 1000];
        assert!(snippet(&long).len() < 300);
        assert_eq!(snippet(b"short"), "short");
    }

    #[test]
    fn test_snippet_cuts_on_char_boundary() {
        // 300 bytes of multi-byte codepoints: byte 256 lands mid-codepoint.
        let unicode = "é".repeat(150);
        let cut = snippet(unicode.as_bytes());
        assert!(cut.ends_with('…'));
        assert!(cut.chars().all(|c| c == 'é' || c == '…'));

        let emoji = format!("{}{}", "x".repeat(255), "🦀🦀🦀");
        assert!(snippet(emoji.as_bytes()).ends_with('…'));
    }

    #[test]
    fn test_capability_surface() {
        let local = OllamaProvider::new("local_ollama", "http://127.0.0.1:11434");
        assert!(local.model_ops().is_some());
        assert!(local.lifecycle().is_some());
        assert!(local.as_stream().is_some());
        assert!(local.as_bidi().is_none());

        let remote = OpenAiCompatProvider::new("remote_openai", "https://api.openai.com");
        assert_eq!(remote.source(), ServiceSource::Remote);
        assert!(remote.model_ops().is_none());
        assert!(remote.lifecycle().is_none());
        assert!(remote.as_stream().is_some());
    }

    #[test]
    fn test_url_joining() {
        let p = OllamaProvider::new("p", "http://localhost:11434/");
        assert_eq!(p.url("/api/chat"), "http://localhost:11434/api/chat");
    }
}
