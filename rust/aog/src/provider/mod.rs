//! Provider abstraction.
//!
//! A provider is a concrete backend instance: a running local engine or a
//! remote cloud endpoint. The surface is a base [`Provider`] trait for unary
//! invocation plus narrow capability traits the invoker probes at runtime:
//! [`StreamInvoker`] and [`BidiInvoker`] for the richer invocation modes,
//! [`ModelOps`] / [`EngineLifecycle`] / [`EngineInstaller`] / [`EngineInfo`]
//! for engine management on local providers.
//!
//! Capability declarations in manifests must be consistent with the traits a
//! concrete provider actually exposes; dispatch checks declarations first and
//! the invoker double-checks the trait probe.

pub mod builtin;
pub mod factory;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::ServiceSource;
use crate::error::Result;

pub use factory::{ProviderFactory, ProviderResolver};

/// Credentials forwarded to a provider verbatim.
pub type AuthInfo = HashMap<String, String>;

/// Everything an invocation needs, assembled by the run step.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// Service being invoked (chat, embed, ...).
    pub service: String,
    /// Resolved model name.
    pub model: String,
    /// Provider credentials.
    pub auth: AuthInfo,
    /// Raw request body.
    pub body: Bytes,
    /// Request headers the provider may need.
    pub headers: HashMap<String, String>,
    /// Invocation timeout.
    pub timeout: Duration,
    /// Cancelled when the caller disconnects.
    pub cancel: CancellationToken,
}

/// Outcome of a unary invocation: a synthetic HTTP response.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    /// HTTP-ish status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
    /// Response metadata (headers).
    pub metadata: HashMap<String, String>,
}

impl InvokeOutcome {
    /// A 200 outcome with a body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            metadata: HashMap::new(),
        }
    }
}

/// One chunk of a streaming invocation.
#[derive(Debug, Clone)]
pub struct ChunkData {
    /// Chunk payload.
    pub data: Bytes,
    /// Set on the last chunk.
    pub is_final: bool,
    /// Chunk metadata.
    pub metadata: HashMap<String, String>,
}

/// A lazy sequence of streaming chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkData>> + Send>>;

/// One message of a bidirectional exchange, in either direction.
#[derive(Debug, Clone)]
pub enum BidiPayload {
    /// UTF-8 text.
    Text(String),
    /// Binary data.
    Binary(Bytes),
    /// Keep-alive ping.
    Ping,
    /// Keep-alive pong.
    Pong,
    /// Close the exchange.
    Close,
}

/// Base capability: unary invocation plus identity.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Unique provider name.
    fn name(&self) -> &str;

    /// Where this provider's inference runs.
    fn source(&self) -> ServiceSource;

    /// Single request/response invocation.
    async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome>;

    /// Streaming capability, if implemented.
    fn as_stream(&self) -> Option<&dyn StreamInvoker> {
        None
    }

    /// Bidirectional capability, if implemented.
    fn as_bidi(&self) -> Option<&dyn BidiInvoker> {
        None
    }

    /// Model management, for local providers.
    fn model_ops(&self) -> Option<&dyn ModelOps> {
        None
    }

    /// Engine lifecycle, for local providers.
    fn lifecycle(&self) -> Option<&dyn EngineLifecycle> {
        None
    }

    /// Engine installation, for local providers.
    fn installer(&self) -> Option<&dyn EngineInstaller> {
        None
    }

    /// Engine information, for local providers.
    fn info(&self) -> Option<&dyn EngineInfo> {
        None
    }
}

/// Server-streaming invocation capability.
#[async_trait]
pub trait StreamInvoker: Send + Sync {
    /// Invoke and return a lazy chunk sequence.
    async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream>;
}

/// Bidirectional invocation capability.
///
/// The invoker owns the channel pair; the provider drives its side until the
/// exchange closes or `ctx.cancel` fires.
#[async_trait]
pub trait BidiInvoker: Send + Sync {
    /// Run a bidirectional exchange over the given channels.
    async fn invoke_bidi(
        &self,
        ctx: InvokeContext,
        incoming: mpsc::Receiver<BidiPayload>,
        outgoing: mpsc::Sender<BidiPayload>,
    ) -> Result<()>;
}

/// Model management surface of a local engine.
#[async_trait]
pub trait ModelOps: Send + Sync {
    /// Download a model.
    async fn pull_model(&self, model: &str) -> Result<()>;

    /// Download a model, streaming progress chunks.
    async fn pull_model_stream(&self, model: &str) -> Result<ChunkStream>;

    /// Delete a downloaded model.
    async fn delete_model(&self, model: &str) -> Result<()>;

    /// Installed models.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Load a model into engine memory. Idempotent.
    async fn load_model(&self, model: &str, cancel: &CancellationToken) -> Result<()>;

    /// Unload a model from engine memory. Unloading a model that is not
    /// loaded is not an error.
    async fn unload_model(&self, model: &str) -> Result<()>;

    /// Models currently resident in engine memory.
    async fn running_models(&self) -> Result<Vec<String>>;

    /// Models the provider can serve at all.
    async fn supported_models(&self) -> Result<Vec<String>>;
}

/// Engine lifecycle surface of a local provider.
#[async_trait]
pub trait EngineLifecycle: Send + Sync {
    /// Bring the engine up (or verify it is up).
    async fn start(&self) -> Result<()>;

    /// Stop the engine.
    async fn stop(&self) -> Result<()>;

    /// Health probe.
    async fn health(&self) -> Result<()>;
}

/// Engine installation surface of a local provider.
#[async_trait]
pub trait EngineInstaller: Send + Sync {
    /// Whether the engine is installed and usable.
    async fn check(&self) -> Result<bool>;

    /// Install the engine.
    async fn install(&self) -> Result<()>;

    /// Prepare the engine environment.
    async fn init_env(&self) -> Result<()>;

    /// Upgrade the engine in place.
    async fn upgrade(&self) -> Result<()>;
}

/// Engine information surface of a local provider.
#[async_trait]
pub trait EngineInfo: Send + Sync {
    /// Engine version string.
    async fn version(&self) -> Result<String>;

    /// Current operate status.
    async fn operate_status(&self) -> Result<String>;

    /// Set the operate status.
    async fn set_operate_status(&self, status: &str) -> Result<()>;
}

/// A resolved provider: the tagged local/remote variant handed to callers.
#[derive(Clone)]
pub enum ProviderHandle {
    /// A locally installed engine.
    Local(Arc<dyn Provider>),
    /// A remote cloud API.
    Remote(Arc<dyn Provider>),
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(p) => write!(f, "ProviderHandle::Local({})", p.name()),
            Self::Remote(p) => write!(f, "ProviderHandle::Remote({})", p.name()),
        }
    }
}

impl ProviderHandle {
    /// Wrap a provider according to its source.
    pub fn from_provider(provider: Arc<dyn Provider>) -> Self {
        match provider.source() {
            ServiceSource::Local => Self::Local(provider),
            ServiceSource::Remote => Self::Remote(provider),
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        match self {
            Self::Local(p) | Self::Remote(p) => p,
        }
    }

    /// Where this provider runs.
    pub fn source(&self) -> ServiceSource {
        match self {
            Self::Local(_) => ServiceSource::Local,
            Self::Remote(_) => ServiceSource::Remote,
        }
    }

    /// The provider's name.
    pub fn name(&self) -> &str {
        self.provider().name()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted provider for scheduler and memory-manager tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// In-process provider whose behavior tests can script.
    #[derive(Debug, Default)]
    pub struct MockProvider {
        /// Provider name.
        pub provider_name: String,
        /// Chunks each streaming invoke yields.
        pub chunks: Vec<&'static str>,
        /// Calls observed, in order (e.g. `load:m1`, `invoke:chat`).
        pub calls: Mutex<Vec<String>>,
        /// Number of unary invocations.
        pub invocations: AtomicUsize,
        /// Artificial latency per model load.
        pub load_delay: Duration,
        /// When set, loads of this model fail.
        pub failing_model: Option<String>,
        /// Models the engine reports as resident at startup.
        pub initial_running: Vec<String>,
    }

    impl MockProvider {
        /// A named mock with sensible defaults.
        pub fn named(name: &str) -> Self {
            Self {
                provider_name: name.to_string(),
                chunks: vec!["hello"],
                ..Self::default()
            }
        }

        /// Recorded call log.
        pub fn call_log(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.provider_name
        }

        fn source(&self) -> ServiceSource {
            ServiceSource::Local
        }

        async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome> {
            self.record(format!("invoke:{}", ctx.service));
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(InvokeOutcome::ok(Bytes::from_static(b"{\"done\":true}")))
        }

        fn as_stream(&self) -> Option<&dyn StreamInvoker> {
            Some(self)
        }

        fn model_ops(&self) -> Option<&dyn ModelOps> {
            Some(self)
        }
    }

    #[async_trait]
    impl StreamInvoker for MockProvider {
        async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream> {
            self.record(format!("stream:{}", ctx.service));
            let chunks = self.chunks.clone();
            let stream = async_stream::stream! {
                let last = chunks.len().saturating_sub(1);
                for (i, chunk) in chunks.into_iter().enumerate() {
                    yield Ok(ChunkData {
                        data: Bytes::from_static(chunk.as_bytes()),
                        is_final: i == last,
                        metadata: HashMap::new(),
                    });
                }
            };
            Ok(Box::pin(stream))
        }
    }

    #[async_trait]
    impl ModelOps for MockProvider {
        async fn pull_model(&self, model: &str) -> Result<()> {
            self.record(format!("pull:{model}"));
            Ok(())
        }

        async fn pull_model_stream(&self, model: &str) -> Result<ChunkStream> {
            self.record(format!("pull_stream:{model}"));
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn delete_model(&self, model: &str) -> Result<()> {
            self.record(format!("delete:{model}"));
            Ok(())
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn load_model(&self, model: &str, _cancel: &CancellationToken) -> Result<()> {
            self.record(format!("load:{model}"));
            if !self.load_delay.is_zero() {
                tokio::time::sleep(self.load_delay).await;
            }
            if self.failing_model.as_deref() == Some(model) {
                return Err(crate::error::GatewayError::ModelPreparationFailed(format!(
                    "scripted failure loading {model}"
                )));
            }
            Ok(())
        }

        async fn unload_model(&self, model: &str) -> Result<()> {
            self.record(format!("unload:{model}"));
            Ok(())
        }

        async fn running_models(&self) -> Result<Vec<String>> {
            Ok(self.initial_running.clone())
        }

        async fn supported_models(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }
}
