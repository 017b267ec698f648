//! Shared fixtures for integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use aog::config::{MemoryConfig, SchedulerConfig};
use aog::domain::{ModelRecord, ProviderScope, ServiceProviderRecord, ServiceSource};
use aog::error::{GatewayError, Result};
use aog::flavor::FlavorRegistry;
use aog::memory::MemoryManager;
use aog::provider::{
    ChunkData, ChunkStream, InvokeContext, InvokeOutcome, ModelOps, Provider, ProviderFactory,
    ProviderHandle, StreamInvoker,
};
use aog::scheduler::SchedulerDeps;
use aog::store::Datastore;
use aog::ws::WsConnectionManager;

/// A provider whose behavior the test scripts: configurable latencies,
/// scripted chunks, a call log for asserting orchestration order.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    pub provider_name: String,
    pub chunks: Vec<&'static str>,
    pub calls: Mutex<Vec<String>>,
    pub load_delay: Duration,
    pub invoke_delay: Duration,
    pub failing_model: Option<String>,
}

impl ScriptedProvider {
    pub fn named(name: &str) -> Self {
        Self {
            provider_name: name.to_string(),
            chunks: vec!["hello"],
            ..Self::default()
        }
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn source(&self) -> ServiceSource {
        ServiceSource::Local
    }

    async fn invoke(&self, ctx: InvokeContext) -> Result<InvokeOutcome> {
        if !self.invoke_delay.is_zero() {
            tokio::time::sleep(self.invoke_delay).await;
        }
        self.record(format!("invoke:{}", ctx.service));
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
impl StreamInvoker for ScriptedProvider {
    async fn invoke_stream(&self, ctx: InvokeContext) -> Result<ChunkStream> {
        if !self.invoke_delay.is_zero() {
            tokio::time::sleep(self.invoke_delay).await;
        }
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
impl ModelOps for ScriptedProvider {
    async fn pull_model(&self, model: &str) -> Result<()> {
        self.record(format!("pull:{model}"));
        Ok(())
    }

    async fn pull_model_stream(&self, _model: &str) -> Result<ChunkStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn delete_model(&self, model: &str) -> Result<()> {
        self.record(format!("delete:{model}"));
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn load_model(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        self.record(format!("load:{model}"));
        if !self.load_delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.load_delay) => {}
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }
        if self.failing_model.as_deref() == Some(model) {
            return Err(GatewayError::ModelPreparationFailed(format!(
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
        Ok(Vec::new())
    }

    async fn supported_models(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A gateway core wired around one scripted local engine, with `chat` and
/// `embed` rows seeded for the given models.
pub struct TestGateway {
    pub deps: SchedulerDeps,
    pub provider: Arc<ScriptedProvider>,
}

impl TestGateway {
    pub fn new(provider: ScriptedProvider, chat_models: &[&str]) -> Self {
        Self::with_memory_config(provider, chat_models, MemoryConfig::default())
    }

    pub fn with_memory_config(
        provider: ScriptedProvider,
        chat_models: &[&str],
        memory_config: MemoryConfig,
    ) -> Self {
        let name = provider.provider_name.clone();
        let provider = Arc::new(provider);

        let store = Datastore::open_in_memory().unwrap();
        let flavors = FlavorRegistry::with_builtins();
        let providers = Arc::new(ProviderFactory::new());
        providers.register_builtin(ProviderHandle::from_provider(
            Arc::clone(&provider) as Arc<dyn Provider>
        ));

        let memory = MemoryManager::new(memory_config);
        memory.attach_factory(Arc::clone(&providers));
        memory.register_engine(Arc::clone(&provider) as Arc<dyn Provider>);

        for service in ["chat", "embed"] {
            let row = ServiceProviderRecord::new(&name, service, ServiceSource::Local)
                .with_flavor("ollama")
                .with_scope(ProviderScope::Builtin);
            store.upsert_provider(&row).unwrap();
        }
        for model in chat_models {
            store
                .upsert_model(&ModelRecord::downloaded(*model, &name, "chat", ServiceSource::Local))
                .unwrap();
        }

        let deps = SchedulerDeps {
            store,
            flavors,
            providers,
            memory,
            ws: WsConnectionManager::new(),
            config: SchedulerConfig::default(),
        };
        Self { deps, provider }
    }
}
