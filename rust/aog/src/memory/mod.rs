//! Model memory manager.
//!
//! Local inference engines typically hold one model at a time: loading a
//! second evicts the first, and concurrent switches corrupt engine state.
//! This module enforces that — per engine — through three pieces:
//!
//! - [`queue::ModelQueue`]: bounded FIFO admission with a serial worker
//! - [`loader::ModelLoader`]: the model state machine and current pointer
//! - a cleaner task that evicts models idle past the configured timeout
//!
//! The manager is the composition root for those pieces, keyed by provider
//! name. Embed requests bypass the queue through [`MemoryManager::load_direct`]
//! to stay lightweight.

pub mod loader;
pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MemoryConfig;
use crate::error::{GatewayError, Result};
use crate::provider::Provider;

pub use loader::{ModelLifecycle, ModelLoader, ModelState};
pub use queue::{ModelQueue, QueuedRequest};

/// Per-engine loader + queue pair.
#[derive(Clone)]
struct EngineMemory {
    loader: Arc<ModelLoader>,
    queue: Arc<ModelQueue>,
}

/// Gateway-wide model memory manager.
pub struct MemoryManager {
    config: MemoryConfig,
    engines: RwLock<HashMap<String, EngineMemory>>,
    /// Lets admissions lazily create queues for engines the gateway has not
    /// touched yet (plugin providers start on first use).
    factory: RwLock<Option<Arc<crate::provider::ProviderFactory>>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("engines", &self.engines.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Create a manager with the given tuning.
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            engines: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            cleaner: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Attach the provider factory so unknown engines can be registered
    /// lazily at admission time.
    pub fn attach_factory(&self, factory: Arc<crate::provider::ProviderFactory>) {
        *self.factory.write() = Some(factory);
    }

    /// Register a local engine provider: builds its loader and queue and
    /// asynchronously clears any models the engine inherited from a
    /// previous owner.
    pub fn register_engine(&self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.engines.read().contains_key(&name) {
            return;
        }
        if provider.model_ops().is_none() {
            tracing::debug!(provider = %name, "No model management; skipping memory tracking");
            return;
        }

        let loader = Arc::new(ModelLoader::new(provider));
        let queue = ModelQueue::start(Arc::clone(&loader), self.config.queue_size);

        let reset_loader = Arc::clone(&loader);
        tokio::spawn(async move {
            reset_loader.reset_inherited().await;
        });

        tracing::info!(provider = %name, "Engine registered with memory manager");
        self.engines.write().insert(name, EngineMemory { loader, queue });
    }

    /// The engine entry for a provider, creating a lazily-resolved one when
    /// the factory is attached.
    fn ensure_engine(&self, provider_name: &str) -> Result<EngineMemory> {
        if let Some(engine) = self.engines.read().get(provider_name).cloned() {
            return Ok(engine);
        }

        let factory = self
            .factory
            .read()
            .clone()
            .ok_or_else(|| GatewayError::ProviderNotFound(provider_name.to_string()))?;

        let mut engines = self.engines.write();
        let engine = engines
            .entry(provider_name.to_string())
            .or_insert_with(|| {
                tracing::info!(provider = %provider_name, "Engine registered lazily with memory manager");
                let loader = Arc::new(ModelLoader::deferred(provider_name, factory));
                let queue = ModelQueue::start(Arc::clone(&loader), self.config.queue_size);
                EngineMemory { loader, queue }
            })
            .clone();
        Ok(engine)
    }

    /// Enqueue an admission request for a local non-embed task.
    pub fn enqueue(&self, provider_name: &str, request: QueuedRequest) -> Result<()> {
        self.ensure_engine(provider_name)?.queue.enqueue(request)
    }

    /// Load a model directly, bypassing the queue. Embed models are small
    /// and load idempotently; serializing them behind chat switches would
    /// add latency for nothing.
    pub async fn load_direct(
        &self,
        provider_name: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_engine(provider_name)?
            .loader
            .ensure_loaded(model, cancel)
            .await
    }

    /// Upper bound on one admission (queue wait plus model switch).
    pub fn queue_timeout(&self) -> std::time::Duration {
        self.config.queue_timeout()
    }

    /// Admission requests waiting or processing across all engines.
    pub fn active_requests(&self) -> usize {
        self.engines
            .read()
            .values()
            .map(|e| e.queue.active_requests())
            .sum()
    }

    /// The loader for an engine. Used by tests and status endpoints.
    pub fn loader(&self, provider_name: &str) -> Option<Arc<ModelLoader>> {
        self.engines.read().get(provider_name).map(|e| Arc::clone(&e.loader))
    }

    /// Start the idle-eviction cleaner.
    pub fn start_cleaner(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut guard = self.cleaner.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep_idle().await,
                    () = manager.shutdown.cancelled() => return,
                }
            }
        }));
    }

    /// One cleaner pass: evict models idle past the timeout, but only while
    /// no admissions are active anywhere.
    async fn sweep_idle(&self) {
        if self.active_requests() > 0 {
            return;
        }
        let engines: Vec<EngineMemory> = self.engines.read().values().cloned().collect();
        for engine in engines {
            for model in engine.loader.idle_models(self.config.idle_timeout()) {
                tracing::info!(model = %model, "Evicting idle model");
                if let Err(e) = engine.loader.force_unload(&model).await {
                    tracing::warn!(model = %model, error = %e, "Idle eviction failed");
                }
            }
        }
    }

    /// Stop the cleaner and the queue workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.abort();
        }
        for engine in self.engines.read().values() {
            engine.queue.shutdown();
        }
    }
}
