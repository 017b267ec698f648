//! Model loader: per-engine model state machine.
//!
//! Owns the model-state map for one provider, performs load/unload through
//! the provider handle, and maintains the current-model pointer. Transitions
//! follow `unloaded → loading → idle ⇄ in_use → unloading → unloaded`; a
//! waiter that observes `loading` or `unloading` parks on the change signal
//! until the transition settles.
//!
//! Invariants (checked by tests):
//! - `ref_count > 0` iff status is `in_use`
//! - a model in `loading`/`unloading` is never observable as `idle`
//! - `current_model` is empty or names a model in `idle`/`in_use`
//! - at most one load/unload is in flight per engine (enforced by the queue
//!   worker; the loader additionally serializes conflicting transitions)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::provider::Provider;

/// Lifecycle status of one model on one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLifecycle {
    /// Not resident.
    Unloaded,
    /// Load in flight.
    Loading,
    /// Resident, no holders.
    Idle,
    /// Resident with holders.
    InUse,
    /// Unload in flight.
    Unloading,
}

/// State of one model.
#[derive(Debug, Clone)]
pub struct ModelState {
    /// Lifecycle status.
    pub status: ModelLifecycle,
    /// Active holders; positive only in `InUse`.
    pub ref_count: u32,
    /// Last acquire/release time.
    pub last_used_at: Instant,
    /// When the model finished loading.
    pub loaded_at: Option<Instant>,
}

impl ModelState {
    fn unloaded() -> Self {
        Self {
            status: ModelLifecycle::Unloaded,
            ref_count: 0,
            last_used_at: Instant::now(),
            loaded_at: None,
        }
    }
}

struct LoaderInner {
    states: HashMap<String, ModelState>,
    current: Option<String>,
}

/// Per-engine model loader.
///
/// The provider instance may be resolved lazily: plugin engines only start
/// on first use, so a loader created with [`ModelLoader::deferred`] pulls
/// its provider through the factory when the first load runs.
pub struct ModelLoader {
    provider_name: String,
    factory: Option<Arc<crate::provider::ProviderFactory>>,
    resolved: tokio::sync::OnceCell<Arc<dyn Provider>>,
    inner: Mutex<LoaderInner>,
    changed: Notify,
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ModelLoader")
            .field("provider", &self.provider_name)
            .field("current", &inner.current)
            .field("models", &inner.states.len())
            .finish()
    }
}

impl ModelLoader {
    /// Create a loader over an already-resolved provider.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider_name: provider.name().to_string(),
            factory: None,
            resolved: tokio::sync::OnceCell::new_with(Some(provider)),
            inner: Mutex::new(LoaderInner {
                states: HashMap::new(),
                current: None,
            }),
            changed: Notify::new(),
        }
    }

    /// Create a loader that resolves its provider through the factory on
    /// first use.
    pub fn deferred(
        provider_name: impl Into<String>,
        factory: Arc<crate::provider::ProviderFactory>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            factory: Some(factory),
            resolved: tokio::sync::OnceCell::new(),
            inner: Mutex::new(LoaderInner {
                states: HashMap::new(),
                current: None,
            }),
            changed: Notify::new(),
        }
    }

    /// The provider instance, resolving (and resetting inherited residents)
    /// on first touch for deferred loaders.
    async fn provider(&self) -> Result<Arc<dyn Provider>> {
        let provider = self
            .resolved
            .get_or_try_init(|| async {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    GatewayError::internal(format!(
                        "{}: loader has neither provider nor factory",
                        self.provider_name
                    ))
                })?;
                let handle = factory.get(&self.provider_name).await?;
                let provider = Arc::clone(handle.provider());
                clear_inherited(&self.provider_name, &provider).await;
                Ok::<_, GatewayError>(provider)
            })
            .await?;
        Ok(Arc::clone(provider))
    }

    /// The current model, if any.
    pub fn current_model(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    /// Snapshot of one model's state.
    pub fn state_of(&self, model: &str) -> ModelState {
        self.inner
            .lock()
            .states
            .get(model)
            .cloned()
            .unwrap_or_else(ModelState::unloaded)
    }

    /// Ensure a model is resident. Idempotent: a model already `idle` or
    /// `in_use` returns immediately; concurrent callers of a `loading`
    /// model wait for the one load to settle.
    pub async fn ensure_loaded(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                let state = inner
                    .states
                    .entry(model.to_string())
                    .or_insert_with(ModelState::unloaded);
                match state.status {
                    ModelLifecycle::Idle | ModelLifecycle::InUse => return Ok(()),
                    ModelLifecycle::Unloaded => {
                        state.status = ModelLifecycle::Loading;
                        break;
                    }
                    ModelLifecycle::Loading | ModelLifecycle::Unloading => {}
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }

        self.do_load(model, cancel).await
    }

    async fn do_load(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        let provider = match self.provider().await {
            Ok(provider) => provider,
            Err(e) => {
                self.settle(model, ModelLifecycle::Unloaded);
                return Err(e);
            }
        };
        let ops = match provider.model_ops() {
            Some(ops) => ops,
            None => {
                self.settle(model, ModelLifecycle::Unloaded);
                return Err(GatewayError::ModelPreparationFailed(format!(
                    "{}: provider has no model management",
                    self.provider_name
                )));
            }
        };

        tracing::info!(provider = %self.provider_name, model, "Loading model");
        match ops.load_model(model, cancel).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                if let Some(state) = inner.states.get_mut(model) {
                    state.status = ModelLifecycle::Idle;
                    state.ref_count = 0;
                    state.loaded_at = Some(Instant::now());
                    state.last_used_at = Instant::now();
                }
                inner.current = Some(model.to_string());
                drop(inner);
                self.changed.notify_waiters();
                Ok(())
            }
            Err(e) => {
                self.settle(model, ModelLifecycle::Unloaded);
                Err(match e {
                    GatewayError::Cancelled => GatewayError::Cancelled,
                    other => GatewayError::ModelPreparationFailed(other.to_string()),
                })
            }
        }
    }

    /// Switch the engine to `model`: unload the current resident (ignoring
    /// "not loaded"), then load the target. A no-op when the target is
    /// already current and resident.
    pub async fn switch_model(&self, model: &str, cancel: &CancellationToken) -> Result<()> {
        let previous = {
            let inner = self.inner.lock();
            match inner.current.as_deref() {
                Some(current) if current != model => Some(current.to_string()),
                _ => None,
            }
        };

        if let Some(previous) = previous {
            tracing::info!(
                provider = %self.provider_name,
                from = %previous,
                to = model,
                "Switching model"
            );
            self.force_unload(&previous).await?;
        }
        self.ensure_loaded(model, cancel).await
    }

    /// Unload a model. Waits out an in-flight load/unload and any holders;
    /// unloading a model that is not resident succeeds trivially.
    pub async fn force_unload(&self, model: &str) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                let Some(state) = inner.states.get_mut(model) else {
                    return Ok(());
                };
                match state.status {
                    ModelLifecycle::Unloaded => return Ok(()),
                    ModelLifecycle::Idle => {
                        state.status = ModelLifecycle::Unloading;
                        break;
                    }
                    ModelLifecycle::Loading | ModelLifecycle::Unloading | ModelLifecycle::InUse => {}
                }
            }

            notified.await;
        }

        let result = match self.provider().await {
            Ok(provider) => match provider.model_ops() {
                Some(ops) => ops.unload_model(model).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };

        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(model) {
            state.status = ModelLifecycle::Unloaded;
            state.loaded_at = None;
        }
        if inner.current.as_deref() == Some(model) {
            inner.current = None;
        }
        drop(inner);
        self.changed.notify_waiters();

        result.map_err(|e| GatewayError::ModelPreparationFailed(e.to_string()))
    }

    /// Acquire a resident model for a running task.
    pub fn mark_in_use(&self, model: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .states
            .get_mut(model)
            .ok_or_else(|| GatewayError::internal(format!("mark_in_use on unknown model {model}")))?;
        match state.status {
            ModelLifecycle::Idle | ModelLifecycle::InUse => {
                state.status = ModelLifecycle::InUse;
                state.ref_count += 1;
                state.last_used_at = Instant::now();
                Ok(())
            }
            other => Err(GatewayError::internal(format!(
                "mark_in_use on {model} in state {other:?}"
            ))),
        }
    }

    /// Release a holder; the model settles to `idle` when the last one goes.
    pub fn mark_idle(&self, model: &str) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(model) {
            state.ref_count = state.ref_count.saturating_sub(1);
            state.last_used_at = Instant::now();
            if state.ref_count == 0 && state.status == ModelLifecycle::InUse {
                state.status = ModelLifecycle::Idle;
            }
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Models idle for longer than `timeout` with no holders.
    pub fn idle_models(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .lock()
            .states
            .iter()
            .filter(|(_, s)| {
                s.status == ModelLifecycle::Idle
                    && s.ref_count == 0
                    && now.duration_since(s.last_used_at) > timeout
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Clear inherited residents at startup: the gateway owns the engine's
    /// loaded-model set, so anything the engine reports resident is unloaded.
    pub async fn reset_inherited(&self) {
        let Ok(provider) = self.provider().await else {
            return;
        };
        clear_inherited(&self.provider_name, &provider).await;
    }

    fn settle(&self, model: &str, status: ModelLifecycle) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(model) {
            state.status = status;
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// The provider name this loader drives.
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }
}

/// Unload whatever the engine reports resident.
async fn clear_inherited(provider_name: &str, provider: &Arc<dyn Provider>) {
    let Some(ops) = provider.model_ops() else {
        return;
    };
    let running = match ops.running_models().await {
        Ok(models) => models,
        Err(e) => {
            tracing::debug!(provider = %provider_name, error = %e, "Cannot list running models");
            return;
        }
    };
    for model in running {
        tracing::info!(provider = %provider_name, model = %model, "Unloading inherited model");
        if let Err(e) = ops.unload_model(&model).await {
            tracing::warn!(provider = %provider_name, model = %model, error = %e, "Inherited unload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::MockProvider;

    fn loader_with(mock: MockProvider) -> (Arc<ModelLoader>, Arc<MockProvider>) {
        let provider = Arc::new(mock);
        let loader = Arc::new(ModelLoader::new(Arc::clone(&provider) as Arc<dyn Provider>));
        (loader, provider)
    }

    #[tokio::test]
    async fn test_ensure_loaded_is_idempotent() {
        let (loader, provider) = loader_with(MockProvider::named("engine"));
        let cancel = CancellationToken::new();

        loader.ensure_loaded("m1", &cancel).await.unwrap();
        loader.ensure_loaded("m1", &cancel).await.unwrap();

        let loads = provider.call_log().iter().filter(|c| *c == "load:m1").count();
        assert_eq!(loads, 1, "second ensure_loaded must be a no-op");
        assert_eq!(loader.state_of("m1").status, ModelLifecycle::Idle);
        assert_eq!(loader.current_model().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_failed_load_leaves_unloaded() {
        let mut mock = MockProvider::named("engine");
        mock.failing_model = Some("bad".to_string());
        let (loader, _) = loader_with(mock);
        let cancel = CancellationToken::new();

        let err = loader.ensure_loaded("bad", &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "model_preparation_failed");
        assert_eq!(loader.state_of("bad").status, ModelLifecycle::Unloaded);
        assert_eq!(loader.current_model(), None);

        // The model may be retried; nothing is poisoned.
        assert_eq!(
            loader.ensure_loaded("bad", &cancel).await.unwrap_err().kind(),
            "model_preparation_failed"
        );
    }

    #[tokio::test]
    async fn test_switch_unloads_previous() {
        let (loader, provider) = loader_with(MockProvider::named("engine"));
        let cancel = CancellationToken::new();

        loader.switch_model("m1", &cancel).await.unwrap();
        loader.switch_model("m2", &cancel).await.unwrap();

        let log = provider.call_log();
        assert_eq!(log, vec!["load:m1", "unload:m1", "load:m2"]);
        assert_eq!(loader.current_model().as_deref(), Some("m2"));
        assert_eq!(loader.state_of("m1").status, ModelLifecycle::Unloaded);
    }

    #[tokio::test]
    async fn test_switch_to_current_is_noop() {
        let (loader, provider) = loader_with(MockProvider::named("engine"));
        let cancel = CancellationToken::new();

        loader.switch_model("m1", &cancel).await.unwrap();
        loader.switch_model("m1", &cancel).await.unwrap();

        assert_eq!(provider.call_log(), vec!["load:m1"]);
    }

    #[tokio::test]
    async fn test_ref_count_soundness() {
        let (loader, _) = loader_with(MockProvider::named("engine"));
        let cancel = CancellationToken::new();
        loader.ensure_loaded("m1", &cancel).await.unwrap();

        loader.mark_in_use("m1").unwrap();
        loader.mark_in_use("m1").unwrap();
        let state = loader.state_of("m1");
        assert_eq!(state.status, ModelLifecycle::InUse);
        assert_eq!(state.ref_count, 2);

        loader.mark_idle("m1");
        assert_eq!(loader.state_of("m1").status, ModelLifecycle::InUse);

        loader.mark_idle("m1");
        let state = loader.state_of("m1");
        assert_eq!(state.status, ModelLifecycle::Idle);
        assert_eq!(state.ref_count, 0);
    }

    #[tokio::test]
    async fn test_mark_in_use_requires_resident() {
        let (loader, _) = loader_with(MockProvider::named("engine"));
        assert!(loader.mark_in_use("ghost").is_err());
    }

    #[tokio::test]
    async fn test_idle_models_excludes_recent_and_held() {
        let (loader, _) = loader_with(MockProvider::named("engine"));
        let cancel = CancellationToken::new();
        loader.ensure_loaded("m1", &cancel).await.unwrap();

        // Fresh: not idle long enough.
        assert!(loader.idle_models(Duration::from_secs(60)).is_empty());
        // Old enough with zero timeout.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(loader.idle_models(Duration::ZERO), vec!["m1".to_string()]);

        // Held models are never eviction candidates.
        loader.mark_in_use("m1").unwrap();
        assert!(loader.idle_models(Duration::ZERO).is_empty());
    }

    #[tokio::test]
    async fn test_force_unload_absent_model_is_ok() {
        let (loader, provider) = loader_with(MockProvider::named("engine"));
        loader.force_unload("ghost").await.unwrap();
        assert!(provider.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_load() {
        let mut mock = MockProvider::named("engine");
        mock.load_delay = Duration::from_millis(20);
        let (loader, provider) = loader_with(mock);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move {
                loader.ensure_loaded("m1", &CancellationToken::new()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loads = provider.call_log().iter().filter(|c| *c == "load:m1").count();
        assert_eq!(loads, 1, "concurrent waiters must ride the one load");
    }

    #[tokio::test]
    async fn test_reset_inherited_unloads_residents() {
        let mut mock = MockProvider::named("engine");
        mock.initial_running = vec!["stale-a".to_string(), "stale-b".to_string()];
        let (loader, provider) = loader_with(mock);

        loader.reset_inherited().await;
        let log = provider.call_log();
        assert!(log.contains(&"unload:stale-a".to_string()));
        assert!(log.contains(&"unload:stale-b".to_string()));
    }
}
