//! Engine management.
//!
//! Local providers front engine processes that live outside the gateway. The
//! engine manager starts them at boot (where starting means verifying they
//! answer), keeps them alive with a periodic health probe, and reports
//! aggregate health/version for the root endpoints.
//!
//! Keep-alive is the only place in the gateway that retries: a failed engine
//! start is logged and retried at the next tick, never on the request path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::provider::ProviderHandle;

/// Default keep-alive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Manages the local engines behind built-in providers.
pub struct EngineManager {
    engines: Vec<ProviderHandle>,
    interval: Duration,
    shutdown: CancellationToken,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("engines", &self.engines.iter().map(ProviderHandle::name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl EngineManager {
    /// Create a manager over the local provider handles.
    pub fn new(handles: Vec<ProviderHandle>) -> Self {
        let engines = handles
            .into_iter()
            .filter(|h| matches!(h, ProviderHandle::Local(_)))
            .collect();
        Self {
            engines,
            interval: KEEPALIVE_INTERVAL,
            shutdown: CancellationToken::new(),
            keepalive: Mutex::new(None),
        }
    }

    /// Override the keep-alive interval. Used by tests.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start every engine, logging failures; keep-alive retries them later.
    pub async fn start_engines(&self) {
        for handle in &self.engines {
            let Some(lifecycle) = handle.provider().lifecycle() else {
                continue;
            };
            match lifecycle.start().await {
                Ok(()) => tracing::info!(engine = handle.name(), "Engine started"),
                Err(e) => {
                    tracing::warn!(engine = handle.name(), error = %e, "Engine not available; keep-alive will retry");
                }
            }
        }
    }

    /// Spawn the keep-alive ticker.
    pub fn start_keepalive(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut guard = self.keepalive.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.probe_all().await,
                    () = manager.shutdown.cancelled() => return,
                }
            }
        }));
    }

    async fn probe_all(&self) {
        for handle in &self.engines {
            let Some(lifecycle) = handle.provider().lifecycle() else {
                continue;
            };
            if let Err(e) = lifecycle.health().await {
                tracing::warn!(engine = handle.name(), error = %e, "Engine health probe failed; attempting restart");
                if let Err(e) = lifecycle.start().await {
                    tracing::warn!(engine = handle.name(), error = %e, "Engine restart failed");
                }
            }
        }
    }

    /// Per-engine health, for `GET /engine/health`.
    pub async fn health(&self) -> HashMap<String, bool> {
        let mut out = HashMap::new();
        for handle in &self.engines {
            let healthy = match handle.provider().lifecycle() {
                Some(lifecycle) => lifecycle.health().await.is_ok(),
                None => false,
            };
            out.insert(handle.name().to_string(), healthy);
        }
        out
    }

    /// Per-engine version, for `GET /engine/version`.
    pub async fn versions(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for handle in &self.engines {
            let version = match handle.provider().info() {
                Some(info) => info.version().await.unwrap_or_else(|_| "unavailable".to_string()),
                None => "unavailable".to_string(),
            };
            out.insert(handle.name().to_string(), version);
        }
        out
    }

    /// Stop keep-alive and every engine.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
        for handle in &self.engines {
            if let Some(lifecycle) = handle.provider().lifecycle() {
                if let Err(e) = lifecycle.stop().await {
                    tracing::warn!(engine = handle.name(), error = %e, "Engine stop failed");
                }
            }
        }
    }

    /// The managed engine handles.
    pub fn engines(&self) -> &[ProviderHandle] {
        &self.engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::MockProvider;
    use crate::provider::Provider;

    fn local_handle(name: &str) -> ProviderHandle {
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::named(name));
        ProviderHandle::from_provider(provider)
    }

    #[tokio::test]
    async fn test_only_local_handles_are_managed() {
        let manager = EngineManager::new(vec![local_handle("a"), local_handle("b")]);
        assert_eq!(manager.engines().len(), 2);
    }

    #[tokio::test]
    async fn test_health_without_lifecycle_is_unhealthy() {
        // MockProvider exposes no lifecycle surface.
        let manager = EngineManager::new(vec![local_handle("a")]);
        let health = manager.health().await;
        assert_eq!(health.get("a"), Some(&false));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = Arc::new(EngineManager::new(vec![]).with_interval(Duration::from_millis(10)));
        manager.start_keepalive();
        manager.shutdown().await;
        manager.shutdown().await;
    }
}
