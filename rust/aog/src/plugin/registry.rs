//! Plugin discovery and lifecycle.
//!
//! Scans the plugin directory for manifests at startup and on a periodic
//! rescan, materializes service-provider rows for each declared service,
//! registers a flavor per plugin, and starts subprocesses lazily on first
//! resolution. The registry exclusively owns every plugin subprocess and
//! kills them all on shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aog_plugin::manifest::{ManifestError, PluginManifest, ProviderKind};

use crate::domain::{ModelRecord, ModelStatus, ProviderScope, ServiceProviderRecord, ServiceSource};
use crate::error::{GatewayError, Result};
use crate::flavor::{FlavorDescriptor, FlavorRegistry};
use crate::provider::{Provider, ProviderHandle, ProviderResolver};
use crate::store::Datastore;

use super::adapter::PluginProvider;
use super::transport::PluginClient;

/// Observable state of a discovered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    /// Discovered but never started.
    Stopped,
    /// Subprocess up and answering.
    Running,
    /// Start failed or the subprocess died.
    Error,
}

/// One discovered plugin: its manifest, its directory, and the once-only
/// subprocess initialization.
struct PluginEntry {
    manifest: PluginManifest,
    dir: PathBuf,
    init: tokio::sync::OnceCell<std::result::Result<Arc<PluginClient>, GatewayError>>,
}

impl PluginEntry {
    /// The connected client, starting the subprocess on first call.
    ///
    /// Initialization runs at most once per entry; a failed start stays
    /// failed until the registry is rebuilt, and a died subprocess surfaces
    /// as `plugin_load_failed` on every later call.
    async fn client(&self, connect_timeout: Duration) -> Result<Arc<PluginClient>> {
        let name = self.manifest.provider.name.clone();
        let result = self
            .init
            .get_or_init(|| async {
                let executable = self.manifest.executable().ok_or_else(|| {
                    GatewayError::PluginLoadFailed(format!("{name}: no executable for this platform"))
                })?;
                let client =
                    PluginClient::spawn(&name, &self.dir, executable, connect_timeout).await?;
                tracing::info!(plugin = %name, "Plugin subprocess started");
                Ok(Arc::new(client))
            })
            .await;

        match result {
            Ok(client) if client.is_alive() => Ok(Arc::clone(client)),
            Ok(_) => Err(GatewayError::PluginLoadFailed(format!(
                "{name}: plugin process died"
            ))),
            Err(e) => Err(e.clone()),
        }
    }

    fn status(&self) -> PluginStatus {
        match self.init.get() {
            None => PluginStatus::Stopped,
            Some(Ok(client)) if client.is_alive() => PluginStatus::Running,
            Some(_) => PluginStatus::Error,
        }
    }
}

/// Registry of discovered plugins.
pub struct PluginRegistry {
    dir: PathBuf,
    connect_timeout: Duration,
    rescan_interval: Duration,
    store: Datastore,
    flavors: FlavorRegistry,
    entries: RwLock<HashMap<String, Arc<PluginEntry>>>,
    /// Provider row name -> plugin name, for resolving per-service rows.
    row_names: RwLock<HashMap<String, String>>,
    shut_down: AtomicBool,
    rescan_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("dir", &self.dir)
            .field("plugins", &self.entries.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Create a registry over a plugin directory.
    pub fn new(
        dir: PathBuf,
        connect_timeout: Duration,
        rescan_interval: Duration,
        store: Datastore,
        flavors: FlavorRegistry,
    ) -> Self {
        Self {
            dir,
            connect_timeout,
            rescan_interval,
            store,
            flavors,
            entries: RwLock::new(HashMap::new()),
            row_names: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            rescan_task: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Scan the plugin directory and register anything new.
    ///
    /// A missing directory means no plugins and is not an error. Duplicate
    /// provider names from different directories are rejected.
    pub fn discover(&self) -> Result<usize> {
        if !self.dir.is_dir() {
            tracing::debug!(dir = %self.dir.display(), "Plugin directory absent; skipping discovery");
            return Ok(0);
        }

        let mut registered = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match self.register_dir(&path) {
                Ok(true) => registered += 1,
                Ok(false) => {}
                Err(ManifestError::NotFound(_)) => {
                    tracing::debug!(dir = %path.display(), "No manifest; skipping");
                }
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "Rejecting plugin");
                }
            }
        }
        Ok(registered)
    }

    /// Register one plugin directory. Returns whether a new plugin appeared.
    fn register_dir(&self, path: &Path) -> std::result::Result<bool, ManifestError> {
        let manifest = PluginManifest::load(path)?;
        let name = manifest.provider.name.clone();

        {
            let entries = self.entries.read();
            if let Some(existing) = entries.get(&name) {
                if existing.dir != path {
                    return Err(ManifestError::Invalid {
                        provider: name,
                        message: format!(
                            "duplicate provider name; already registered from {}",
                            existing.dir.display()
                        ),
                    });
                }
                return Ok(false);
            }
        }

        self.flavors.register(FlavorDescriptor::from_manifest(&manifest));
        self.materialize_rows(&manifest);

        let entry = Arc::new(PluginEntry {
            manifest,
            dir: path.to_path_buf(),
            init: tokio::sync::OnceCell::new(),
        });
        self.entries.write().insert(name.clone(), entry);
        tracing::info!(plugin = %name, dir = %path.display(), "Plugin discovered");
        Ok(true)
    }

    /// Insert or update the store rows a manifest implies.
    fn materialize_rows(&self, manifest: &PluginManifest) {
        let name = &manifest.provider.name;
        let source = match manifest.provider.kind {
            ProviderKind::Local => ServiceSource::Local,
            ProviderKind::Remote => ServiceSource::Remote,
        };
        let single = manifest.services.len() == 1;

        for service in &manifest.services {
            let row_name = if single {
                name.clone()
            } else {
                format!("{name}_{}", service.service_name)
            };

            let properties = serde_json::json!({
                "engine_host": manifest.provider.engine_host,
                "plugin_version": manifest.provider.version,
            });
            let mut record =
                ServiceProviderRecord::new(&row_name, &service.service_name, source)
                    .with_flavor(name.clone())
                    .with_scope(ProviderScope::Plugin)
                    .with_url(service.endpoint.clone());
            record.auth_type = service.auth_type.clone();
            record.properties = properties.to_string();

            if let Err(e) = self.store.upsert_provider(&record) {
                tracing::warn!(plugin = %name, error = %e, "Failed to persist provider row");
            }
            self.row_names.write().insert(row_name.clone(), name.clone());

            // Remote models need no download step; seed the default so
            // dispatch can resolve it immediately.
            if source == ServiceSource::Remote && !service.default_model.is_empty() {
                let model = ModelRecord {
                    model_name: service.default_model.clone(),
                    provider_name: row_name,
                    service_name: service.service_name.clone(),
                    service_source: source,
                    status: ModelStatus::Downloaded,
                    is_default: true,
                    updated_at: Utc::now(),
                };
                if let Err(e) = self.store.upsert_model(&model) {
                    tracing::warn!(plugin = %name, error = %e, "Failed to seed default model row");
                }
            }
        }
    }

    /// Spawn the periodic rescan task.
    pub fn start_rescan(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut guard = self.rescan_task.lock();
        if guard.is_some() {
            return;
        }
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.rescan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.discover() {
                            tracing::warn!(error = %e, "Plugin rescan failed");
                        }
                    }
                    () = registry.shutdown_token.cancelled() => return,
                }
            }
        }));
    }

    /// Status per discovered plugin.
    pub fn statuses(&self) -> HashMap<String, PluginStatus> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status()))
            .collect()
    }

    /// The manifest of a discovered plugin.
    pub fn manifest(&self, plugin_name: &str) -> Option<PluginManifest> {
        self.entries.read().get(plugin_name).map(|e| e.manifest.clone())
    }

    /// Resolve a provider row name (or plugin name) to its plugin.
    fn plugin_name_for(&self, name: &str) -> Option<String> {
        if self.entries.read().contains_key(name) {
            return Some(name.to_string());
        }
        self.row_names.read().get(name).cloned()
    }

    /// Kill every subprocess and clear the maps so a later startup is clean.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        if let Some(task) = self.rescan_task.lock().take() {
            task.abort();
        }

        let entries: Vec<Arc<PluginEntry>> = self.entries.write().drain().map(|(_, e)| e).collect();
        self.row_names.write().clear();
        for entry in entries {
            if let Some(Ok(client)) = entry.init.get() {
                client.kill().await;
                tracing::info!(plugin = %entry.manifest.provider.name, "Plugin subprocess stopped");
            }
        }
    }
}

#[async_trait]
impl ProviderResolver for PluginRegistry {
    async fn resolve(&self, name: &str) -> Result<ProviderHandle> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ProviderUnavailable(
                "plugin registry is shut down".to_string(),
            ));
        }

        let plugin_name = self
            .plugin_name_for(name)
            .ok_or_else(|| GatewayError::ProviderNotFound(name.to_string()))?;
        let entry = self
            .entries
            .read()
            .get(&plugin_name)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotFound(name.to_string()))?;

        let client = entry.client(self.connect_timeout).await?;
        let provider: Arc<dyn Provider> =
            Arc::new(PluginProvider::new(entry.manifest.clone(), client));
        Ok(ProviderHandle::from_provider(provider))
    }

    fn known_names(&self) -> Vec<String> {
        self.row_names.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aog_plugin::manifest::current_platform_key;

    fn write_manifest(dir: &Path, name: &str, kind: &str, services: serde_json::Value) {
        let manifest = serde_json::json!({
            "provider": {"name": name, "version": "1.0.0", "type": kind},
            "services": services,
            "platforms": {current_platform_key(): {"executable": "bin/plugin"}}
        });
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
    }

    fn registry(dir: &Path) -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry::new(
            dir.to_path_buf(),
            Duration::from_secs(1),
            Duration::from_secs(10),
            Datastore::open_in_memory().unwrap(),
            FlavorRegistry::new(),
        ))
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(&tmp.path().join("no-such-dir"));
        assert_eq!(registry.discover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discovery_registers_rows_and_flavor() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            &tmp.path().join("acme"),
            "acme",
            "remote",
            serde_json::json!([{
                "service_name": "chat",
                "endpoint": "https://api.acme.ai/chat",
                "default_model": "acme-1",
                "capabilities": {"support_streaming": true}
            }]),
        );

        let registry = registry(tmp.path());
        assert_eq!(registry.discover().unwrap(), 1);

        // Provider row exists under the plugin name (single service).
        let row = registry.store.get_provider("acme").unwrap().unwrap();
        assert_eq!(row.scope, ProviderScope::Plugin);
        assert_eq!(row.service_name, "chat");

        // Remote default model is seeded as downloaded.
        let model = registry.store.get_model("acme-1").unwrap().unwrap();
        assert_eq!(model.status, ModelStatus::Downloaded);
        assert!(model.is_default);

        // Flavor registered under the plugin name.
        assert!(registry.flavors.service("acme", "chat").is_some());

        // Rediscovery is a no-op.
        assert_eq!(registry.discover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_multi_service_rows_resolve_to_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            &tmp.path().join("multi"),
            "multi",
            "local",
            serde_json::json!([
                {"service_name": "text-to-image"},
                {"service_name": "speech-to-text"}
            ]),
        );

        let registry = registry(tmp.path());
        registry.discover().unwrap();

        assert_eq!(
            registry.plugin_name_for("multi_text-to-image").as_deref(),
            Some("multi")
        );
        assert_eq!(
            registry.plugin_name_for("multi_speech-to-text").as_deref(),
            Some("multi")
        );
        assert!(registry.plugin_name_for("other").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_provider_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            &tmp.path().join("first"),
            "acme",
            "remote",
            serde_json::json!([{"service_name": "chat"}]),
        );
        write_manifest(
            &tmp.path().join("second"),
            "acme",
            "remote",
            serde_json::json!([{"service_name": "embed"}]),
        );

        let registry = registry(tmp.path());
        // Exactly one wins; the other is rejected as a duplicate.
        assert_eq!(registry.discover().unwrap(), 1);
        assert_eq!(registry.entries.read().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        assert!(matches!(
            registry.resolve("ghost").await,
            Err(GatewayError::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(
            &tmp.path().join("acme"),
            "acme",
            "remote",
            serde_json::json!([{"service_name": "chat"}]),
        );
        let registry = registry(tmp.path());
        registry.discover().unwrap();
        registry.shutdown().await;

        assert!(registry.resolve("acme").await.is_err());
        assert!(registry.statuses().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lazy_start_with_scripted_plugin() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let plugin_dir = tmp.path().join("scripted");
        std::fs::create_dir_all(plugin_dir.join("bin")).unwrap();
        write_manifest(
            &plugin_dir,
            "scripted",
            "local",
            serde_json::json!([{"service_name": "chat"}]),
        );
        // A plugin that handshakes correctly and then idles.
        let script = "#!/bin/sh\necho 'AOG-PLUGIN|1|frames'\nsleep 30\n";
        let exe = plugin_dir.join("bin/plugin");
        std::fs::write(&exe, script).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registry = registry(tmp.path());
        registry.discover().unwrap();
        assert_eq!(
            registry.statuses().get("scripted"),
            Some(&PluginStatus::Stopped)
        );

        let handle = registry.resolve("scripted").await.unwrap();
        assert_eq!(handle.name(), "scripted");
        assert_eq!(
            registry.statuses().get("scripted"),
            Some(&PluginStatus::Running)
        );

        registry.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bad_handshake_marks_error() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let plugin_dir = tmp.path().join("broken");
        std::fs::create_dir_all(plugin_dir.join("bin")).unwrap();
        write_manifest(
            &plugin_dir,
            "broken",
            "local",
            serde_json::json!([{"service_name": "chat"}]),
        );
        let exe = plugin_dir.join("bin/plugin");
        std::fs::write(&exe, "#!/bin/sh\necho 'hello world'\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registry = registry(tmp.path());
        registry.discover().unwrap();

        let err = registry.resolve("broken").await.unwrap_err();
        assert_eq!(err.kind(), "plugin_load_failed");
        // The failure sticks: no restart until the registry is rebuilt.
        let err = registry.resolve("broken").await.unwrap_err();
        assert_eq!(err.kind(), "plugin_load_failed");
        assert_eq!(registry.statuses().get("broken"), Some(&PluginStatus::Error));
    }
}
