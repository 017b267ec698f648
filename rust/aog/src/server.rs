//! Server assembly and lifecycle.
//!
//! The composition root: every component is constructed here, in the
//! startup order the gateway requires, and torn down in reverse on
//! graceful shutdown. No component reaches for a global — tests build
//! their own instances.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{self, AppState};
use crate::config::AppConfig;
use crate::engine::EngineManager;
use crate::flavor::FlavorRegistry;
use crate::lifecycle;
use crate::logging::OpTimer;
use crate::memory::MemoryManager;
use crate::plugin::PluginRegistry;
use crate::provider::builtin::OllamaProvider;
use crate::provider::{Provider, ProviderFactory, ProviderHandle};
use crate::scheduler::{Scheduler, SchedulerDeps};
use crate::store::documents::DocumentStore;
use crate::store::Datastore;
use crate::ws::WsConnectionManager;
use crate::{log_banner, log_init_step, log_success};

/// Name of the built-in local engine provider.
pub const BUILTIN_LOCAL_PROVIDER: &str = "local_ollama";

/// Default base URL of the built-in local engine.
pub const BUILTIN_LOCAL_ENGINE_URL: &str = "http://127.0.0.1:11434";

/// Gateway version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the full application state in startup order.
pub async fn build_state(
    config: AppConfig,
    shutdown_tx: mpsc::Sender<()>,
) -> anyhow::Result<AppState> {
    let overall = OpTimer::new("server", "build_state");
    log_banner!(
        format!("AOG v{VERSION}"),
        format!("On-device AI gateway - data root {}", config.paths.root_dir.display())
    );

    // [1/8] Flavors: built-in API dialect descriptors.
    let step = OpTimer::new("server", "flavors");
    let flavors = FlavorRegistry::with_builtins();
    log_init_step!(1, 8, "Flavors", format!("{} built-in", flavors.names().len()));
    step.finish();

    // [2/8] Persistent store with migrations, plus the bundled catalogs.
    let step = OpTimer::new("server", "datastore");
    let store = Datastore::open(&config.paths.db_path())?;
    let docs = Arc::new(DocumentStore::bundled());
    log_init_step!(2, 8, "Datastore", format!("{}", config.paths.db_path().display()));
    step.finish();

    // [3/8] Plugin registry and discovery. Discovery registers flavors and
    // writes service-provider rows before anything resolves providers.
    let step = OpTimer::new("server", "plugins");
    let plugin_dir = config.plugins.effective_dir(&config.paths);
    let plugins = Arc::new(PluginRegistry::new(
        plugin_dir.clone(),
        config.plugins.connect_timeout(),
        Duration::from_secs(config.plugins.rescan_interval_secs),
        store.clone(),
        flavors.clone(),
    ));
    let discovered = plugins.discover()?;
    plugins.start_rescan();
    log_init_step!(
        3,
        8,
        "Plugins",
        format!("{discovered} discovered in {}", plugin_dir.display())
    );
    step.finish();

    // [4/8] Composite provider factory: built-ins first, plugins behind.
    let step = OpTimer::new("server", "providers");
    let providers = Arc::new(ProviderFactory::new());
    let local_engine: Arc<dyn Provider> =
        Arc::new(OllamaProvider::new(BUILTIN_LOCAL_PROVIDER, BUILTIN_LOCAL_ENGINE_URL));
    providers.register_builtin(ProviderHandle::from_provider(Arc::clone(&local_engine)));
    providers.set_plugin_resolver(Arc::clone(&plugins) as Arc<dyn crate::provider::ProviderResolver>);
    log_init_step!(4, 8, "Providers", format!("builtin {BUILTIN_LOCAL_PROVIDER} + plugins"));
    step.finish();

    // [5/8] Engine manager: start built-ins, begin keep-alive.
    let step = OpTimer::new("server", "engines");
    let engines = Arc::new(EngineManager::new(providers.builtin_handles()));
    engines.start_engines().await;
    engines.start_keepalive();
    log_init_step!(5, 8, "Engines", format!("{} managed", engines.engines().len()));
    step.finish();

    // [6/8] Model memory manager: per-engine queues and loaders.
    let step = OpTimer::new("server", "memory");
    let memory = MemoryManager::new(config.memory);
    memory.attach_factory(Arc::clone(&providers));
    memory.register_engine(local_engine);
    memory.start_cleaner();
    log_init_step!(
        6,
        8,
        "Memory",
        format!(
            "idle timeout {}s, queue {}",
            config.memory.idle_timeout_secs, config.memory.queue_size
        )
    );
    step.finish();

    // [7/8] Scheduler.
    let step = OpTimer::new("server", "scheduler");
    let ws = WsConnectionManager::new();
    let scheduler = Scheduler::start(SchedulerDeps {
        store: store.clone(),
        flavors: flavors.clone(),
        providers: Arc::clone(&providers),
        memory: Arc::clone(&memory),
        ws: Arc::clone(&ws),
        config: config.scheduler,
    });
    log_init_step!(7, 8, "Scheduler", "event loop running");
    step.finish();

    // [8/8] Shared state for the router.
    let state = AppState {
        config: Arc::new(config),
        store,
        docs,
        flavors,
        providers,
        plugins,
        memory,
        scheduler,
        engines,
        ws,
        pulls: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
        shutdown_tx,
    };
    log_init_step!(8, 8, "State", "ready");

    overall.finish();
    Ok(state)
}

/// Run the gateway until a signal, a server error, or the shutdown hook.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    config.ensure_dirs()?;
    let bind_addr = config.server.bind_addr();
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let pid_path = config.paths.pid_path();

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let state = build_state(config, shutdown_tx).await?;

    let app = api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    lifecycle::write_pid(&pid_path)?;
    log_success!("Listening on {}", bind_addr);

    let drained = CancellationToken::new();
    let drain_flag = drained.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal(shutdown_rx).await;
        drain_flag.cancel();
    });

    // Graceful drain bounded by the shutdown timeout.
    let result = tokio::select! {
        r = server => r.map_err(anyhow::Error::from),
        () = async {
            drained.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            tracing::warn!("Graceful drain exceeded {shutdown_timeout:?}; closing");
            Ok(())
        }
    };

    // Teardown order: plugins, engines, scheduler, memory, PID.
    state.plugins.shutdown().await;
    state.engines.shutdown().await;
    state.scheduler.shutdown();
    state.memory.shutdown();
    lifecycle::remove_pid(&pid_path);

    tracing::info!("Gateway stopped");
    result
}

/// Resolves when a termination signal or the HTTP shutdown hook fires.
async fn shutdown_signal(mut shutdown_rx: mpsc::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = shutdown_rx.recv() => tracing::info!("Shutdown hook fired, shutting down"),
    }
}
