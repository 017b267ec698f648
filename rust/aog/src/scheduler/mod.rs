//! Request scheduler.
//!
//! Owns every task from enqueue to terminal event. A single event-loop task
//! keeps the waiting and running lists — all list mutations happen on the
//! loop, so the lists need no locks. Each accepted task gets a spawned
//! worker that resolves a target ([`dispatch`]), passes model admission for
//! local non-embed services, invokes the provider in the selected mode, and
//! streams results back on the task's buffered result channel.
//!
//! Terminal contract: every result channel closes exactly once — after the
//! last chunk on success, after one failure record otherwise. Worker panics
//! are caught at the join boundary and surface as `internal_error`.

pub mod dispatch;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::domain::{service, InvokeMode, Location, ServiceRequest, TaskResult};
use crate::error::{GatewayError, Result};
use crate::flavor::FlavorRegistry;
use crate::memory::{MemoryManager, QueuedRequest};
use crate::provider::{InvokeContext, ProviderFactory};
use crate::store::Datastore;
use crate::ws::WsConnectionManager;

use dispatch::Resolution;

/// Result channel depth per task.
const RESULT_BUFFER: usize = 64;

/// Reschedule tick; the loop drains waiting tasks on every event anyway,
/// the tick is a safety net.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Collaborators the scheduler needs, wired at the composition root.
#[derive(Clone)]
pub struct SchedulerDeps {
    /// Persistent rows for model/provider resolution.
    pub store: Datastore,
    /// Flavor facts for capability checks.
    pub flavors: FlavorRegistry,
    /// Provider name -> instance.
    pub providers: Arc<ProviderFactory>,
    /// Model admission.
    pub memory: Arc<MemoryManager>,
    /// WebSocket connection registry for bidirectional tasks.
    pub ws: Arc<WsConnectionManager>,
    /// Timeouts.
    pub config: SchedulerConfig,
}

impl std::fmt::Debug for SchedulerDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerDeps").finish_non_exhaustive()
    }
}

/// Handle returned by [`Scheduler::enqueue`].
#[derive(Debug)]
pub struct TaskTicket {
    /// Assigned task id.
    pub task_id: u64,
    /// Lazy sequence of result records; closed exactly once.
    pub results: mpsc::Receiver<TaskResult>,
    /// Cancel to abandon the task (client disconnect).
    pub cancel: CancellationToken,
}

enum SchedulerEvent {
    Enqueue(PendingTask),
    Started { task_id: u64 },
    Done { task_id: u64 },
    Failed { task_id: u64, error: GatewayError },
}

struct PendingTask {
    task_id: u64,
    request: ServiceRequest,
    sender: mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
    enqueued_at: DateTime<Utc>,
}

struct RunningTask {
    cancel: CancellationToken,
    enqueued_at: DateTime<Utc>,
    run_at: Option<DateTime<Utc>>,
}

/// The scheduler.
pub struct Scheduler {
    deps: SchedulerDeps,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    next_task_id: AtomicU64,
    shutdown: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("next_task_id", &self.next_task_id.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create and start a scheduler.
    pub fn start(deps: SchedulerDeps) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            deps,
            events: events_tx,
            next_task_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            loop_task: Mutex::new(None),
        });

        let looped = Arc::clone(&scheduler);
        *scheduler.loop_task.lock() = Some(tokio::spawn(async move {
            looped.event_loop(events_rx).await;
        }));
        scheduler
    }

    /// Enqueue a request. Non-blocking; returns the assigned task id, the
    /// result channel, and the task's cancellation token.
    pub fn enqueue(&self, request: ServiceRequest) -> Result<TaskTicket> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, results) = mpsc::channel(RESULT_BUFFER);
        let cancel = CancellationToken::new();

        let pending = PendingTask {
            task_id,
            request,
            sender,
            cancel: cancel.clone(),
            enqueued_at: Utc::now(),
        };
        self.events
            .send(SchedulerEvent::Enqueue(pending))
            .map_err(|_| GatewayError::internal("scheduler event loop is gone"))?;

        Ok(TaskTicket {
            task_id,
            results,
            cancel,
        })
    }

    /// Stop the loop and cancel every task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
        let mut waiting: VecDeque<PendingTask> = VecDeque::new();
        let mut running: HashMap<u64, RunningTask> = HashMap::new();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        None => return,
                        Some(SchedulerEvent::Enqueue(pending)) => {
                            waiting.push_back(pending);
                            self.drain(&mut waiting, &mut running);
                        }
                        Some(SchedulerEvent::Started { task_id }) => {
                            if let Some(task) = running.get_mut(&task_id) {
                                task.run_at = Some(Utc::now());
                            }
                        }
                        Some(SchedulerEvent::Done { task_id }) => {
                            if let Some(task) = running.remove(&task_id) {
                                log_terminal(task_id, &task, None);
                            }
                        }
                        Some(SchedulerEvent::Failed { task_id, error }) => {
                            if let Some(task) = running.remove(&task_id) {
                                log_terminal(task_id, &task, Some(&error));
                            }
                        }
                    }
                }
                _ = tick.tick() => {
                    self.drain(&mut waiting, &mut running);
                }
                () = self.shutdown.cancelled() => {
                    for task in waiting.drain(..) {
                        task.cancel.cancel();
                    }
                    for task in running.values() {
                        task.cancel.cancel();
                    }
                    return;
                }
            }
        }
    }

    /// Hand every waiting task, in arrival order, to a worker.
    ///
    /// Resolution and admission enqueue happen here, synchronously, so
    /// same-engine admissions enter the model queue in strict task order.
    /// Waiting on readiness and everything provider-facing happens in the
    /// spawned worker.
    fn drain(&self, waiting: &mut VecDeque<PendingTask>, running: &mut HashMap<u64, RunningTask>) {
        while let Some(pending) = waiting.pop_front() {
            let PendingTask {
                task_id,
                request,
                sender,
                cancel,
                enqueued_at,
            } = pending;

            running.insert(
                task_id,
                RunningTask {
                    cancel: cancel.clone(),
                    enqueued_at,
                    run_at: None,
                },
            );

            let resolution = match dispatch::resolve(&self.deps, &request) {
                Ok(resolution) => resolution,
                Err(error) => {
                    self.spawn_failure(task_id, sender, error);
                    continue;
                }
            };

            let admission = if resolution.target.location == Location::Local
                && request.service != service::EMBED
            {
                let (ready_tx, ready_rx) = oneshot::channel();
                let (complete_tx, complete_rx) = oneshot::channel();
                let queued = QueuedRequest {
                    task_id,
                    model_name: resolution.target.model.clone(),
                    cancel: cancel.clone(),
                    ready: ready_tx,
                    complete: complete_rx,
                };
                match self.deps.memory.enqueue(&resolution.target.provider, queued) {
                    Ok(()) => Some(Admission {
                        ready: ready_rx,
                        complete: complete_tx,
                    }),
                    Err(error) => {
                        self.spawn_failure(task_id, sender, error);
                        continue;
                    }
                }
            } else {
                None
            };

            let deps = self.deps.clone();
            let events = self.events.clone();
            let watcher_sender = sender.clone();
            let watcher_events = self.events.clone();

            let worker = tokio::spawn(run_task(
                deps, task_id, request, resolution, admission, sender, cancel, events,
            ));

            // Panic boundary: a worker that dies still produces exactly one
            // failure record and one terminal event.
            tokio::spawn(async move {
                if let Err(e) = worker.await {
                    if e.is_panic() {
                        let error = GatewayError::Internal(format!("task worker panicked: {e}"));
                        let _ = watcher_sender
                            .send(TaskResult::Failed {
                                task_id,
                                error: error.clone(),
                            })
                            .await;
                        let _ = watcher_events.send(SchedulerEvent::Failed { task_id, error });
                    }
                }
            });
        }
    }

    /// Emit the terminal failure for a task that never reached a worker.
    fn spawn_failure(&self, task_id: u64, sender: mpsc::Sender<TaskResult>, error: GatewayError) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = sender
                .send(TaskResult::Failed {
                    task_id,
                    error: error.clone(),
                })
                .await;
            let _ = events.send(SchedulerEvent::Failed { task_id, error });
        });
    }
}

/// A granted position in an engine's admission queue.
struct Admission {
    ready: oneshot::Receiver<crate::error::Result<()>>,
    complete: oneshot::Sender<()>,
}

fn log_terminal(task_id: u64, task: &RunningTask, error: Option<&GatewayError>) {
    let queued_ms = task
        .run_at
        .map(|run| (run - task.enqueued_at).num_milliseconds());
    match error {
        None => tracing::debug!(task_id, queued_ms, "Task completed"),
        Some(e) => tracing::warn!(task_id, queued_ms, kind = e.kind(), error = %e, "Task failed"),
    }
}

/// The per-task worker: admission wait, invocation, terminal event.
#[allow(clippy::too_many_arguments, reason = "worker entry point bundles the task context")]
async fn run_task(
    deps: SchedulerDeps,
    task_id: u64,
    request: ServiceRequest,
    resolution: Resolution,
    admission: Option<Admission>,
    sender: mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SchedulerEvent>,
) {
    let outcome = drive_task(
        &deps, task_id, &request, resolution, admission, &sender, &cancel, &events,
    )
    .await;

    match outcome {
        Ok(()) => {
            let _ = events.send(SchedulerEvent::Done { task_id });
        }
        Err(error) => {
            let _ = sender
                .send(TaskResult::Failed {
                    task_id,
                    error: error.clone(),
                })
                .await;
            let _ = events.send(SchedulerEvent::Failed { task_id, error });
        }
    }
    // Dropping `sender` here (and the watcher's clone moments later) closes
    // the result channel: the single terminal close.
}

#[allow(clippy::too_many_arguments, reason = "worker entry point bundles the task context")]
async fn drive_task(
    deps: &SchedulerDeps,
    task_id: u64,
    request: &ServiceRequest,
    resolution: Resolution,
    admission: Option<Admission>,
    sender: &mpsc::Sender<TaskResult>,
    cancel: &CancellationToken,
    events: &mpsc::UnboundedSender<SchedulerEvent>,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }

    let mut complete_tx: Option<oneshot::Sender<()>> = None;

    if let Some(Admission { ready, complete }) = admission {
        complete_tx = Some(complete);

        // Bounded by the preparation timeout, the queue timeout, AND caller
        // cancellation. On any of them, the dropped `complete` sender lets
        // the queue worker settle and release the slot; the late ready
        // signal is ignored.
        let bound = deps.config.prepare_timeout().min(deps.memory.queue_timeout());
        let prepared = tokio::select! {
            r = tokio::time::timeout(bound, ready) => r,
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        match prepared {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(GatewayError::internal("admission worker dropped the request")),
            Err(_) => return Err(GatewayError::QueueTimeout),
        }
    } else if resolution.target.location == Location::Local && request.service == service::EMBED {
        // Embed stays lightweight: idempotent direct load, no queue.
        deps.memory
            .load_direct(&resolution.target.provider, &resolution.target.model, cancel)
            .await?;
    }

    let _ = events.send(SchedulerEvent::Started { task_id });

    let run = invoke(deps, task_id, request, &resolution, sender, cancel).await;

    // Completion signal releases the model ref whether the run succeeded or
    // failed.
    if let Some(complete) = complete_tx {
        let _ = complete.send(());
    }
    run
}

/// Invoke the provider in the mode dispatch selected.
async fn invoke(
    deps: &SchedulerDeps,
    task_id: u64,
    request: &ServiceRequest,
    resolution: &Resolution,
    sender: &mpsc::Sender<TaskResult>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mode = resolution.target.invoke_mode();
    let default_timeout = match mode {
        InvokeMode::Unary => deps.config.unary_timeout_secs,
        InvokeMode::Streaming | InvokeMode::Bidirectional => deps.config.stream_timeout_secs,
    };
    let timeout_s = if resolution.target.timeout_s > 0 {
        resolution.target.timeout_s
    } else {
        default_timeout
    };

    let ctx = InvokeContext {
        service: request.service.clone(),
        model: resolution.target.model.clone(),
        auth: resolution.auth.clone(),
        body: request.body.clone(),
        headers: request.headers.clone(),
        timeout: Duration::from_secs(timeout_s),
        cancel: cancel.clone(),
    };

    let handle = deps.providers.get(&resolution.target.provider).await?;
    let provider = handle.provider();
    match mode {
        InvokeMode::Unary => {
            let outcome = provider.invoke(ctx).await?;
            let _ = sender
                .send(TaskResult::Chunk {
                    task_id,
                    data: outcome.body,
                })
                .await;
            Ok(())
        }
        InvokeMode::Streaming => {
            let invoker = provider.as_stream().ok_or_else(|| {
                GatewayError::CapabilityMismatch(format!(
                    "{}: declares streaming but does not implement it",
                    resolution.target.provider
                ))
            })?;
            let mut stream = invoker.invoke_stream(ctx).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if !chunk.data.is_empty() {
                    if sender
                        .send(TaskResult::Chunk {
                            task_id,
                            data: chunk.data,
                        })
                        .await
                        .is_err()
                    {
                        // Receiver gone; stop pulling from the provider.
                        return Err(GatewayError::Cancelled);
                    }
                }
                if chunk.is_final {
                    break;
                }
            }
            Ok(())
        }
        InvokeMode::Bidirectional => {
            let invoker = provider.as_bidi().ok_or_else(|| {
                GatewayError::CapabilityMismatch(format!(
                    "{}: declares bidirectional but does not implement it",
                    resolution.target.provider
                ))
            })?;
            let conn_id = request
                .ws_conn_id
                .ok_or_else(|| GatewayError::BadRequest("missing websocket connection id".into()))?;
            let channels = deps.ws.claim(conn_id).ok_or_else(|| {
                GatewayError::BadRequest(format!(
                    "websocket connection {conn_id} not found or already bridged"
                ))
            })?;
            invoker.invoke_bidi(ctx, channels.incoming, channels.outgoing).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::domain::{ModelRecord, ProviderScope, ServiceProviderRecord, ServiceSource};
    use crate::provider::testing::MockProvider;
    use crate::provider::{Provider, ProviderHandle};
    use aog_plugin::manifest::WireProtocol;

    fn deps_with_mock(mock: MockProvider) -> (SchedulerDeps, Arc<MockProvider>) {
        let store = Datastore::open_in_memory().unwrap();
        let flavors = FlavorRegistry::with_builtins();
        let providers = Arc::new(ProviderFactory::new());
        let memory = MemoryManager::new(MemoryConfig::default());

        let name = mock.provider_name.clone();
        let provider = Arc::new(mock);
        providers.register_builtin(ProviderHandle::from_provider(
            Arc::clone(&provider) as Arc<dyn Provider>
        ));
        memory.register_engine(Arc::clone(&provider) as Arc<dyn Provider>);

        let row = ServiceProviderRecord::new(&name, "chat", ServiceSource::Local)
            .with_flavor("ollama")
            .with_scope(ProviderScope::Builtin);
        store.upsert_provider(&row).unwrap();
        store
            .upsert_model(&ModelRecord::downloaded("m1", &name, "chat", ServiceSource::Local))
            .unwrap();

        (
            SchedulerDeps {
                store,
                flavors,
                providers,
                memory,
                ws: WsConnectionManager::new(),
                config: SchedulerConfig::default(),
            },
            provider,
        )
    }

    async fn collect(mut ticket: TaskTicket) -> (Vec<bytes::Bytes>, Option<GatewayError>) {
        let mut chunks = Vec::new();
        let mut error = None;
        while let Some(result) = ticket.results.recv().await {
            match result {
                TaskResult::Chunk { data, .. } => chunks.push(data),
                TaskResult::Failed { error: e, .. } => error = Some(e),
            }
        }
        (chunks, error)
    }

    #[tokio::test]
    async fn test_task_ids_strictly_increase() {
        let (deps, _) = deps_with_mock(MockProvider::named("engine"));
        let scheduler = Scheduler::start(deps);

        let mut last = 0;
        for _ in 0..5 {
            let ticket = scheduler
                .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("m1"))
                .unwrap();
            assert!(ticket.task_id > last);
            last = ticket.task_id;
            let (_, error) = collect(ticket).await;
            assert!(error.is_none());
        }
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_unary_chat_emits_one_chunk_and_closes() {
        let (deps, provider) = deps_with_mock(MockProvider::named("engine"));
        let scheduler = Scheduler::start(deps);

        let ticket = scheduler
            .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("m1"))
            .unwrap();
        let (chunks, error) = collect(ticket).await;
        assert_eq!(chunks.len(), 1);
        assert!(error.is_none());
        assert!(provider.call_log().contains(&"invoke:chat".to_string()));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_streaming_chat_emits_chunks_in_order() {
        let mut mock = MockProvider::named("engine");
        mock.chunks = vec!["a", "b", "c"];
        let (deps, _) = deps_with_mock(mock);
        let scheduler = Scheduler::start(deps);

        let ticket = scheduler
            .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("m1").streamed())
            .unwrap();
        let (chunks, error) = collect(ticket).await;
        let chunks: Vec<String> = chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
        assert_eq!(chunks, vec!["a", "b", "c"]);
        assert!(error.is_none());
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_model_fails_terminally() {
        let (deps, provider) = deps_with_mock(MockProvider::named("engine"));
        let scheduler = Scheduler::start(deps);

        let ticket = scheduler
            .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("ghost"))
            .unwrap();
        let (chunks, error) = collect(ticket).await;
        assert!(chunks.is_empty());
        assert_eq!(error.unwrap().kind(), "model_not_found");
        assert!(
            !provider.call_log().iter().any(|c| c.starts_with("invoke")),
            "no provider call on dispatch failure"
        );
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_capability_gate_blocks_before_provider_call() {
        let (deps, provider) = deps_with_mock(MockProvider::named("engine"));
        // Declare chat as websocket-exposed without bidirectional support.
        let mut services = std::collections::HashMap::new();
        services.insert(
            "chat".to_string(),
            crate::flavor::FlavorService {
                endpoint: "/api/chat".to_string(),
                default_model: None,
                support_streaming: false,
                support_bidirectional: false,
                protocol: WireProtocol::Http,
                expose_protocol: WireProtocol::Websocket,
                timeout_s: 0,
            },
        );
        deps.flavors.register(crate::flavor::FlavorDescriptor {
            name: "ollama".to_string(),
            services,
        });

        let scheduler = Scheduler::start(deps);
        let ticket = scheduler
            .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("m1"))
            .unwrap();
        let (_, error) = collect(ticket).await;
        assert_eq!(error.unwrap().kind(), "capability_mismatch");
        assert!(provider.call_log().is_empty(), "gate must fire before any provider call");
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_same_model_sequential_tasks_single_switch() {
        let (deps, provider) = deps_with_mock(MockProvider::named("engine"));
        let memory = Arc::clone(&deps.memory);
        let scheduler = Scheduler::start(deps);

        for _ in 0..3 {
            let ticket = scheduler
                .enqueue(ServiceRequest::new("chat", &b"{}"[..]).with_model("m1"))
                .unwrap();
            let (chunks, error) = collect(ticket).await;
            assert!(!chunks.is_empty());
            assert!(error.is_none(), "unexpected error: {error:?}");
        }

        let loads = provider.call_log().iter().filter(|c| *c == "load:m1").count();
        assert_eq!(loads, 1, "tasks 2-3 must reuse the resident model");

        let loader = memory.loader("engine").unwrap();
        let state = loader.state_of("m1");
        assert_eq!(state.ref_count, 0);
        assert_eq!(state.status, crate::memory::ModelLifecycle::Idle);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (deps, _) = deps_with_mock(MockProvider::named("engine"));
        let scheduler = Scheduler::start(deps);
        scheduler.shutdown();
        assert!(scheduler
            .enqueue(ServiceRequest::new("chat", &b"{}"[..]))
            .is_err());
    }
}
