//! Per-engine admission queue.
//!
//! A bounded FIFO of [`QueuedRequest`]s drained by a single worker task.
//! The worker processes exactly one request at a time — that serial drain is
//! the size-1 processing slot that serializes model switches per engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};

use super::loader::ModelLoader;

/// Admission token for one local non-embed task.
#[derive(Debug)]
pub struct QueuedRequest {
    /// Task being admitted.
    pub task_id: u64,
    /// Model the task needs resident.
    pub model_name: String,
    /// Caller cancellation; a cancelled request still passes through the
    /// slot so the state machine settles, the scheduler just ignores it.
    pub cancel: CancellationToken,
    /// Fires exactly once: `Ok` when the model is prepared and acquired,
    /// `Err` on a fatal preparation failure.
    pub ready: oneshot::Sender<Result<()>>,
    /// Signalled (or dropped) by the scheduler when the task finishes.
    pub complete: oneshot::Receiver<()>,
}

/// Bounded FIFO admission queue with a serial worker.
pub struct ModelQueue {
    tx: mpsc::Sender<QueuedRequest>,
    active: Arc<AtomicUsize>,
    processing: Arc<Mutex<Option<u64>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ModelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelQueue")
            .field("active", &self.active_requests())
            .field("processing", &*self.processing.lock())
            .finish_non_exhaustive()
    }
}

impl ModelQueue {
    /// Start the queue worker over a loader.
    pub fn start(loader: Arc<ModelLoader>, capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<QueuedRequest>(capacity.max(1));
        let active = Arc::new(AtomicUsize::new(0));
        let processing = Arc::new(Mutex::new(None));

        let worker_active = Arc::clone(&active);
        let worker_processing = Arc::clone(&processing);
        let worker = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                *worker_processing.lock() = Some(request.task_id);
                process(&loader, request).await;
                *worker_processing.lock() = None;
                worker_active.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Arc::new(Self {
            tx,
            active,
            processing,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an admission request. Fails fast when the buffer is full.
    pub fn enqueue(&self, request: QueuedRequest) -> Result<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(request)) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                let _ = request.ready.send(Err(GatewayError::QueueFull));
                Err(GatewayError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                let _ = request
                    .ready
                    .send(Err(GatewayError::internal("model queue worker is gone")));
                Err(GatewayError::internal("model queue worker is gone"))
            }
        }
    }

    /// Requests waiting or in the processing slot.
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The task currently in the processing slot, if any.
    pub fn processing_task(&self) -> Option<u64> {
        *self.processing.lock()
    }

    /// Stop the worker. Queued requests are dropped; their `ready` senders
    /// close, which admission waiters observe as an internal error.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// Drive one request through the processing slot.
///
/// Even a cancelled request runs its switch so the loader state settles;
/// the scheduler side ignores the late ready signal. The slot is released
/// on every path.
async fn process(loader: &Arc<ModelLoader>, request: QueuedRequest) {
    let QueuedRequest {
        task_id,
        model_name,
        cancel,
        ready,
        complete,
    } = request;

    let prepared = loader.switch_model(&model_name, &cancel).await;

    let prepared = match prepared {
        Ok(()) => loader.mark_in_use(&model_name),
        Err(e) => Err(e),
    };

    match prepared {
        Ok(()) => {
            // The scheduler may already be gone (cancelled/timed out); the
            // completion wait below still settles the ref count.
            let _ = ready.send(Ok(()));
            let _ = complete.await;
            loader.mark_idle(&model_name);
        }
        Err(e) => {
            tracing::warn!(task_id, model = %model_name, error = %e, "Model preparation failed");
            let _ = ready.send(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::loader::ModelLifecycle;
    use crate::provider::testing::MockProvider;
    use crate::provider::Provider;
    use std::time::Duration;

    fn queue_with(mock: MockProvider, capacity: usize) -> (Arc<ModelQueue>, Arc<ModelLoader>, Arc<MockProvider>) {
        let provider = Arc::new(mock);
        let loader = Arc::new(ModelLoader::new(Arc::clone(&provider) as Arc<dyn Provider>));
        let queue = ModelQueue::start(Arc::clone(&loader), capacity);
        (queue, loader, provider)
    }

    fn request(
        task_id: u64,
        model: &str,
    ) -> (QueuedRequest, oneshot::Receiver<Result<()>>, oneshot::Sender<()>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (complete_tx, complete_rx) = oneshot::channel();
        let request = QueuedRequest {
            task_id,
            model_name: model.to_string(),
            cancel: CancellationToken::new(),
            ready: ready_tx,
            complete: complete_rx,
        };
        (request, ready_rx, complete_tx)
    }

    #[tokio::test]
    async fn test_fifo_serialization_across_models() {
        let (queue, loader, provider) = queue_with(MockProvider::named("engine"), 10);

        let (r1, ready1, complete1) = request(1, "m1");
        let (r2, ready2, complete2) = request(2, "m2");
        queue.enqueue(r1).unwrap();
        queue.enqueue(r2).unwrap();

        // Task 1 becomes ready; task 2 must wait on the slot.
        ready1.await.unwrap().unwrap();
        assert_eq!(loader.state_of("m1").status, ModelLifecycle::InUse);
        assert_eq!(loader.state_of("m2").status, ModelLifecycle::Unloaded);

        // Completing task 1 releases the slot; task 2's switch runs.
        drop(complete1);
        ready2.await.unwrap().unwrap();
        assert_eq!(loader.state_of("m2").status, ModelLifecycle::InUse);
        assert_eq!(loader.state_of("m1").status, ModelLifecycle::Unloaded);

        drop(complete2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(loader.state_of("m2").status, ModelLifecycle::Idle);

        // Exactly two loads, one unload.
        let log = provider.call_log();
        assert_eq!(log.iter().filter(|c| c.starts_with("load:")).count(), 2);
        assert_eq!(log.iter().filter(|c| c.starts_with("unload:")).count(), 1);
    }

    #[tokio::test]
    async fn test_same_model_requests_share_residency() {
        let (queue, loader, provider) = queue_with(MockProvider::named("engine"), 10);

        for id in 1..=3 {
            let (r, ready, complete) = request(id, "m1");
            queue.enqueue(r).unwrap();
            ready.await.unwrap().unwrap();
            drop(complete);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let loads = provider.call_log().iter().filter(|c| *c == "load:m1").count();
        assert_eq!(loads, 1, "same-model tasks must not reload");
        let state = loader.state_of("m1");
        assert_eq!(state.status, ModelLifecycle::Idle);
        assert_eq!(state.ref_count, 0);
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        // Capacity 1 with a slow load keeps the slot busy.
        let mut mock = MockProvider::named("engine");
        mock.load_delay = Duration::from_millis(100);
        let (queue, _, _) = queue_with(mock, 1);

        let (r1, _ready1, _c1) = request(1, "m1");
        queue.enqueue(r1).unwrap();
        // Wait for the worker to pull r1 into the slot, then fill the buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (r2, _ready2, _c2) = request(2, "m1");
        queue.enqueue(r2).unwrap();

        let (r3, ready3, _c3) = request(3, "m1");
        assert!(matches!(queue.enqueue(r3), Err(GatewayError::QueueFull)));
        assert_eq!(ready3.await.unwrap().unwrap_err(), GatewayError::QueueFull);
    }

    #[tokio::test]
    async fn test_cancelled_request_does_not_leak_slot() {
        let (queue, loader, _) = queue_with(MockProvider::named("engine"), 10);

        // The caller gives up immediately: ready receiver and complete
        // sender are dropped before the worker touches the request.
        let (ready_tx, ready_rx) = oneshot::channel();
        let (complete_tx, complete_rx) = oneshot::channel::<()>();
        let cancelled = QueuedRequest {
            task_id: 4,
            model_name: "m1".to_string(),
            cancel: CancellationToken::new(),
            ready: ready_tx,
            complete: complete_rx,
        };
        drop(ready_rx);
        drop(complete_tx);
        queue.enqueue(cancelled).unwrap();

        // The next request still passes through the slot.
        let (r5, ready5, complete5) = request(5, "m1");
        queue.enqueue(r5).unwrap();
        ready5.await.unwrap().unwrap();
        drop(complete5);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = loader.state_of("m1");
        assert_eq!(state.ref_count, 0, "abandoned admission must release its ref");
        assert_eq!(state.status, ModelLifecycle::Idle);
        assert_eq!(queue.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_preparation_signals_error() {
        let mut mock = MockProvider::named("engine");
        mock.failing_model = Some("bad".to_string());
        let (queue, loader, _) = queue_with(mock, 10);

        let (r, ready, _complete) = request(1, "bad");
        queue.enqueue(r).unwrap();
        let err = ready.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "model_preparation_failed");
        assert_eq!(loader.state_of("bad").status, ModelLifecycle::Unloaded);

        // The slot is free for the next request.
        let (r2, ready2, complete2) = request(2, "good");
        queue.enqueue(r2).unwrap();
        ready2.await.unwrap().unwrap();
        drop(complete2);
    }
}
