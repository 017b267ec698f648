//! Plugin subprocess transport.
//!
//! Spawns a plugin executable with piped stdio, performs the magic-cookie
//! handshake, and multiplexes framed RPCs over the pipe. One reader task
//! routes inbound frames to pending calls by correlation id; outbound frames
//! funnel through a writer task so concurrent callers never interleave
//! partial frames.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use prost::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use aog_plugin::proto::{BidiMessage, Frame, FrameKind, StreamChunk};
use aog_plugin::{FrameCodec, Handshake, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};

use crate::error::{GatewayError, Result};

/// Outbound frame queue depth.
const WRITE_QUEUE: usize = 64;

/// Stream chunk queue depth per call.
const STREAM_QUEUE: usize = 32;

/// Where an inbound frame should be delivered.
enum Pending {
    Unary(oneshot::Sender<Result<Frame>>),
    Stream(mpsc::Sender<Result<StreamChunk>>),
    Bidi(mpsc::Sender<BidiMessage>),
}

/// A connected plugin subprocess.
pub struct PluginClient {
    plugin_name: String,
    child: Mutex<Option<Child>>,
    writer: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("plugin", &self.plugin_name)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

impl PluginClient {
    /// Spawn a plugin executable and complete the handshake.
    ///
    /// `executable` is resolved against `plugin_dir`, which also becomes the
    /// child's working directory. The magic cookie and the gateway version
    /// ride in the child environment. A handshake that does not complete
    /// within `connect_timeout` kills the child.
    pub async fn spawn(
        plugin_name: &str,
        plugin_dir: &Path,
        executable: &str,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let exe_path = plugin_dir.join(executable);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&exe_path, perms).map_err(|e| {
                GatewayError::PluginLoadFailed(format!(
                    "{plugin_name}: chmod {}: {e}",
                    exe_path.display()
                ))
            })?;
        }

        let mut child = Command::new(&exe_path)
            .current_dir(plugin_dir)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env("AOG_VERSION", env!("CARGO_PKG_VERSION"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::PluginLoadFailed(format!(
                    "{plugin_name}: spawn {}: {e}",
                    exe_path.display()
                ))
            })?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        // Forward plugin stderr into our logs.
        let stderr_name = plugin_name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(plugin = %stderr_name, "{line}");
            }
        });

        // Handshake: first stdout line, bounded by the connect timeout.
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let read = tokio::time::timeout(connect_timeout, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(n)) if n > 0 => {
                Handshake::parse(&line).map_err(|e| {
                    GatewayError::PluginLoadFailed(format!("{plugin_name}: handshake: {e}"))
                })?;
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                let _ = child.kill().await;
                return Err(GatewayError::PluginLoadFailed(format!(
                    "{plugin_name}: plugin exited before handshake"
                )));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(GatewayError::PluginLoadFailed(format!(
                    "{plugin_name}: handshake timed out after {connect_timeout:?}"
                )));
            }
        }

        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task: serialize all outbound frames.
        let (writer_tx, mut writer_rx) = mpsc::channel::<Frame>(WRITE_QUEUE);
        let mut sink = FramedWrite::new(stdin, FrameCodec);
        let writer_name = plugin_name.to_string();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(plugin = %writer_name, error = %e, "Plugin write failed");
                    return;
                }
            }
        });

        // Reader task: route frames to pending calls.
        let mut source = FramedRead::new(reader, FrameCodec);
        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let reader_name = plugin_name.to_string();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(frame) => route_frame(&reader_pending, frame).await,
                    Err(e) => {
                        tracing::warn!(plugin = %reader_name, error = %e, "Plugin read failed");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            fail_all(&reader_pending, &reader_name).await;
        });

        Ok(Self {
            plugin_name: plugin_name.to_string(),
            child: Mutex::new(Some(child)),
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            alive,
        })
    }

    /// Whether the pipe is still open.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn claim_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(GatewayError::ProviderUnavailable(format!(
                "{}: plugin process is gone",
                self.plugin_name
            )))
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.writer.send(frame).await.map_err(|_| {
            GatewayError::ProviderUnavailable(format!(
                "{}: plugin writer closed",
                self.plugin_name
            ))
        })
    }

    /// Unary RPC: send a request frame, await the correlated response.
    pub async fn request(&self, method: &str, payload: Vec<u8>, timeout: Duration) -> Result<Frame> {
        self.ensure_alive()?;
        let id = self.claim_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, Pending::Unary(tx));

        if let Err(e) = self.send(Frame::request(id, method, payload)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ProviderUnavailable(format!(
                "{}: plugin dropped the call",
                self.plugin_name
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(GatewayError::DeadlineExceeded(format!(
                    "{}: {method} after {timeout:?}",
                    self.plugin_name
                )))
            }
        }
    }

    /// Unary RPC with JSON-encoded request and response payloads. Used by
    /// the lifecycle and model-management methods.
    pub async fn request_json<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| GatewayError::Internal(format!("encode {method}: {e}")))?;
        let frame = self.request(method, payload, timeout).await?;
        serde_json::from_slice(&frame.payload).map_err(|e| {
            GatewayError::ProviderUnavailable(format!(
                "{}: {method}: malformed plugin response: {e}",
                self.plugin_name
            ))
        })
    }

    /// Server-streaming RPC: send a request frame, receive chunk frames
    /// until one is final or the pipe errors.
    pub async fn request_stream(
        &self,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<mpsc::Receiver<Result<StreamChunk>>> {
        self.ensure_alive()?;
        let id = self.claim_id();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.pending.lock().insert(id, Pending::Stream(tx));

        if let Err(e) = self.send(Frame::request(id, method, payload)).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Open a bidirectional exchange. The first message must carry
    /// `is_first = true` with the service name and credentials; further
    /// messages go through [`PluginClient::send_bidi`] with the returned id.
    pub async fn open_bidi(
        &self,
        method: &str,
        first: BidiMessage,
    ) -> Result<(u64, mpsc::Receiver<BidiMessage>)> {
        self.ensure_alive()?;
        let id = self.claim_id();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.pending.lock().insert(id, Pending::Bidi(tx));

        let mut frame = Frame::request(id, method, first.encode_to_vec());
        frame.kind = FrameKind::BidiMessage as i32;
        if let Err(e) = self.send(frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    /// Send one message on an open bidirectional exchange.
    pub async fn send_bidi(&self, id: u64, message: BidiMessage) -> Result<()> {
        self.ensure_alive()?;
        let mut frame = Frame::response(id, message.encode_to_vec());
        frame.kind = FrameKind::BidiMessage as i32;
        self.send(frame).await
    }

    /// Close a bidirectional exchange and drop its routing entry.
    pub fn close_bidi(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Kill the subprocess and fail everything in flight.
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                tracing::debug!(plugin = %self.plugin_name, error = %e, "Plugin kill");
            }
        }
        fail_all(&self.pending, &self.plugin_name).await;
    }
}

/// Route one inbound frame to its pending call.
///
/// Channel sends happen outside the pending-map lock so a slow consumer
/// never blocks map access, and awaited so no chunk is ever dropped.
async fn route_frame(pending: &Mutex<HashMap<u64, Pending>>, frame: Frame) {
    let id = frame.id;
    match frame.frame_kind() {
        Some(FrameKind::Response) => {
            if let Some(Pending::Unary(tx)) = pending.lock().remove(&id) {
                let _ = tx.send(Ok(frame));
            }
        }
        Some(FrameKind::Error) => {
            let error = classify_plugin_error(&frame.error);
            let removed = pending.lock().remove(&id);
            match removed {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Err(error));
                }
                Some(Pending::Stream(tx)) => {
                    let _ = tx.send(Err(error)).await;
                }
                // Dropping the sender closes the bidi receiver.
                Some(Pending::Bidi(_)) | None => {}
            }
        }
        Some(FrameKind::StreamChunk) => {
            let chunk = match StreamChunk::decode(frame.payload.as_slice()) {
                Ok(chunk) => chunk,
                Err(e) => {
                    let removed = pending.lock().remove(&id);
                    if let Some(Pending::Stream(tx)) = removed {
                        let _ = tx
                            .send(Err(GatewayError::ProviderUnavailable(format!(
                                "malformed stream chunk: {e}"
                            ))))
                            .await;
                    }
                    return;
                }
            };
            let is_final = chunk.is_final;
            let sender = {
                let mut guard = pending.lock();
                match guard.get(&id) {
                    Some(Pending::Stream(tx)) => {
                        let tx = tx.clone();
                        if is_final {
                            guard.remove(&id);
                        }
                        Some(tx)
                    }
                    _ => None,
                }
            };
            if let Some(tx) = sender {
                let _ = tx.send(Ok(chunk)).await;
            }
        }
        Some(FrameKind::BidiMessage) => {
            let message = match BidiMessage::decode(frame.payload.as_slice()) {
                Ok(message) => message,
                Err(_) => return,
            };
            let sender = {
                let guard = pending.lock();
                match guard.get(&id) {
                    Some(Pending::Bidi(tx)) => Some(tx.clone()),
                    _ => None,
                }
            };
            if let Some(tx) = sender {
                let _ = tx.send(message).await;
            }
        }
        Some(FrameKind::Request) | None => {
            tracing::debug!(frame_id = id, kind = frame.kind, "Unexpected frame from plugin");
        }
    }
}

/// Fail every pending call; used when the pipe dies.
async fn fail_all(pending: &Mutex<HashMap<u64, Pending>>, plugin_name: &str) {
    let drained: Vec<Pending> = pending.lock().drain().map(|(_, p)| p).collect();
    for entry in drained {
        let error = GatewayError::ProviderUnavailable(format!("{plugin_name}: plugin exited"));
        match entry {
            Pending::Unary(tx) => {
                let _ = tx.send(Err(error));
            }
            Pending::Stream(tx) => {
                let _ = tx.send(Err(error)).await;
            }
            // Dropping the sender closes the bidi receiver.
            Pending::Bidi(_) => {}
        }
    }
}

/// Classify an error string reported by a plugin.
fn classify_plugin_error(message: &str) -> GatewayError {
    if message.starts_with("panic:") || message.contains("panicked") {
        GatewayError::PluginPanic(message.to_string())
    } else {
        GatewayError::ProviderUnavailable(message.to_string())
    }
}
