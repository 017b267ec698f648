//! WebSocket connection registry.
//!
//! The router upgrades sockets and registers each one here under a UUID; the
//! connection id travels to dispatch in the `X-WebSocket-ConnID` header. A
//! bidirectional task worker later claims the connection's channel pair —
//! first caller wins — and bridges it to the provider.
//!
//! Close is idempotent: the handler unregisters on socket close, and a
//! claimed pair simply sees its channels shut.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::provider::BidiPayload;

/// Header carrying the connection id into dispatch.
pub const CONN_ID_HEADER: &str = "x-websocket-connid";

/// Channel depth between a socket pump and the bridge.
const BRIDGE_QUEUE: usize = 32;

/// The bridge-facing half of a registered connection.
#[derive(Debug)]
pub struct BridgeChannels {
    /// Messages read from the socket.
    pub incoming: mpsc::Receiver<BidiPayload>,
    /// Messages to write to the socket.
    pub outgoing: mpsc::Sender<BidiPayload>,
}

/// The socket-handler-facing half of a registered connection.
#[derive(Debug)]
pub struct SocketChannels {
    /// Push messages read from the socket.
    pub to_bridge: mpsc::Sender<BidiPayload>,
    /// Drain messages to write to the socket.
    pub from_bridge: mpsc::Receiver<BidiPayload>,
}

struct Entry {
    bridge: Option<BridgeChannels>,
}

/// Registry of live WebSocket connections keyed by UUID.
#[derive(Default)]
pub struct WsConnectionManager {
    connections: Mutex<HashMap<Uuid, Entry>>,
}

impl std::fmt::Debug for WsConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnectionManager")
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl WsConnectionManager {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a fresh connection and return the socket handler's halves.
    pub fn register(&self, id: Uuid) -> SocketChannels {
        let (to_bridge, incoming) = mpsc::channel(BRIDGE_QUEUE);
        let (outgoing, from_bridge) = mpsc::channel(BRIDGE_QUEUE);

        self.connections.lock().insert(
            id,
            Entry {
                bridge: Some(BridgeChannels { incoming, outgoing }),
            },
        );
        SocketChannels {
            to_bridge,
            from_bridge,
        }
    }

    /// Claim the bridge half of a connection. The first caller wins; later
    /// claims (or claims of unknown ids) get nothing.
    pub fn claim(&self, id: Uuid) -> Option<BridgeChannels> {
        self.connections.lock().get_mut(&id).and_then(|e| e.bridge.take())
    }

    /// Drop a connection. Safe to call more than once.
    pub fn unregister(&self, id: Uuid) {
        self.connections.lock().remove(&id);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_claim_unregister() {
        let manager = WsConnectionManager::new();
        let id = Uuid::new_v4();
        let socket = manager.register(id);

        // First claim wins.
        let mut bridge = manager.claim(id).expect("first claim");
        assert!(manager.claim(id).is_none(), "second claim must lose");

        // Socket → bridge traffic flows.
        socket.to_bridge.send(BidiPayload::Text("hi".into())).await.unwrap();
        assert!(matches!(bridge.incoming.recv().await, Some(BidiPayload::Text(t)) if t == "hi"));

        manager.unregister(id);
        manager.unregister(id);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_claim_unknown_connection() {
        let manager = WsConnectionManager::new();
        assert!(manager.claim(Uuid::new_v4()).is_none());
    }
}
