//! Caller intent and task output.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;

/// Per-request preference for local vs remote execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridPolicy {
    /// Gateway decides; resolves to local until a utilization signal exists.
    #[default]
    Default,
    /// Pin to a local provider.
    AlwaysLocal,
    /// Pin to a remote provider.
    AlwaysRemote,
}

/// The raw caller intent. Immutable after enqueue.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Service name (chat, embed, ...).
    pub service: String,
    /// Model hint; empty means "pick a default".
    pub model: Option<String>,
    /// Local/remote preference.
    pub hybrid_policy: HybridPolicy,
    /// Caller asked for a streamed response.
    pub stream: bool,
    /// Raw request body as received at the edge.
    pub body: Bytes,
    /// Request headers the provider may need.
    pub headers: HashMap<String, String>,
    /// WebSocket connection id, when the caller came in over a socket.
    pub ws_conn_id: Option<Uuid>,
}

impl ServiceRequest {
    /// Build a request with just a service name and body; the common case
    /// for tests and internal callers.
    pub fn new(service: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            service: service.into(),
            model: None,
            hybrid_policy: HybridPolicy::Default,
            stream: false,
            body: body.into(),
            headers: HashMap::new(),
            ws_conn_id: None,
        }
    }

    /// Set the model hint.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the hybrid policy.
    #[must_use]
    pub fn with_policy(mut self, policy: HybridPolicy) -> Self {
        self.hybrid_policy = policy;
        self
    }

    /// Ask for a streamed response.
    #[must_use]
    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// One record on a task's result channel.
///
/// A task emits zero or more `Chunk`s followed by channel close on success,
/// or at most one `Failed` followed by channel close. Never both terminal
/// shapes, never anything after `Failed`.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// One payload chunk; a unary response is a single chunk.
    Chunk {
        /// Task the chunk belongs to.
        task_id: u64,
        /// Chunk data.
        data: Bytes,
    },
    /// Terminal failure record.
    Failed {
        /// Task that failed.
        task_id: u64,
        /// Classified error.
        error: GatewayError,
    },
}

impl TaskResult {
    /// The task id this record belongs to.
    pub fn task_id(&self) -> u64 {
        match self {
            Self::Chunk { task_id, .. } | Self::Failed { task_id, .. } => *task_id,
        }
    }

    /// Whether this record is the failure terminal.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = ServiceRequest::new("chat", &b"{}"[..])
            .with_model("qwen2.5")
            .with_policy(HybridPolicy::AlwaysRemote)
            .streamed();
        assert_eq!(req.service, "chat");
        assert_eq!(req.model.as_deref(), Some("qwen2.5"));
        assert_eq!(req.hybrid_policy, HybridPolicy::AlwaysRemote);
        assert!(req.stream);
    }

    #[test]
    fn test_hybrid_policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&HybridPolicy::AlwaysLocal).unwrap(),
            "\"always_local\""
        );
        let p: HybridPolicy = serde_json::from_str("\"always_remote\"").unwrap();
        assert_eq!(p, HybridPolicy::AlwaysRemote);
    }

    #[test]
    fn test_task_result_accessors() {
        let chunk = TaskResult::Chunk {
            task_id: 3,
            data: Bytes::from_static(b"hi"),
        };
        assert_eq!(chunk.task_id(), 3);
        assert!(!chunk.is_failure());

        let failed = TaskResult::Failed {
            task_id: 4,
            error: GatewayError::Cancelled,
        };
        assert!(failed.is_failure());
    }
}
