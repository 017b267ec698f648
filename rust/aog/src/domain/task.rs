//! The schedulable unit and its resolved target.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use aog_plugin::manifest::WireProtocol;

use super::request::ServiceRequest;

/// Where a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A locally installed inference engine.
    Local,
    /// A remote cloud API.
    Remote,
}

/// How dispatch decided to invoke the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeMode {
    /// Single request/response.
    Unary,
    /// Server-streamed chunks.
    Streaming,
    /// WebSocket-backed bidirectional exchange.
    Bidirectional,
}

/// Output of dispatch: everything the run step needs to invoke a provider.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    /// Local or remote execution.
    pub location: Location,
    /// Resolved model name.
    pub model: String,
    /// Provider name, resolvable through the provider factory.
    pub provider: String,
    /// API flavor of the provider.
    pub flavor: String,
    /// Streaming after capability reconciliation.
    pub stream: bool,
    /// Protocol the provider speaks to its backend.
    pub protocol: WireProtocol,
    /// Protocol the gateway exposes for this service.
    pub expose_protocol: WireProtocol,
    /// Service-declared invocation timeout in seconds; 0 = gateway default.
    pub timeout_s: u64,
}

impl ServiceTarget {
    /// The invocation mode implied by the protocol pair and stream flag.
    pub fn invoke_mode(&self) -> InvokeMode {
        if self.expose_protocol == WireProtocol::Websocket {
            InvokeMode::Bidirectional
        } else if self.stream {
            InvokeMode::Streaming
        } else {
            InvokeMode::Unary
        }
    }
}

/// The schedulable unit. Owned by the scheduler for its whole lifetime.
#[derive(Debug)]
pub struct ServiceTask {
    /// Monotonically unique task id.
    pub id: u64,
    /// The caller's request. Immutable after enqueue.
    pub request: ServiceRequest,
    /// Resolved target; filled by dispatch.
    pub target: Option<ServiceTarget>,
    /// When the task was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the task moved to the running list.
    pub run_at: Option<DateTime<Utc>>,
    /// When the task reached its terminal event.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cancelled when the caller disconnects or the gateway shuts down.
    pub cancel: CancellationToken,
}

impl ServiceTask {
    /// Create a task for a request with an assigned id.
    pub fn new(id: u64, request: ServiceRequest) -> Self {
        Self {
            id,
            request,
            target: None,
            enqueued_at: Utc::now(),
            run_at: None,
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the task ever started running.
    pub fn started(&self) -> bool {
        self.run_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(expose: WireProtocol, stream: bool) -> ServiceTarget {
        ServiceTarget {
            location: Location::Local,
            model: "m".to_string(),
            provider: "p".to_string(),
            flavor: "openai".to_string(),
            stream,
            protocol: WireProtocol::Http,
            expose_protocol: expose,
            timeout_s: 0,
        }
    }

    #[test]
    fn test_invoke_mode_selection() {
        assert_eq!(
            target(WireProtocol::Websocket, false).invoke_mode(),
            InvokeMode::Bidirectional
        );
        assert_eq!(
            target(WireProtocol::Http, true).invoke_mode(),
            InvokeMode::Streaming
        );
        assert_eq!(
            target(WireProtocol::Http, false).invoke_mode(),
            InvokeMode::Unary
        );
    }

    #[test]
    fn test_websocket_expose_wins_over_stream() {
        assert_eq!(
            target(WireProtocol::Websocket, true).invoke_mode(),
            InvokeMode::Bidirectional
        );
    }
}
