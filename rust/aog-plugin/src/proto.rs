//! Wire messages exchanged with plugin subprocesses.
//!
//! Every frame on the pipe is a [`Frame`] envelope; the `payload` carries one
//! of the typed messages below depending on `kind` and `method`. Lifecycle
//! and model-management RPCs put JSON-encoded request/response structs in the
//! payload instead of a dedicated message type.

use std::collections::HashMap;

/// Envelope for every message on the plugin pipe.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    /// Correlation id. Responses, chunks, and errors echo the request id.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// What the payload contains.
    #[prost(enumeration = "FrameKind", tag = "2")]
    pub kind: i32,
    /// RPC method name; set on requests only.
    #[prost(string, tag = "3")]
    pub method: String,
    /// Encoded payload; meaning depends on `kind`/`method`.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    /// Error message; set when `kind == Error`.
    #[prost(string, tag = "5")]
    pub error: String,
}

/// Frame discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameKind {
    /// Gateway → plugin RPC request.
    Request = 0,
    /// Plugin → gateway unary response.
    Response = 1,
    /// Plugin → gateway server-streaming chunk ([`StreamChunk`] payload).
    StreamChunk = 2,
    /// Either direction of a bidirectional exchange ([`BidiMessage`] payload).
    BidiMessage = 3,
    /// Plugin → gateway terminal error for the correlated request.
    Error = 4,
}

/// RPC method names understood by conforming plugins.
pub mod method {
    /// Unary service invocation.
    pub const INVOKE_SERVICE: &str = "invoke_service";
    /// Server-streaming service invocation.
    pub const INVOKE_SERVICE_STREAM: &str = "invoke_service_stream";
    /// Bidirectional service invocation.
    pub const INVOKE_SERVICE_BIDI: &str = "invoke_service_bidi";

    /// Plugin/provider version string.
    pub const GET_VERSION: &str = "get_version";
    /// Provider health probe.
    pub const HEALTH: &str = "health";
    /// Start the backing engine (local providers).
    pub const START_ENGINE: &str = "start_engine";
    /// Stop the backing engine (local providers).
    pub const STOP_ENGINE: &str = "stop_engine";
    /// Operate status get/set.
    pub const GET_OPERATE_STATUS: &str = "get_operate_status";
    /// Operate status set.
    pub const SET_OPERATE_STATUS: &str = "set_operate_status";

    /// Model management, JSON payloads.
    pub const PULL_MODEL: &str = "pull_model";
    /// Streamed model pull with progress chunks.
    pub const PULL_MODEL_STREAM: &str = "pull_model_stream";
    /// Delete a local model.
    pub const DELETE_MODEL: &str = "delete_model";
    /// List installed models.
    pub const LIST_MODELS: &str = "list_models";
    /// Load a model into engine memory.
    pub const LOAD_MODEL: &str = "load_model";
    /// Unload a model from engine memory.
    pub const UNLOAD_MODEL: &str = "unload_model";
    /// Models currently resident in engine memory.
    pub const GET_RUNNING_MODELS: &str = "get_running_models";
    /// Models the provider can serve at all.
    pub const LIST_SUPPORTED_MODELS: &str = "list_supported_models";
}

/// Unary/streaming service invocation request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InvokeRequest {
    /// Service to invoke (chat, embed, ...).
    #[prost(string, tag = "1")]
    pub service_name: String,
    /// Provider credentials passed through from the service-provider record.
    #[prost(map = "string, string", tag = "2")]
    pub auth_info: HashMap<String, String>,
    /// Raw request body as received by the gateway.
    #[prost(bytes = "vec", tag = "3")]
    pub request_bytes: Vec<u8>,
    /// Selected model name.
    #[prost(string, tag = "4")]
    pub model: String,
    /// Request headers the plugin may need (content-type in particular).
    #[prost(map = "string, string", tag = "5")]
    pub headers: HashMap<String, String>,
}

/// Unary service invocation response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InvokeResponse {
    /// HTTP-ish status code for the synthetic response.
    #[prost(int32, tag = "1")]
    pub status: i32,
    /// Response body.
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    /// Response metadata (headers).
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
}

/// One chunk of a server-streaming invocation.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamChunk {
    /// Chunk data.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    /// Set on the last chunk of the stream.
    #[prost(bool, tag = "2")]
    pub is_final: bool,
    /// Chunk metadata.
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
    /// Error text; a non-empty value aborts the stream.
    #[prost(string, tag = "4")]
    pub error: String,
}

/// One message of a bidirectional exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BidiMessage {
    /// Service name; set on the first message only.
    #[prost(string, tag = "1")]
    pub service_name: String,
    /// Credentials; set on the first message only.
    #[prost(map = "string, string", tag = "2")]
    pub auth_info: HashMap<String, String>,
    /// Message data.
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    /// Text, binary, or control.
    #[prost(enumeration = "BidiMessageType", tag = "4")]
    pub message_type: i32,
    /// Message metadata.
    #[prost(map = "string, string", tag = "5")]
    pub metadata: HashMap<String, String>,
    /// Marks the opening message of the exchange.
    #[prost(bool, tag = "6")]
    pub is_first: bool,
}

/// Bidirectional message types, mirroring WebSocket frame types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BidiMessageType {
    /// UTF-8 text payload.
    Text = 0,
    /// Binary payload.
    Binary = 1,
    /// Keep-alive ping.
    Ping = 2,
    /// Keep-alive pong.
    Pong = 3,
    /// Close the exchange.
    Close = 4,
}

impl Frame {
    /// Build a request frame.
    pub fn request(id: u64, method: &str, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: FrameKind::Request as i32,
            method: method.to_string(),
            payload,
            error: String::new(),
        }
    }

    /// Build a response frame correlated with `id`.
    pub fn response(id: u64, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: FrameKind::Response as i32,
            method: String::new(),
            payload,
            error: String::new(),
        }
    }

    /// Build an error frame correlated with `id`.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: FrameKind::Error as i32,
            method: String::new(),
            payload: Vec::new(),
            error: message.into(),
        }
    }

    /// The frame kind, tolerating unknown discriminants.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::try_from(self.kind).ok()
    }
}
