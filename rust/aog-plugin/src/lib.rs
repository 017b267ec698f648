//! Shared plugin protocol for the AOG gateway.
//!
//! A plugin is a provider packaged as a subprocess. The gateway discovers it
//! through a manifest file, spawns the declared executable, performs a
//! magic-cookie handshake, and then exchanges length-delimited wire frames
//! over the child's stdin/stdout.
//!
//! This crate is consumed by the gateway's transport layer and by plugin
//! authors implementing the other side of the pipe:
//!
//! - [`manifest`]: `plugin.yaml` / `plugin.json` description of a plugin
//! - [`handshake`]: magic cookie, protocol version, handshake line format
//! - [`proto`]: prost-encoded wire messages (invoke, stream, bidi)
//! - [`codec`]: length-delimited frame codec for tokio streams

pub mod codec;
pub mod handshake;
pub mod manifest;
pub mod proto;

pub use codec::FrameCodec;
pub use handshake::{Handshake, HandshakeError, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION};
pub use manifest::{ManifestError, PluginManifest, ProviderKind, ServiceCapabilities};
pub use proto::{BidiMessage, BidiMessageType, Frame, FrameKind, InvokeRequest, InvokeResponse, StreamChunk};
