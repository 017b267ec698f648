//! Plugin runtime.
//!
//! Providers packaged as subprocesses: discovered from a manifest directory,
//! spawned lazily on first use, and invoked over a framed stdio transport.
//!
//! - [`registry`]: discovery, lazy start, shutdown
//! - [`transport`]: subprocess spawn, handshake, frame multiplexing
//! - [`adapter`]: bridging plugin RPCs to the internal provider traits

pub mod adapter;
pub mod registry;
pub mod transport;

pub use registry::{PluginRegistry, PluginStatus};
pub use transport::PluginClient;
