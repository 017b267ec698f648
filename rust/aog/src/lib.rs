//! AOG - On-device AI gateway.
//!
//! One long-running process exposes a stable HTTP/WebSocket API for AI
//! services (chat, embedding, generation, text-to-image, speech-to-text,
//! text-to-speech) and multiplexes each request onto a backend provider: a
//! locally installed inference engine or a remote cloud API. Clients target
//! one API surface; the gateway decides which provider and model answer.
//!
//! # Architecture
//!
//! The request lifecycle runs through three tightly coupled cores:
//!
//! - [`scheduler`]: queues requests, dispatches each to a
//!   (location, provider, model) target, and drives the task to completion
//! - [`memory`]: per-engine FIFO admission that serializes model switches,
//!   tracks in-use models, and evicts idle ones
//! - [`plugin`]: out-of-process providers discovered from manifests and
//!   invoked over a framed stdio transport
//!
//! Around them:
//!
//! - [`provider`]: the uniform capability surface over built-in and plugin
//!   providers, with the composite factory
//! - [`engine`]: local engine start and keep-alive
//! - [`store`]: the embedded relational store and bundled catalogs
//! - [`flavor`]: API dialect facts used by dispatch
//! - [`api`]: the HTTP/WebSocket edge
//! - [`server`]: the composition root and run loop
//! - [`config`], [`error`], [`logging`], [`lifecycle`], [`ws`]: ambient
//!   concerns
//!
//! # Example
//!
//! ```rust,ignore
//! use aog::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     aog::server::run(config).await
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod flavor;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod plugin;
pub mod provider;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod ws;

pub use api::AppState;
pub use error::{GatewayError, Result};
