//! Plugin handshake.
//!
//! The gateway passes a fixed magic cookie to the child through the
//! environment. The child verifies the cookie and prints a single handshake
//! line on stdout before switching the pipe to framed mode:
//!
//! ```text
//! AOG-PLUGIN|1|frames
//! ```
//!
//! Field 1 is the literal marker, field 2 the wire protocol version, field 3
//! the transport tag. Anything else on the first line is a handshake failure
//! and the gateway kills the child.

use thiserror::Error;

/// Environment key carrying the magic cookie to the child.
pub const MAGIC_COOKIE_KEY: &str = "AOG_PLUGIN_MAGIC_COOKIE";

/// Fixed magic cookie value. Not a secret; it only keeps the gateway from
/// executing binaries that were never built as AOG plugins.
pub const MAGIC_COOKIE_VALUE: &str = "c6e3f1a97b2d4e8f";

/// Wire protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake line marker.
const MARKER: &str = "AOG-PLUGIN";

/// Transport tag for length-delimited prost frames over stdio.
const TRANSPORT: &str = "frames";

/// Handshake failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The first line did not look like a handshake at all.
    #[error("malformed handshake line: {0:?}")]
    Malformed(String),

    /// The child speaks a different protocol version.
    #[error("unsupported plugin protocol version {got} (want {PROTOCOL_VERSION})")]
    Version { got: String },

    /// The child announced a transport this gateway cannot drive.
    #[error("unsupported plugin transport {0:?}")]
    Transport(String),
}

/// A parsed handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol version announced by the child.
    pub version: u32,
}

impl Handshake {
    /// The line a conforming plugin writes on stdout.
    pub fn line() -> String {
        format!("{MARKER}|{PROTOCOL_VERSION}|{TRANSPORT}")
    }

    /// Parse and verify the first line read from a plugin's stdout.
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let line = line.trim();
        let mut parts = line.split('|');

        match parts.next() {
            Some(MARKER) => {}
            _ => return Err(HandshakeError::Malformed(line.to_string())),
        }

        let version = parts
            .next()
            .ok_or_else(|| HandshakeError::Malformed(line.to_string()))?;
        let version: u32 = version.parse().map_err(|_| HandshakeError::Version {
            got: version.to_string(),
        })?;
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Version {
                got: version.to_string(),
            });
        }

        match parts.next() {
            Some(TRANSPORT) => {}
            Some(other) => return Err(HandshakeError::Transport(other.to_string())),
            None => return Err(HandshakeError::Malformed(line.to_string())),
        }

        Ok(Self { version })
    }

    /// Whether the process environment carries the expected magic cookie.
    ///
    /// Plugin executables call this first and exit immediately when launched
    /// outside a gateway.
    pub fn cookie_present() -> bool {
        std::env::var(MAGIC_COOKIE_KEY).is_ok_and(|v| v == MAGIC_COOKIE_VALUE)
    }
}
