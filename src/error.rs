//! Error types shared by every protocol state machine.
//!
//! Each variant corresponds to one of the error kinds the engine
//! distinguishes: client-facing framing/auth failures, upstream dial/TLS/
//! handshake failures, timeouts, relay I/O, and configuration failures at
//! startup. Call sites decide the client-visible reply and the log level;
//! this type only carries the classification.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed client request: {0}")]
    ClientHandshakeMalformed(String),

    #[error("client authentication rejected")]
    ClientAuthRejected,

    #[error("upstream dial to {host}:{port} failed: {source}")]
    UpstreamDialFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("upstream TLS handshake to {host}:{port} failed: {source}")]
    UpstreamTlsFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("upstream CONNECT handshake returned status {code} {reason}")]
    UpstreamHandshakeStatus { code: u16, reason: String },

    #[error("upstream sent a malformed CONNECT response")]
    UpstreamHandshakeMalformed,

    #[error("timed out waiting for upstream CONNECT response")]
    UpstreamHandshakeTimeout,

    #[error("read timed out")]
    ReadTimeout,

    #[error("connection idle for too long")]
    IdleTimeout,

    #[error("relay I/O error: {0}")]
    RelayIo(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("HTTP header parse error: {0}")]
    HttpParse(#[from] httparse::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
