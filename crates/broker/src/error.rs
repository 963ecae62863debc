//! Broker error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    #[error("session closed by policy")]
    ClosedByPolicy,
}

pub type Result<T> = std::result::Result<T, Error>;
