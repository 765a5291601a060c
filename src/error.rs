//! Error types shared across the server.
//!
//! Per-connection failures are collected in [`ConnectionError`] and never leave
//! the reader task that produced them. Server lifecycle failures are
//! [`ServerError`]. Application faults raised by RPC methods are not errors at
//! this level: they are encoded into replies (see [`crate::rpc::RpcFault`]).

use thiserror::Error;

use crate::auth::AuthError;
use crate::http::parser::ParseError;
use crate::rpc::codec::CodecError;
use crate::websocket::frame::FrameError;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server already started")]
    AlreadyStarted,

    #[error("method {0:?} is already registered")]
    DuplicateMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        ServerError::Tls(e.to_string())
    }
}

/// Everything that can end a single connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("hand-off failed: {0}")]
    HandOff(String),
}

impl From<ParseError> for ConnectionError {
    fn from(e: ParseError) -> Self {
        ConnectionError::Protocol(format!("HTTP parse error: {:?}", e))
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Protocol(e.to_string())
    }
}

impl ConnectionError {
    /// Whether the peer simply went away, as opposed to a real failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Closed => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
