//! Error types for the central system

use thiserror::Error;

use crate::ocpp::{ErrorCode, OcppError};

/// Outcome of an outbound call that did not produce a response payload
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("timed out waiting for response")]
    Timeout,

    #[error("rejected by charge point: {code:?} - {description}")]
    Rejected {
        code: ErrorCode,
        description: String,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("codec error: {0}")]
    Codec(#[from] OcppError),
}

/// Errors raised while accepting a charge point connection
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no subprotocol offered")]
    NoSubprotocol,

    #[error("subprotocol mismatch: offered {offered:?}, supported {supported:?}")]
    SubprotocolMismatch {
        offered: Vec<String>,
        supported: Vec<String>,
    },

    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("central system is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the charge point simulator
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid central system URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("central system accepted subprotocol {accepted:?}, offered {offered:?}")]
    SubprotocolRejected {
        offered: Vec<String>,
        accepted: Option<String>,
    },

    #[error("boot notification not accepted: {0:?}")]
    NotAccepted(crate::ocpp::RegistrationStatus),

    #[error(transparent)]
    Command(#[from] CommandError),
}
