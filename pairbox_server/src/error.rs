//! Error types for the signaling relay

use crate::state::Status;
use thiserror::Error;

/// Errors that can occur while running the relay
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Failed to queue a message for an endpoint in time
    #[error("Failed to deliver message: {0}")]
    Delivery(&'static str),

    /// The client did not finish the WebSocket upgrade in time
    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from client requests, reported back as `{"msg":"error"}`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientRequestError {
    /// The request is not allowed in the endpoint's current status
    #[error("unnormal status: cannot {action} while {status}")]
    InvalidState {
        /// Request kind
        action: &'static str,
        /// Status at the time of the request
        status: Status,
    },

    /// The request needs a partner and there is none
    #[error("unnormal status: cannot {action} without a partner")]
    NoPartner {
        /// Request kind
        action: &'static str,
    },
}
