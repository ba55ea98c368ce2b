//! Failure categories shared by the server, the client session and the cipher.
//!
//! Only `DecryptionError` and `KeyError` are meant to reach the user as a
//! notification. Everything else is handled where it happens and logged.

use thiserror::Error;

use crate::signaling::PeerId;

/// The signaling link to the rendezvous server failed. Recovered by the
/// reconnect loop in `networking`.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("signaling connection closed by the server")]
    Closed,
}

/// Opaque failure reported by the transport backend.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// Malformed or out-of-sequence offer/answer/candidate. Aborts the session to Idle.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("transport failed to {stage}: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("received a candidate before any negotiation context exists")]
    NoContext,
}

/// Expected under races. Logged and ignored, never surfaced as a failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferStateError {
    #[error("a transfer is already in flight, ignoring request from {0}")]
    DuplicateRequest(PeerId),

    #[error("answer arrived while no local offer was pending")]
    StaleAnswer,

    #[error("offer arrived outside of an accepted request")]
    UnexpectedOffer,

    #[error("acknowledgement arrived without an outstanding request")]
    UnexpectedAck,

    #[error("no incoming request is waiting for a decision")]
    NoPendingRequest,

    #[error("session is busy ({0})")]
    Busy(&'static str),

    #[error("no peer id has been assigned yet")]
    Unassigned,
}

/// The data channel went away or failed while a transfer was running.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed before the transfer completed")]
    Closed,

    #[error("channel failed: {0}")]
    Transport(#[from] TransportError),

    #[error("signaling connection lost")]
    SignalingLost,

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    TransferState(#[from] TransferStateError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Wrong key, or the blob is truncated or corrupted. No partial plaintext is ever returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("encrypted payload is shorter than its 16-byte header")]
    Truncated,

    #[error("decryption failed: wrong key or corrupted payload")]
    Invalid,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("key must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}
