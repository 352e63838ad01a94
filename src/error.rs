//! Closed error set for the transport core. Every fallible boundary returns
//! `Result<T, TransportError>`; decode-time and dispatch-time errors that the
//! protocol defines as "log and drop" are constructed, logged at the call
//! site, and discarded rather than propagated further.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: &'static str },

    #[error("unknown connection: {connection_id}")]
    UnknownConnection { connection_id: u64 },

    #[error("connection expired: {connection_id}")]
    ConnectionExpired { connection_id: u64 },

    #[error("handshake timed out after {elapsed_ms}ms")]
    HandshakeTimeout { elapsed_ms: u64 },

    #[error("message {data_id} timed out after {elapsed_ms}ms")]
    MessageTimeout { data_id: u64, elapsed_ms: u64 },

    #[error("admission rejected: {reason}")]
    AdmissionRejected { reason: &'static str },

    #[error("peer disconnected: {peer_id}")]
    PeerDisconnected { peer_id: String },

    #[error("duplicate message: {data_id}")]
    DuplicateMessage { data_id: u64 },

    #[error("buffer exhausted: {what}")]
    BufferExhausted { what: &'static str },

    #[error("codec error: {reason}")]
    CodecError { reason: &'static str },

    #[error("local send error: {reason}")]
    LocalSendError { reason: String },

    #[error("FEC group {group_id} unrecoverable: {missing} of {total} slots missing")]
    FecUnrecoverable {
        group_id: u32,
        missing: u32,
        total: u32,
    },

    #[error("message of {payload_len} bytes would fragment into more than u32::MAX frames at {max_frame_payload} bytes/frame")]
    MessageTooLarge {
        payload_len: usize,
        max_frame_payload: u32,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
