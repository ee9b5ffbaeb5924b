use shared::{domain::Field, error::CodecError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("live channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("stale acknowledgment {ack_seq} for {field}")]
    StaleAck { field: Field, ack_seq: u64 },
    #[error("rejected intent for {field}: {reason}")]
    InvalidIntent { field: Field, reason: String },
    #[error("fallback request failed: {0}")]
    Fallback(String),
    #[error("invalid controller address: {0}")]
    Address(String),
    #[error("session has shut down")]
    SessionClosed,
}

impl From<reqwest::Error> for SyncError {
    fn from(value: reqwest::Error) -> Self {
        Self::Fallback(value.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(value: url::ParseError) -> Self {
        Self::Address(value.to_string())
    }
}
