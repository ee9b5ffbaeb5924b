use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    UnknownMode,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Rejection of a single wire message. Never tears a connection down by itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown mode: {0}")]
    UnknownMode(String),
}

impl CodecError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }
}

impl From<CodecError> for ApiError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::MalformedFrame(message) => Self::new(ErrorCode::Validation, message),
            CodecError::UnknownMode(mode) => {
                Self::new(ErrorCode::UnknownMode, format!("unknown mode: {mode}"))
            }
        }
    }
}
