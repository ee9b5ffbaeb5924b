//! Newline-delimited JSON framing for the live channel and the HTTP fallback.

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    domain::ControllerSchema,
    error::CodecError,
    protocol::{ClientMessage, Command, ControllerMessage, StateFrame},
};

pub const FRAME_DELIMITER: u8 = b'\n';

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|err| CodecError::malformed(format!("encode failed: {err}")))?;
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return Err(CodecError::malformed("empty frame"));
    }
    serde_json::from_slice(trimmed).map_err(|err| CodecError::malformed(err.to_string()))
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>, CodecError> {
    encode(&ClientMessage::Command(command.clone()))
}

pub fn encode_client(message: &ClientMessage) -> Result<Vec<u8>, CodecError> {
    encode(message)
}

pub fn encode_controller(message: &ControllerMessage) -> Result<Vec<u8>, CodecError> {
    encode(message)
}

pub fn encode_frame(frame: &StateFrame) -> Result<Vec<u8>, CodecError> {
    encode(frame)
}

pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    decode(bytes)
}

pub fn decode_command(bytes: &[u8]) -> Result<Command, CodecError> {
    match decode_client(bytes)? {
        ClientMessage::Command(command) => Ok(command),
        other => Err(CodecError::malformed(format!(
            "expected a command, got {other:?}"
        ))),
    }
}

/// Decodes one controller message. State frames are checked against `schema`;
/// a schema message is accepted as-is since it replaces the schema.
pub fn decode_controller(
    bytes: &[u8],
    schema: &ControllerSchema,
) -> Result<ControllerMessage, CodecError> {
    let message: ControllerMessage = decode(bytes)?;
    if let ControllerMessage::State(frame) = &message {
        validate_frame(frame, schema)?;
    }
    Ok(message)
}

/// Decodes a bare state frame, as returned by the HTTP fallback routes.
pub fn decode_frame(bytes: &[u8], schema: &ControllerSchema) -> Result<StateFrame, CodecError> {
    let frame: StateFrame = decode(bytes)?;
    validate_frame(&frame, schema)?;
    Ok(frame)
}

pub fn validate_frame(frame: &StateFrame, schema: &ControllerSchema) -> Result<(), CodecError> {
    if let Some(mode) = &frame.mode {
        if !schema.knows_mode(mode) {
            return Err(CodecError::UnknownMode(mode.to_string()));
        }
    }
    for (name, value) in &frame.parameters {
        let spec = schema
            .param(name)
            .ok_or_else(|| CodecError::malformed(format!("unknown parameter tag {name}")))?;
        if !spec.contains(*value) {
            return Err(CodecError::malformed(format!(
                "parameter {name} value {value} outside [{}, {}]",
                spec.min, spec.max
            )));
        }
    }
    Ok(())
}

/// Splits a text payload carrying one or more delimited messages.
pub fn split_frames(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload
        .split(|byte| *byte == FRAME_DELIMITER)
        .filter(|chunk| !chunk.trim_ascii().is_empty())
}

#[cfg(test)]
#[path = "tests/codec_tests.rs"]
mod tests;
