//! Frame codec for the live and control channels.
//!
//! Live frames are binary: one snapshot-encoded [`DataModel`] per frame, so
//! every publish is a complete snapshot. Control messages are JSON text.

use measync_core::{decode_from_slice, encode_to_vec, DataModel, FormatError};
use thiserror::Error;

use crate::messages::{ControlReply, ControlRequest};

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON (de)serialization of a control message failed.
    #[error("Failed to (de)serialize control message: {0}")]
    Json(#[from] serde_json::Error),

    /// A live frame did not hold a valid snapshot.
    #[error("Invalid live frame: {0}")]
    Frame(#[from] FormatError),

    /// Received a text frame where a binary snapshot was expected.
    #[error("Expected binary frame, received text")]
    TextFrame,

    /// Received a binary frame where a control message was expected.
    #[error("Expected text frame, received binary")]
    BinaryFrame,
}

/// Encode a snapshot for the data channel.
pub fn encode_frame(model: &DataModel) -> Result<Vec<u8>, ProtocolError> {
    encode_to_vec(model).map_err(ProtocolError::from)
}

/// Decode a snapshot received on the data channel.
pub fn decode_frame(bytes: &[u8]) -> Result<DataModel, ProtocolError> {
    decode_from_slice(bytes).map_err(ProtocolError::from)
}

pub fn encode_request(request: &ControlRequest) -> Result<String, ProtocolError> {
    serde_json::to_string(request).map_err(ProtocolError::from)
}

pub fn decode_request(text: &str) -> Result<ControlRequest, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}

pub fn encode_reply(reply: &ControlReply) -> Result<String, ProtocolError> {
    serde_json::to_string(reply).map_err(ProtocolError::from)
}

pub fn decode_reply(text: &str) -> Result<ControlReply, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}
