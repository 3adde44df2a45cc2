//! Binary message protocol: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header for binary upload chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryChunkHeader {
    pub id: String,
    pub upload_id: String,
    pub relative_path: String,
    pub offset: i64,
    pub length: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// A parsed binary frame: a chunk of upload data.
#[derive(Debug)]
pub struct BinaryMessage {
    pub header: BinaryChunkHeader,
    pub data: Vec<u8>,
}

/// Parses a raw binary WebSocket frame into a [`BinaryMessage`].
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`.
/// The header's `length` field must match the number of payload bytes that
/// follow; a mismatch means the frame was truncated or corrupted in transit.
pub fn parse_binary_message(data: &[u8]) -> Result<BinaryMessage, ParseError> {
    if data.len() < 4 {
        return Err(ParseError::TooShort);
    }

    let header_len = (data[0] as usize) << 24
        | (data[1] as usize) << 16
        | (data[2] as usize) << 8
        | (data[3] as usize);

    if data.len() < 4 + header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: data.len() - 4,
        });
    }

    let header_bytes = &data[4..4 + header_len];
    let payload = data[4 + header_len..].to_vec();

    let header: BinaryChunkHeader =
        serde_json::from_slice(header_bytes).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if header.length != payload.len() {
        return Err(ParseError::LengthMismatch {
            declared: header.length,
            got: payload.len(),
        });
    }

    Ok(BinaryMessage {
        header,
        data: payload,
    })
}

/// Encodes a binary chunk message for sending over WebSocket.
pub fn encode_binary_message(
    header: &BinaryChunkHeader,
    payload: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary message parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),

    #[error("declared chunk length {declared} does not match received payload length {got}")]
    LengthMismatch { declared: usize, got: usize },
}
