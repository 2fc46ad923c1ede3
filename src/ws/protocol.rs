//! WebSocket protocol message types and encoding/decoding.
//!
//! Binary frames follow the Yjs sync protocol framing: a message type byte
//! (`0 = Sync`, `1 = Awareness`), a subtype byte for sync messages
//! (`0 = SyncStep1`, `1 = SyncStep2`, `2 = SyncUpdate`), then a
//! variable-length payload.

use std::io;

/// Close code sent when the server shuts a room down.
pub const CLOSE_SHUTTING_DOWN: u16 = 1001;
/// Close code for an out-of-band change: clients must drop local state and
/// reconnect.
pub const CLOSE_OUT_OF_BAND_CHANGE: u16 = 4000;
/// Close code when the backing file was moved or deleted out-of-band.
pub const CLOSE_OUT_OF_BAND_MOVE: u16 = 4001;
/// Close code when the backing file was deleted through the server.
pub const CLOSE_IN_BAND_DELETE: u16 = 4002;
/// Close code for a protocol violation (SyncUpdate from a desynced client).
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 4003;

/// Top-level message type (first byte of binary message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Sync protocol (sync step 1/2, updates)
    Sync = 0,
    /// Awareness protocol (cursors, presence, execution state)
    Awareness = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Sync message subtypes (second byte when MessageType::Sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMessageType {
    /// Peer sends its state vector to request missing updates
    SyncStep1 = 0,
    /// Peer responds with the updates the requester is missing
    SyncStep2 = 1,
    /// Incremental update
    Update = 2,
}

impl TryFrom<u8> for SyncMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SyncMessageType::SyncStep1),
            1 => Ok(SyncMessageType::SyncStep2),
            2 => Ok(SyncMessageType::Update),
            _ => Err(ProtocolError::UnknownSyncType(value)),
        }
    }
}

/// Decoded WebSocket message.
#[derive(Debug, Clone)]
pub enum WsMessage {
    /// Sync step 1: the sender's state vector
    SyncStep1 { state_vector: Vec<u8> },
    /// Sync step 2: updates for the requester
    SyncStep2 { update: Vec<u8> },
    /// Incremental update
    Update { update: Vec<u8> },
    /// Awareness update payload
    Awareness { data: Vec<u8> },
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unknown sync message type: {0}")]
    UnknownSyncType(u8),
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Encode a variable-length unsigned integer (y-protocols format).
pub fn encode_var_uint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Decode a variable-length unsigned integer.
pub fn decode_var_uint(data: &mut &[u8]) -> Result<u64, ProtocolError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if data.is_empty() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let byte = data[0];
        *data = &data[1..];
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            // Overflow protection
            break;
        }
    }
    Ok(result)
}

/// Encode a variable-length byte array (length-prefixed).
pub fn encode_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_var_uint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Decode a variable-length byte array.
pub fn decode_var_bytes(data: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = decode_var_uint(data)? as usize;
    if data.len() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    let bytes = data[..len].to_vec();
    *data = &data[len..];
    Ok(bytes)
}

/// Encode a variable-length string.
pub fn encode_var_string(s: &str, out: &mut Vec<u8>) {
    encode_var_bytes(s.as_bytes(), out);
}

/// Decode a variable-length string.
pub fn decode_var_string(data: &mut &[u8]) -> Result<String, ProtocolError> {
    let bytes = decode_var_bytes(data)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Encode a SyncStep1 message.
pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + state_vector.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::SyncStep1 as u8);
    encode_var_bytes(state_vector, &mut out);
    out
}

/// Encode a SyncStep2 message.
pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + update.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::SyncStep2 as u8);
    encode_var_bytes(update, &mut out);
    out
}

/// Encode a SyncUpdate message.
pub fn encode_update(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + update.len() + 5);
    out.push(MessageType::Sync as u8);
    out.push(SyncMessageType::Update as u8);
    encode_var_bytes(update, &mut out);
    out
}

/// Encode an AwarenessUpdate message.
pub fn encode_awareness(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len() + 5);
    out.push(MessageType::Awareness as u8);
    encode_var_bytes(data, &mut out);
    out
}

/// Decode a binary WebSocket message.
pub fn decode_message(data: &[u8]) -> Result<WsMessage, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::UnexpectedEof);
    }

    let msg_type = MessageType::try_from(data[0])?;
    let mut rest = &data[1..];

    match msg_type {
        MessageType::Sync => {
            if rest.is_empty() {
                return Err(ProtocolError::UnexpectedEof);
            }
            let sync_type = SyncMessageType::try_from(rest[0])?;
            rest = &rest[1..];
            let payload = decode_var_bytes(&mut rest)?;

            match sync_type {
                SyncMessageType::SyncStep1 => Ok(WsMessage::SyncStep1 {
                    state_vector: payload,
                }),
                SyncMessageType::SyncStep2 => Ok(WsMessage::SyncStep2 { update: payload }),
                SyncMessageType::Update => Ok(WsMessage::Update { update: payload }),
            }
        }
        MessageType::Awareness => {
            let payload = decode_var_bytes(&mut rest)?;
            Ok(WsMessage::Awareness { data: payload })
        }
    }
}

/// Describe a message header for log lines without decoding the payload.
pub fn describe_header(data: &[u8]) -> String {
    match (data.first(), data.get(1)) {
        (Some(0), Some(0)) => "SyncStep1".to_string(),
        (Some(0), Some(1)) => "SyncStep2".to_string(),
        (Some(0), Some(2)) => "SyncUpdate".to_string(),
        (Some(1), _) => "AwarenessUpdate".to_string(),
        (Some(t), s) => format!("unknown({},{})", t, s.map_or(-1, |b| *b as i32)),
        (None, _) => "empty".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_uint_roundtrip() {
        for value in [0u64, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX] {
            let mut encoded = Vec::new();
            encode_var_uint(value, &mut encoded);
            let mut slice = encoded.as_slice();
            let decoded = decode_var_uint(&mut slice).unwrap();
            assert_eq!(decoded, value, "failed for {}", value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_var_bytes_roundtrip() {
        let data = b"hello world";
        let mut encoded = Vec::new();
        encode_var_bytes(data, &mut encoded);
        let mut slice = encoded.as_slice();
        let decoded = decode_var_bytes(&mut slice).unwrap();
        assert_eq!(decoded, data);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_sync_step1_roundtrip() {
        let sv = vec![1, 2, 3, 4, 5];
        let encoded = encode_sync_step1(&sv);
        assert_eq!(&encoded[..2], &[0, 0]);
        let decoded = decode_message(&encoded).unwrap();
        match decoded {
            WsMessage::SyncStep1 { state_vector } => assert_eq!(state_vector, sv),
            _ => panic!("expected SyncStep1"),
        }
    }

    #[test]
    fn test_update_roundtrip() {
        let update = vec![10, 20, 30];
        let encoded = encode_update(&update);
        assert_eq!(&encoded[..2], &[0, 2]);
        let decoded = decode_message(&encoded).unwrap();
        match decoded {
            WsMessage::Update { update: u } => assert_eq!(u, update),
            _ => panic!("expected Update"),
        }
    }

    #[test]
    fn test_awareness_roundtrip() {
        let payload = vec![9, 8, 7];
        let encoded = encode_awareness(&payload);
        assert_eq!(encoded[0], 1);
        let decoded = decode_message(&encoded).unwrap();
        match decoded {
            WsMessage::Awareness { data } => assert_eq!(data, payload),
            _ => panic!("expected Awareness"),
        }
    }

    #[test]
    fn test_invalid_headers_rejected() {
        assert!(decode_message(&[]).is_err());
        assert!(decode_message(&[7, 0, 0]).is_err());
        assert!(decode_message(&[0, 9, 0]).is_err());
        // truncated payload
        assert!(decode_message(&[0, 2, 10, 1, 2]).is_err());
    }
}
