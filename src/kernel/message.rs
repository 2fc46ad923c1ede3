//! Deserialized kernel protocol messages.
//!
//! The transport hands the core a multipart frame
//! `[header, parent_header, metadata, content, ...buffers]` where each part is
//! a self-describing JSON blob (the signature has already been stripped).

use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct KernelMessage {
    pub channel: String,
    pub header: Value,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl KernelMessage {
    /// Parse a multipart frame from the given channel.
    pub fn from_parts(channel: &str, parts: &[Vec<u8>]) -> Result<Self> {
        if parts.len() < 4 {
            return Err(Error::Protocol(format!(
                "kernel message too short: {} parts",
                parts.len()
            )));
        }
        Ok(Self {
            channel: channel.to_string(),
            header: serde_json::from_slice(&parts[0])?,
            parent_header: serde_json::from_slice(&parts[1])?,
            metadata: serde_json::from_slice(&parts[2])?,
            content: serde_json::from_slice(&parts[3])?,
            buffers: parts[4..].to_vec(),
        })
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.header.get("msg_type").and_then(Value::as_str)
    }

    pub fn msg_id(&self) -> Option<&str> {
        self.header.get("msg_id").and_then(Value::as_str)
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// The cell id carried by execute-request metadata.
    pub fn cell_id(&self) -> Option<&str> {
        self.metadata.get("cellId").and_then(Value::as_str)
    }
}
