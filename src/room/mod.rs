//! Per-document rooms: the engine, its file API, and the room registry.

pub mod engine;
pub mod file;
pub mod manager;

pub use engine::{Room, RoomState};
pub use manager::RoomManager;

use crate::contents::{FileFormat, FileType};
use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// The reserved id of the awareness-only room with no backing file.
pub const GLOBAL_AWARENESS_ROOM_ID: &str = "JupyterLab:globalAwareness";

/// Parsed room identifier.
///
/// The canonical grammar is `{file_format}:{file_type}:{file_id}` (for
/// notebooks `json:notebook:{file_id}`), plus the reserved global-awareness
/// literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomId {
    GlobalAwareness,
    Document {
        format: FileFormat,
        file_type: FileType,
        file_id: String,
    },
}

impl RoomId {
    pub fn notebook(file_id: impl Into<String>) -> Self {
        RoomId::Document {
            format: FileFormat::Json,
            file_type: FileType::Notebook,
            file_id: file_id.into(),
        }
    }

    pub fn is_global_awareness(&self) -> bool {
        matches!(self, RoomId::GlobalAwareness)
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            RoomId::GlobalAwareness => None,
            RoomId::Document { file_id, .. } => Some(file_id),
        }
    }
}

impl FromStr for RoomId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GLOBAL_AWARENESS_ROOM_ID {
            return Ok(RoomId::GlobalAwareness);
        }
        let mut parts = s.splitn(3, ':');
        let (format, file_type, file_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) if !c.is_empty() => (a, b, c),
            _ => return Err(Error::Protocol(format!("malformed room id '{s}'"))),
        };
        let format = FileFormat::parse(format)
            .ok_or_else(|| Error::Protocol(format!("unknown file format in room id '{s}'")))?;
        let file_type = FileType::parse(file_type)
            .ok_or_else(|| Error::Protocol(format!("unknown file type in room id '{s}'")))?;
        Ok(RoomId::Document {
            format,
            file_type,
            file_id: file_id.to_string(),
        })
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::GlobalAwareness => f.write_str(GLOBAL_AWARENESS_ROOM_ID),
            RoomId::Document {
                format,
                file_type,
                file_id,
            } => write!(f, "{}:{}:{}", format.as_str(), file_type.as_str(), file_id),
        }
    }
}
