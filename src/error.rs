//! Error kinds shared across the collaboration engine.

use std::io;

/// Error from any core component.
///
/// Handlers inside a room catch and log `Crdt`/`Io` errors rather than
/// propagating them; dropping a single message is preferable to tearing down
/// a collaborative session. `Protocol` errors disconnect the offending client
/// only. `Conflict` triggers an out-of-band room restart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("cancelled")]
    Cancelled,

    #[error("out-of-band change on backing file: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error indicates a missing resource, mapped to HTTP 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
