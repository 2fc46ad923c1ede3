//! Room lifecycle and awareness events emitted to the external event sink.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Schema URI for room lifecycle events.
pub const ROOM_EVENT_URI: &str = "https://schema.jupyter.org/jupyter_server_documents/room/v1";
/// Schema URI for awareness events.
pub const AWARENESS_EVENT_URI: &str =
    "https://schema.jupyter.org/jupyter_server_documents/awareness/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomAction {
    Initialize,
    Load,
    Save,
    Overwrite,
    Clean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// An event pushed to sink subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub schema_id: String,
    pub room_id: String,
    pub action: Option<RoomAction>,
    pub level: EventLevel,
    pub message: Option<String>,
}

/// Fan-out sink for lifecycle events.
///
/// Events are pushed to a broadcast channel for external consumers and logged
/// through `tracing`. A sink with no subscribers simply drops events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit_room(&self, action: RoomAction, room_id: &str) {
        tracing::debug!(room_id, ?action, "room event");
        let _ = self.tx.send(Event {
            schema_id: ROOM_EVENT_URI.to_string(),
            room_id: room_id.to_string(),
            action: Some(action),
            level: EventLevel::Info,
            message: None,
        });
    }

    pub fn emit_awareness(&self, room_id: &str, message: impl Into<String>) {
        let _ = self.tx.send(Event {
            schema_id: AWARENESS_EVENT_URI.to_string(),
            room_id: room_id.to_string(),
            action: None,
            level: EventLevel::Info,
            message: Some(message.into()),
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
