//! Kernel-to-document bridge.
//!
//! Lives beside the kernel client: watches the execute-request traffic going
//! to the kernel to learn which cell each message belongs to, and routes the
//! kernel's replies (status, execute_input, outputs) into every bound room.
//! Handlers never block a room; document writes go through the room's
//! message queue.

use crate::config::Config;
use crate::kernel::message::KernelMessage;
use crate::kernel::processor::OutputProcessor;
use crate::outputs::OutputStore;
use crate::room::engine::Room;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ParentInfo {
    cell_id: Option<String>,
    channel: String,
}

/// Maps parent message ids to the cell (and channel) that produced them.
#[derive(Debug, Default)]
struct MessageCache {
    by_msg_id: HashMap<String, ParentInfo>,
    msg_by_cell: HashMap<String, String>,
}

pub struct DocumentBridge {
    kernel_id: String,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    processor: OutputProcessor,
    cache: Mutex<MessageCache>,
    exclude_msg_types: HashSet<String>,
}

impl DocumentBridge {
    pub fn new(kernel_id: impl Into<String>, store: Arc<OutputStore>, config: &Config) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            rooms: RwLock::new(HashMap::new()),
            processor: OutputProcessor::new(store, config),
            cache: Mutex::new(MessageCache::default()),
            exclude_msg_types: config.exclude_msg_types.clone(),
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Bind a room to this kernel client. Idempotent on the room id.
    pub fn add_room(&self, room: Arc<Room>) {
        self.rooms
            .write()
            .insert(room.room_id_str().to_string(), room);
    }

    pub fn remove_room(&self, room_id: &str) {
        self.rooms.write().remove(room_id);
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().contains_key(room_id)
    }

    fn bound_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().values().cloned().collect()
    }

    /// Whether a kernel message type is consumed here instead of being
    /// forwarded to browser clients.
    pub fn should_suppress(&self, msg_type: &str, channel: &str) -> bool {
        channel == "iopub" && self.exclude_msg_types.contains(msg_type)
    }

    /// Inspect a frontend-to-kernel message before it reaches the kernel.
    ///
    /// Execute requests bind their message id to a cell. A re-execution of a
    /// cell (same cell, new message id) clears the cell's outputs and flips
    /// its awareness state to busy before the kernel acknowledges, so queued
    /// cells render busy immediately.
    pub async fn handle_incoming_message(&self, msg: &KernelMessage) {
        if msg.channel != "shell" || msg.msg_type() != Some("execute_request") {
            return;
        }
        let (Some(msg_id), Some(cell_id)) = (msg.msg_id(), msg.cell_id()) else {
            return;
        };

        let is_reexecution = {
            let mut cache = self.cache.lock();
            let previous = cache.msg_by_cell.get(cell_id).cloned();
            if let Some(previous_msg_id) = &previous {
                cache.by_msg_id.remove(previous_msg_id);
            }
            cache.by_msg_id.insert(
                msg_id.to_string(),
                ParentInfo {
                    cell_id: Some(cell_id.to_string()),
                    channel: msg.channel.clone(),
                },
            );
            cache
                .msg_by_cell
                .insert(cell_id.to_string(), msg_id.to_string());
            previous.is_some_and(|previous_msg_id| previous_msg_id != msg_id)
        };

        for room in self.bound_rooms() {
            if is_reexecution {
                if let Some(file_id) = room.room_id().file_id() {
                    self.processor
                        .clear_cell_outputs(&room, file_id, cell_id)
                        .await;
                }
            }
            room.set_cell_awareness_state(cell_id, "busy");
        }
    }

    /// Route one kernel message into the bound rooms.
    pub async fn handle_kernel_message(&self, msg: &KernelMessage) {
        if msg.channel != "iopub" && msg.channel != "shell" {
            return;
        }
        let Some(msg_type) = msg.msg_type() else {
            return;
        };

        let parent = msg
            .parent_msg_id()
            .and_then(|id| self.cache.lock().by_msg_id.get(id).cloned());
        let cell_id = parent.as_ref().and_then(|p| p.cell_id.clone());

        match msg_type {
            "kernel_info_reply" => self.handle_kernel_info_reply(msg),
            "status" => self.handle_status(msg, parent.as_ref(), cell_id.as_deref()),
            "execute_input" => self.handle_execute_input(msg, cell_id.as_deref()),
            "stream" | "display_data" | "execute_result" | "error" | "update_display_data"
            | "clear_output" => {
                // Messages that cannot be tied to a cell are discarded.
                let Some(cell_id) = cell_id.as_deref() else {
                    tracing::debug!(msg_type, "output message without a cell binding");
                    return;
                };
                for room in self.bound_rooms() {
                    let Some(file_id) = room.room_id().file_id() else {
                        continue;
                    };
                    self.processor
                        .process_output(&room, file_id, msg_type, cell_id, &msg.content)
                        .await;
                }
            }
            _ => {}
        }
    }

    fn handle_kernel_info_reply(&self, msg: &KernelMessage) {
        if msg.channel != "shell" {
            return;
        }
        let Some(language_info) = msg.content.get("language_info").cloned() else {
            return;
        };
        for room in self.bound_rooms() {
            let language_info = language_info.clone();
            room.with_docs(move |docs| {
                if let Some(notebook) = docs.notebook() {
                    notebook.set_language_info(&language_info);
                }
            });
        }
    }

    fn handle_status(&self, msg: &KernelMessage, parent: Option<&ParentInfo>, cell_id: Option<&str>) {
        let Some(execution_state) = msg
            .content
            .get("execution_state")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return;
        };

        for room in self.bound_rooms() {
            // A shell-originating parent means this is the kernel-level state.
            if parent.is_some_and(|p| p.channel == "shell") {
                room.set_awareness_field("kernel", json!({"execution_state": execution_state}));
            }
            if let Some(cell_id) = cell_id {
                let cell = cell_id.to_string();
                let state = execution_state.clone();
                room.with_docs(move |docs| {
                    if let Some(notebook) = docs.notebook() {
                        notebook.set_cell_execution_state(&cell, &state);
                    }
                });
                room.set_cell_awareness_state(cell_id, &execution_state);
            }
        }
    }

    fn handle_execute_input(&self, msg: &KernelMessage, cell_id: Option<&str>) {
        let Some(cell_id) = cell_id else {
            return;
        };
        let Some(execution_count) = msg.content.get("execution_count").and_then(Value::as_i64)
        else {
            return;
        };
        for room in self.bound_rooms() {
            let cell = cell_id.to_string();
            room.with_docs(move |docs| {
                if let Some(notebook) = docs.notebook() {
                    notebook.set_execution_count(&cell, execution_count);
                }
            });
        }
    }
}
