//! Converts kernel output messages into notebook outputs and routes them
//! into the shared document, offloading large payloads to the output store.

use crate::config::Config;
use crate::outputs::{OutputIndexTracker, OutputStore};
use crate::room::engine::Room;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

pub struct OutputProcessor {
    store: Arc<OutputStore>,
    tracker: Mutex<OutputIndexTracker>,
    size_threshold: usize,
    offload_mime_types: HashSet<String>,
}

impl OutputProcessor {
    pub fn new(store: Arc<OutputStore>, config: &Config) -> Self {
        Self {
            store,
            tracker: Mutex::new(OutputIndexTracker::new()),
            size_threshold: config.output_size_threshold,
            offload_mime_types: config.offload_mime_types.clone(),
        }
    }

    /// Route one kernel output message into the given room's document.
    pub async fn process_output(
        &self,
        room: &Arc<Room>,
        file_id: &str,
        msg_type: &str,
        cell_id: &str,
        content: &Value,
    ) {
        match msg_type {
            "clear_output" => {
                self.clear_cell_outputs(room, file_id, cell_id).await;
            }
            "update_display_data" => {
                let Some(display_id) = display_id_of(content) else {
                    tracing::warn!(cell_id, "update_display_data without a display id");
                    return;
                };
                let Some(index) = self.tracker.lock().get(display_id) else {
                    tracing::warn!(cell_id, display_id, "update for unknown display id");
                    return;
                };
                let Some(output) = transform_output("display_data", content) else {
                    return;
                };
                self.place_output(room, file_id, cell_id, index, output).await;
            }
            "stream" | "display_data" | "execute_result" | "error" => {
                let Some(output) = transform_output(msg_type, content) else {
                    tracing::warn!(cell_id, msg_type, "unconvertible output message");
                    return;
                };
                let display_id = match msg_type {
                    "display_data" | "execute_result" => display_id_of(content),
                    _ => None,
                };
                let index = self.tracker.lock().allocate(cell_id, display_id);
                self.place_output(room, file_id, cell_id, index, output).await;
            }
            _ => {
                tracing::debug!(msg_type, "ignoring non-output message");
            }
        }
    }

    /// Reset a cell's output state: tracker indices, on-disk artifacts, and
    /// the outputs array in the document.
    pub async fn clear_cell_outputs(&self, room: &Arc<Room>, file_id: &str, cell_id: &str) {
        self.tracker.lock().clear_cell(cell_id);
        if let Err(e) = self.store.clear(file_id, cell_id).await {
            tracing::warn!(file_id, cell_id, error = %e, "failed to clear output artifacts");
        }
        let cell_id = cell_id.to_string();
        room.with_docs(move |docs| {
            if let Some(notebook) = docs.notebook() {
                notebook.clear_outputs(&cell_id);
            }
        });
    }

    async fn place_output(
        &self,
        room: &Arc<Room>,
        file_id: &str,
        cell_id: &str,
        index: i64,
        output: Value,
    ) {
        let output = if self.should_offload(&output) {
            match self.store.write(file_id, cell_id, index, &output).await {
                Ok(url) => placeholder_output(&url),
                Err(e) => {
                    tracing::error!(
                        file_id,
                        cell_id,
                        index,
                        error = %e,
                        "failed to externalize output; writing inline"
                    );
                    output
                }
            }
        } else {
            output
        };

        let cell_id = cell_id.to_string();
        room.with_docs(move |docs| {
            if let Some(notebook) = docs.notebook() {
                if !notebook.set_output(&cell_id, index as usize, &output) {
                    tracing::warn!(cell_id, "dropping output for unknown cell");
                }
            }
        });
    }

    /// Offload when the serialized output exceeds the threshold or carries a
    /// potentially-large MIME type.
    fn should_offload(&self, output: &Value) -> bool {
        if let Some(data) = output.get("data").and_then(Value::as_object) {
            if data.keys().any(|mime| self.offload_mime_types.contains(mime)) {
                return true;
            }
        }
        serde_json::to_string(output).map_or(false, |s| s.len() > self.size_threshold)
    }
}

/// Transform an IOPub message's content into the nbformat output shape.
pub fn transform_output(msg_type: &str, content: &Value) -> Option<Value> {
    match msg_type {
        "stream" => Some(json!({
            "output_type": "stream",
            "name": content.get("name").cloned().unwrap_or(Value::Null),
            "text": content.get("text").cloned().unwrap_or(Value::Null),
        })),
        "display_data" => Some(json!({
            "output_type": "display_data",
            "data": content.get("data").cloned().unwrap_or_else(|| json!({})),
            "metadata": content.get("metadata").cloned().unwrap_or_else(|| json!({})),
        })),
        "execute_result" => Some(json!({
            "output_type": "execute_result",
            "data": content.get("data").cloned().unwrap_or_else(|| json!({})),
            "metadata": content.get("metadata").cloned().unwrap_or_else(|| json!({})),
            "execution_count": content.get("execution_count").cloned().unwrap_or(Value::Null),
        })),
        "error" => Some(json!({
            "output_type": "error",
            "ename": content.get("ename").cloned().unwrap_or(Value::Null),
            "evalue": content.get("evalue").cloned().unwrap_or(Value::Null),
            "traceback": content.get("traceback").cloned().unwrap_or_else(|| json!([])),
        })),
        _ => None,
    }
}

fn display_id_of(content: &Value) -> Option<&str> {
    content
        .get("transient")
        .and_then(|t| t.get("display_id"))
        .and_then(Value::as_str)
}

/// The small reference output written into the document when the real
/// payload lives in the output store.
fn placeholder_output(url: &str) -> Value {
    json!({
        "output_type": "display_data",
        "data": {
            "text/html": format!("<a href=\"{url}\">Output</a>"),
        },
        "metadata": {
            "outputs_service": true,
        },
    })
}
