//! Kernel-to-document routing: output placement, display-id stability,
//! re-execution, and large-output offload.

use docsync::contents::{FsContentsStore, InMemoryFileIdIndexer};
use docsync::kernel::KernelMessage;
use docsync::{AppContext, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn sample_notebook() -> Value {
    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {},
        "cells": [{
            "id": "c1",
            "cell_type": "code",
            "source": "print('hi')",
            "metadata": {},
            "execution_count": null,
            "outputs": []
        }]
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    context: Arc<AppContext>,
    outputs_path: std::path::PathBuf,
    file_id: String,
    room: Arc<docsync::room::Room>,
    bridge: Arc<docsync::kernel::DocumentBridge>,
}

async fn fixture(config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("docs");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(
        root.join("nb.ipynb"),
        serde_json::to_string_pretty(&sample_notebook()).unwrap(),
    )
    .unwrap();

    let mut config = config;
    let outputs_path = dir.path().join("outputs");
    config.outputs_path = outputs_path.clone();

    let contents = Arc::new(FsContentsStore::new(root));
    let indexer = Arc::new(InMemoryFileIdIndexer::new());
    let context = AppContext::new(config, contents, indexer);

    let session = context
        .sessions
        .create_session("nb.ipynb", None, "notebook", None, None)
        .await
        .unwrap();
    let kernel_id = session.kernel_id.clone().unwrap();
    let bridge = context.kernels.get(&kernel_id).unwrap();

    let file_id = context.indexer.get_id("nb.ipynb").unwrap();
    let room_id = format!("json:notebook:{file_id}");
    let room = context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    Fixture {
        _dir: dir,
        context,
        outputs_path,
        file_id,
        room,
        bridge,
    }
}

fn kernel_msg(
    channel: &str,
    msg_type: &str,
    msg_id: &str,
    parent: Option<&str>,
    metadata: Value,
    content: Value,
) -> KernelMessage {
    let parts = vec![
        serde_json::to_vec(&json!({"msg_type": msg_type, "msg_id": msg_id})).unwrap(),
        serde_json::to_vec(&match parent {
            Some(id) => json!({"msg_id": id}),
            None => json!({}),
        })
        .unwrap(),
        serde_json::to_vec(&metadata).unwrap(),
        serde_json::to_vec(&content).unwrap(),
    ];
    KernelMessage::from_parts(channel, &parts).unwrap()
}

fn execute_request(msg_id: &str, cell_id: &str) -> KernelMessage {
    kernel_msg(
        "shell",
        "execute_request",
        msg_id,
        None,
        json!({"cellId": cell_id}),
        json!({"code": ""}),
    )
}

async fn outputs_of(fixture: &Fixture, cell_id: &str) -> Vec<Value> {
    let cell = cell_id.to_string();
    fixture
        .room
        .query(move |docs| docs.notebook().unwrap().outputs_json(&cell))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_stream_output_routed_to_cell() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k1",
            Some("m1"),
            json!({}),
            json!({"name": "stdout", "text": "hello\n"}),
        ))
        .await;

    let outputs = outputs_of(&fixture, "c1").await;
    assert_eq!(
        outputs,
        vec![json!({"output_type": "stream", "name": "stdout", "text": "hello\n"})]
    );
}

#[tokio::test]
async fn test_execute_request_marks_cell_busy_before_kernel_ack() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;

    let states = fixture
        .room
        .query(|docs| docs.awareness.local_state_field("cell_states").cloned())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(states["c1"], "busy");
}

#[tokio::test]
async fn test_reexecution_clears_outputs_and_restarts_indices() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k1",
            Some("m1"),
            json!({}),
            json!({"name": "stdout", "text": "first\n"}),
        ))
        .await;
    assert_eq!(outputs_of(&fixture, "c1").await.len(), 1);

    // A fresh execute-request for the same cell clears outputs immediately.
    fixture
        .bridge
        .handle_incoming_message(&execute_request("m2", "c1"))
        .await;
    assert!(outputs_of(&fixture, "c1").await.is_empty());

    // The next output lands at index 0 again.
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k2",
            Some("m2"),
            json!({}),
            json!({"name": "stdout", "text": "second\n"}),
        ))
        .await;
    let outputs = outputs_of(&fixture, "c1").await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0]["text"], "second\n");
}

#[tokio::test]
async fn test_update_display_data_targets_prior_index() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "display_data",
            "k1",
            Some("m1"),
            json!({}),
            json!({
                "data": {"text/plain": "v1"},
                "metadata": {},
                "transient": {"display_id": "d1"}
            }),
        ))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k2",
            Some("m1"),
            json!({}),
            json!({"name": "stdout", "text": "between\n"}),
        ))
        .await;

    // The display update replaces index 0, leaving the stream at index 1.
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "update_display_data",
            "k3",
            Some("m1"),
            json!({}),
            json!({
                "data": {"text/plain": "v2"},
                "metadata": {},
                "transient": {"display_id": "d1"}
            }),
        ))
        .await;

    let outputs = outputs_of(&fixture, "c1").await;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0]["data"]["text/plain"], "v2");
    assert_eq!(outputs[1]["text"], "between\n");
}

#[tokio::test]
async fn test_large_output_offloaded_to_store() {
    let config = Config {
        output_size_threshold: 64,
        ..Config::default()
    };
    let fixture = fixture(config).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    let big_text = "x".repeat(500);
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k1",
            Some("m1"),
            json!({}),
            json!({"name": "stdout", "text": big_text}),
        ))
        .await;

    // The document holds a reference payload, not the real output.
    let outputs = outputs_of(&fixture, "c1").await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0]["metadata"]["outputs_service"], true);
    let url = format!("/api/outputs/{}/c1/0", fixture.file_id);
    assert_eq!(
        outputs[0]["data"]["text/html"],
        format!("<a href=\"{url}\">Output</a>")
    );

    // The artifact is on disk at the documented layout with the full JSON.
    let artifact_path = fixture
        .outputs_path
        .join(&fixture.file_id)
        .join("c1")
        .join("0.output");
    let artifact: Value =
        serde_json::from_str(&std::fs::read_to_string(artifact_path).unwrap()).unwrap();
    assert_eq!(artifact["output_type"], "stream");
    assert_eq!(artifact["text"].as_str().unwrap().len(), 500);

    // And it is served by the output store.
    let served = fixture
        .context
        .outputs
        .read(&fixture.file_id, "c1", 0)
        .await
        .unwrap();
    assert_eq!(served, artifact);
}

#[tokio::test]
async fn test_status_updates_kernel_and_cell_state() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "status",
            "k1",
            Some("m1"),
            json!({}),
            json!({"execution_state": "busy"}),
        ))
        .await;

    // Parent was a shell message, so both kernel and cell state move.
    // Wait for the queued awareness commands to drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fixture.room.kernel_execution_state().as_deref(),
        Some("busy")
    );
    let cell = fixture
        .room
        .query(|docs| docs.notebook().unwrap().cell_json("c1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell["execution_state"], "busy");
}

#[tokio::test]
async fn test_execute_input_sets_execution_count() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_incoming_message(&execute_request("m1", "c1"))
        .await;
    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "execute_input",
            "k1",
            Some("m1"),
            json!({}),
            json!({"code": "print('hi')", "execution_count": 7}),
        ))
        .await;

    let cell = fixture
        .room
        .query(|docs| docs.notebook().unwrap().cell_json("c1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cell["execution_count"], 7);
}

#[tokio::test]
async fn test_kernel_info_reply_updates_language_info() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "shell",
            "kernel_info_reply",
            "k1",
            Some("i1"),
            json!({}),
            json!({"language_info": {"name": "python", "version": "3.12"}}),
        ))
        .await;

    let nb = fixture
        .room
        .query(|docs| docs.notebook().unwrap().to_source())
        .await
        .unwrap();
    assert_eq!(nb["metadata"]["language_info"]["name"], "python");
}

#[tokio::test]
async fn test_outputs_without_cell_binding_are_discarded() {
    let fixture = fixture(Config::default()).await;

    fixture
        .bridge
        .handle_kernel_message(&kernel_msg(
            "iopub",
            "stream",
            "k1",
            Some("unknown-parent"),
            json!({}),
            json!({"name": "stdout", "text": "orphan\n"}),
        ))
        .await;

    assert!(outputs_of(&fixture, "c1").await.is_empty());
}

#[test]
fn test_bridge_suppresses_handled_iopub_types() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let bridge = docsync::kernel::DocumentBridge::new(
        "k1",
        Arc::new(docsync::outputs::OutputStore::new(dir.path())),
        &config,
    );
    assert!(bridge.should_suppress("stream", "iopub"));
    assert!(bridge.should_suppress("status", "iopub"));
    assert!(!bridge.should_suppress("kernel_info_reply", "shell"));
    assert!(!bridge.should_suppress("comm_msg", "iopub"));
}
