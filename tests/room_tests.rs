//! End-to-end room behavior: handshake, convergence, protocol violations,
//! saves, out-of-band handling, and inactivity restarts.

use docsync::contents::{FsContentsStore, InMemoryFileIdIndexer};
use docsync::crdt::{self, notebook::NotebookView};
use docsync::events::RoomAction;
use docsync::room::{Room, RoomState};
use docsync::ws::client::ClientFrame;
use docsync::ws::protocol::{self, WsMessage};
use docsync::{AppContext, Config};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn sample_notebook() -> serde_json::Value {
    json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {},
        "cells": [{
            "id": "c1",
            "cell_type": "code",
            "source": "1+1",
            "metadata": {},
            "execution_count": null,
            "outputs": []
        }]
    })
}

struct TestServer {
    _dir: tempfile::TempDir,
    context: Arc<AppContext>,
    root: std::path::PathBuf,
}

fn test_server(config: Config) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("docs");
    std::fs::create_dir_all(&root).unwrap();
    let mut config = config;
    config.outputs_path = dir.path().join("outputs");
    let contents = Arc::new(FsContentsStore::new(root.clone()));
    let indexer = Arc::new(InMemoryFileIdIndexer::new());
    let context = AppContext::new(config, contents, indexer);
    TestServer {
        _dir: dir,
        context,
        root,
    }
}

fn fast_config() -> Config {
    Config {
        save_debounce_ms: 100,
        ..Config::default()
    }
}

/// Wait until a (re)started room is ready to accept clients again.
async fn wait_ready(room: &Arc<Room>) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while room.state() != RoomState::Ready {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("room never became ready");
}

/// Write a notebook file and return its room id.
fn seed_notebook(server: &TestServer, name: &str, notebook: &serde_json::Value) -> String {
    std::fs::write(
        server.root.join(name),
        serde_json::to_string_pretty(notebook).unwrap(),
    )
    .unwrap();
    let file_id = server.context.indexer.index(name);
    format!("json:notebook:{file_id}")
}

struct TestClient {
    id: String,
    rx: mpsc::UnboundedReceiver<ClientFrame>,
    doc: yrs::Doc,
}

impl TestClient {
    fn connect(room: &Arc<Room>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = room.clients().add(tx).unwrap();
        Self {
            id,
            rx,
            doc: crdt::new_doc(),
        }
    }

    async fn recv(&mut self) -> ClientFrame {
        tokio::time::timeout(Duration::from_secs(3), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("channel closed")
    }

    async fn recv_binary(&mut self) -> Vec<u8> {
        match self.recv().await {
            ClientFrame::Binary(data) => data,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    async fn recv_close(&mut self) -> u16 {
        loop {
            match self.recv().await {
                ClientFrame::Close(code) => return code,
                ClientFrame::Binary(_) => continue,
            }
        }
    }

    /// Run the two-way handshake against the room.
    async fn handshake(&mut self, room: &Arc<Room>) {
        let step1 = protocol::encode_sync_step1(&crdt::state_vector(&self.doc));
        room.add_message(&self.id, step1);

        let reply = self.recv_binary().await;
        match protocol::decode_message(&reply).unwrap() {
            WsMessage::SyncStep2 { update } => crdt::apply_update(&self.doc, &update).unwrap(),
            other => panic!("expected SyncStep2, got {other:?}"),
        }

        let server_step1 = self.recv_binary().await;
        match protocol::decode_message(&server_step1).unwrap() {
            WsMessage::SyncStep1 { state_vector } => {
                let diff = crdt::handle_sync_step1(&self.doc, &state_vector).unwrap();
                room.add_message(&self.id, protocol::encode_sync_step2(&diff));
            }
            other => panic!("expected SyncStep1, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_two_client_convergence() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(
        &server,
        "nb.ipynb",
        &json!({"nbformat": 4, "nbformat_minor": 5, "metadata": {}, "cells": []}),
    );
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut a = TestClient::connect(&room);
    let mut b = TestClient::connect(&room);
    a.handshake(&room).await;
    b.handshake(&room).await;

    // A inserts a cell locally and sends the incremental update.
    let updates: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let updates_in = updates.clone();
    let _sub = a
        .doc
        .observe_update_v1(move |_txn, event| updates_in.lock().unwrap().push(event.update.clone()))
        .unwrap();
    let view_a = NotebookView::new(&a.doc);
    view_a.insert_cell(
        0,
        &json!({
            "id": "c1",
            "cell_type": "code",
            "source": "1+1",
            "metadata": {},
            "execution_count": null,
            "outputs": []
        }),
    );
    let update = updates.lock().unwrap().last().unwrap().clone();
    room.add_message(&a.id, protocol::encode_update(&update));

    // B receives the broadcast SyncUpdate and converges.
    let frame = b.recv_binary().await;
    match protocol::decode_message(&frame).unwrap() {
        WsMessage::Update { update } => crdt::apply_update(&b.doc, &update).unwrap(),
        other => panic!("expected SyncUpdate, got {other:?}"),
    }

    let view_b = NotebookView::new(&b.doc);
    let nb_b = view_b.to_source();
    assert_eq!(nb_b["cells"].as_array().unwrap().len(), 1);
    assert_eq!(nb_b["cells"][0]["id"], "c1");
    assert_eq!(nb_b["cells"][0]["source"], "1+1");

    // The server replica holds the same cell.
    let server_nb = room
        .query(|docs| docs.notebook().unwrap().to_source())
        .await
        .unwrap();
    assert_eq!(server_nb["cells"][0]["id"], "c1");
    assert_eq!(server_nb["cells"][0]["source"], "1+1");
}

#[tokio::test]
async fn test_sync_update_from_desynced_client_is_a_protocol_violation() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut intruder = TestClient::connect(&room);
    let mut bystander = TestClient::connect(&room);
    bystander.handshake(&room).await;

    // No handshake: a SyncUpdate is a protocol violation.
    room.add_message(&intruder.id, protocol::encode_update(&[1, 2, 3]));
    assert_eq!(
        intruder.recv_close().await,
        protocol::CLOSE_PROTOCOL_VIOLATION
    );

    // The CRDT was not mutated and other clients are unaffected.
    let nb = room
        .query(|docs| docs.notebook().unwrap().to_source())
        .await
        .unwrap();
    assert_eq!(nb["cells"].as_array().unwrap().len(), 1);
    assert!(room.clients().is_synced(&bystander.id).unwrap());
}

#[tokio::test]
async fn test_awareness_frames_are_relayed_to_other_clients() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut a = TestClient::connect(&room);
    let mut b = TestClient::connect(&room);
    a.handshake(&room).await;
    b.handshake(&room).await;

    let update = docsync::crdt::awareness::AwarenessUpdate {
        entries: vec![docsync::crdt::awareness::AwarenessEntry {
            client_id: 7,
            clock: 1,
            state: Some(json!({"cursor": {"cell": "c1", "offset": 2}})),
        }],
    };
    let frame = protocol::encode_awareness(&update.encode());
    room.add_message(&a.id, frame.clone());

    let received = b.recv_binary().await;
    assert_eq!(received, frame);

    // Applied to the server's replica as well.
    let states = room.query(|docs| docs.awareness.states()).await.unwrap();
    assert_eq!(states[&7]["cursor"]["cell"], "c1");
}

#[tokio::test]
async fn test_edits_coalesce_into_one_save() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut events = server.context.events.subscribe();

    // A burst of edits inside one debounce window.
    for count in 1..=5i64 {
        room.with_docs(move |docs| {
            docs.notebook().unwrap().set_execution_count("c1", count);
        });
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut saves = 0;
    while let Ok(event) = events.try_recv() {
        if event.action == Some(RoomAction::Save) {
            saves += 1;
        }
    }
    assert_eq!(saves, 1, "a burst of edits must coalesce into one save");

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(server.root.join("nb.ipynb")).unwrap())
            .unwrap();
    assert_eq!(on_disk["cells"][0]["execution_count"], 5);

    // A later edit triggers a second save.
    room.with_docs(|docs| {
        docs.notebook().unwrap().set_execution_count("c1", 6);
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut saves = 0;
    while let Ok(event) = events.try_recv() {
        if event.action == Some(RoomAction::Save) {
            saves += 1;
        }
    }
    assert_eq!(saves, 1);
}

#[tokio::test]
async fn test_out_of_band_change_restarts_room_with_close_4000() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut client = TestClient::connect(&room);
    client.handshake(&room).await;

    // Mutate the backing file behind the server's back with a shifted mtime.
    let mut changed = sample_notebook();
    changed["cells"][0]["source"] = json!("2+2");
    let path = server.root.join("nb.ipynb");
    std::fs::write(&path, serde_json::to_string_pretty(&changed).unwrap()).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    // Clients are told to drop their state and reconnect.
    assert_eq!(
        client.recv_close().await,
        protocol::CLOSE_OUT_OF_BAND_CHANGE
    );

    // A reconnecting client observes the new content.
    wait_ready(&room).await;
    let mut reconnected = TestClient::connect(&room);
    reconnected.handshake(&room).await;
    let nb = NotebookView::new(&reconnected.doc).to_source();
    assert_eq!(nb["cells"][0]["source"], "2+2");
}

#[tokio::test]
async fn test_move_and_delete_close_codes() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;
    let mut client = TestClient::connect(&room);
    client.handshake(&room).await;

    room.handle_in_band_deletion().await;
    assert_eq!(client.recv_close().await, protocol::CLOSE_IN_BAND_DELETE);

    let room_id2 = seed_notebook(&server, "nb2.ipynb", &sample_notebook());
    let room2 = server.context.rooms.get_room(&room_id2).unwrap();
    room2.content_loaded().await;
    let mut client2 = TestClient::connect(&room2);
    client2.handshake(&room2).await;

    room2.handle_out_of_band_move().await;
    assert_eq!(client2.recv_close().await, protocol::CLOSE_OUT_OF_BAND_MOVE);
}

#[tokio::test]
async fn test_global_awareness_room_has_no_file() {
    let server = test_server(fast_config());
    let room = server
        .context
        .rooms
        .get_room("JupyterLab:globalAwareness")
        .unwrap();
    room.content_loaded().await;

    let mut a = TestClient::connect(&room);
    let mut b = TestClient::connect(&room);
    a.handshake(&room).await;
    b.handshake(&room).await;

    let update = docsync::crdt::awareness::AwarenessUpdate {
        entries: vec![docsync::crdt::awareness::AwarenessEntry {
            client_id: 11,
            clock: 1,
            state: Some(json!({"user": "ada"})),
        }],
    };
    let frame = protocol::encode_awareness(&update.encode());
    room.add_message(&a.id, frame.clone());
    assert_eq!(b.recv_binary().await, frame);
}

#[tokio::test]
async fn test_manager_delete_room_saves_final_content() {
    let server = test_server(fast_config());
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    room.with_docs(|docs| {
        docs.notebook().unwrap().set_execution_count("c1", 42);
    });

    assert!(server.context.rooms.delete_room(&room_id).await);
    assert!(!server.context.rooms.has_room(&room_id));
    // deleting twice reports failure
    assert!(!server.context.rooms.delete_room(&room_id).await);

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(server.root.join("nb.ipynb")).unwrap())
            .unwrap();
    assert_eq!(on_disk["cells"][0]["execution_count"], 42);
}

#[tokio::test]
async fn test_unknown_file_id_yields_no_room() {
    let server = test_server(fast_config());
    assert!(server
        .context
        .rooms
        .get_room("json:notebook:no-such-file-id")
        .is_none());
    assert!(server.context.rooms.get_room("not a room id").is_none());
}

#[tokio::test]
async fn test_inactive_updated_room_is_restarted_after_two_ticks() {
    let config = Config {
        room_inactivity_seconds: 1,
        save_debounce_ms: 100,
        ..Config::default()
    };
    let server = test_server(config);
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut events = server.context.events.subscribe();

    // Give the room history: no clients, no kernel, updated once.
    room.with_docs(|docs| {
        docs.notebook().unwrap().set_execution_count("c1", 1);
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(room.updated());

    // Two consecutive inactive ticks restart the room.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let mut reinitialized = false;
    while let Ok(event) = events.try_recv() {
        if event.action == Some(RoomAction::Initialize) && event.room_id == room_id {
            reinitialized = true;
        }
    }
    assert!(reinitialized, "room with history must be restarted");
    assert!(!room.updated(), "restart resets the history marker");

    // The room id stays alive and serves reconnecting clients.
    wait_ready(&room).await;
    let mut client = TestClient::connect(&room);
    client.handshake(&room).await;
}

#[tokio::test]
async fn test_never_updated_room_is_not_restarted() {
    let config = Config {
        room_inactivity_seconds: 1,
        save_debounce_ms: 100,
        ..Config::default()
    };
    let server = test_server(config);
    let room_id = seed_notebook(&server, "nb.ipynb", &sample_notebook());
    let room = server.context.rooms.get_room(&room_id).unwrap();
    room.content_loaded().await;

    let mut events = server.context.events.subscribe();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    while let Ok(event) = events.try_recv() {
        assert_ne!(
            event.action,
            Some(RoomAction::Initialize),
            "an un-updated room carries no history worth freeing"
        );
    }
    assert!(!room.is_stopped());
}
